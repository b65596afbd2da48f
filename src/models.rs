//! Input/output DTOs and the execution hand-off type
//!
//! Defines the HTTP request bodies, the member-list normalization shared by
//! every membership operation, and [`ExecutionResult`], the single artifact
//! passed from the execution pipeline back to the handlers.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Metadata included in all operation responses
///
/// Provides timing information and current UTC timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Meta {
    /// Current UTC timestamp in RFC 3339 format with milliseconds
    pub now_utc: String,
    /// Handler duration in milliseconds
    pub duration_ms: u64,
}

impl Meta {
    /// Create metadata populated with current time and elapsed duration
    pub fn now(duration_ms: u64) -> Self {
        Self {
            now_utc: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            duration_ms,
        }
    }
}

/// Normalized outcome of one script execution
///
/// Produced exactly once per script request, either by parsing the payload the
/// script printed or by synthesizing a failure from raw process output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    /// Whether the session itself completed
    pub success: bool,
    /// Operation-specific payload
    #[serde(default)]
    pub data: Option<serde_json::Value>,
    /// Failure reason, if any
    #[serde(default)]
    pub error: Option<String>,
    /// Ordered diagnostic log lines
    #[serde(default, deserialize_with = "string_or_seq")]
    pub logs: Vec<String>,
    /// Verbatim stdout, kept only when no payload could be parsed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_output: Option<String>,
}

impl ExecutionResult {
    /// Failure result with no payload
    pub fn failure(error: impl Into<String>, logs: Vec<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
            logs,
            raw_output: None,
        }
    }
}

/// Accept `null`, a single string, or an array of strings
///
/// `ConvertTo-Json` collapses single-element collections in some shapes, so
/// the payload's `logs` field is not guaranteed to be an array.
fn string_or_seq<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<Option<String>>),
    }

    Ok(match Option::<OneOrMany>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(OneOrMany::One(line)) => vec![line],
        Some(OneOrMany::Many(lines)) => lines.into_iter().flatten().collect(),
    })
}

/// Principal list as supplied by callers
///
/// Either a comma-separated string or an array of strings.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum MembersField {
    /// `"a@x.com, b@x.com"`
    Csv(String),
    /// `["a@x.com", "b@x.com"]`
    List(Vec<String>),
}

impl Default for MembersField {
    fn default() -> Self {
        Self::Csv(String::new())
    }
}

impl MembersField {
    /// Ordered, trimmed, non-empty principal identifiers
    pub fn normalize(&self) -> Vec<String> {
        match self {
            Self::Csv(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|m| !m.is_empty())
                .map(ToOwned::to_owned)
                .collect(),
            Self::List(items) => items
                .iter()
                .map(|m| m.trim())
                .filter(|m| !m.is_empty())
                .map(ToOwned::to_owned)
                .collect(),
        }
    }
}

/// Body: `POST /api/shared-mailbox/create`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateMailboxInput {
    /// Display name of the new mailbox
    pub mailbox_name: Option<String>,
    /// Primary SMTP address of the new mailbox
    pub mailbox_email: Option<String>,
    /// Optional Exchange alias
    pub mailbox_alias: Option<String>,
    /// Initial members (may be empty)
    #[serde(default)]
    pub members: MembersField,
    #[serde(default = "default_true")]
    pub full_access: bool,
    #[serde(default = "default_true")]
    pub send_as: bool,
    #[serde(default = "default_true")]
    pub send_on_behalf: bool,
    /// Whether Outlook auto-maps the mailbox for FullAccess holders
    #[serde(default = "default_true")]
    pub auto_mapping: bool,
}

/// Body: `POST /api/shared-mailbox/add-members`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddMembersInput {
    pub mailbox_email: Option<String>,
    #[serde(default)]
    pub members: MembersField,
    #[serde(default = "default_true")]
    pub full_access: bool,
    #[serde(default = "default_true")]
    pub send_as: bool,
    #[serde(default = "default_true")]
    pub send_on_behalf: bool,
    #[serde(default = "default_true")]
    pub auto_mapping: bool,
}

/// Body: `POST /api/shared-mailbox/remove-members`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoveMembersInput {
    pub mailbox_email: Option<String>,
    #[serde(default)]
    pub members: MembersField,
    #[serde(default = "default_true")]
    pub remove_full_access: bool,
    #[serde(default = "default_true")]
    pub remove_send_as: bool,
    #[serde(default = "default_true")]
    pub remove_send_on_behalf: bool,
    /// Free-text revocation reason, echoed into logs and the response
    #[serde(default = "default_reason")]
    pub reason: String,
}

/// Query: `?email=...`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MailboxQuery {
    pub email: Option<String>,
}

/// Body: `DELETE /api/shared-mailbox`
///
/// `confirm` is kept as a raw JSON value so that only a literal `true`
/// authorizes deletion.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteMailboxInput {
    pub mailbox_email: Option<String>,
    #[serde(default)]
    pub confirm: serde_json::Value,
}

/// Default value for permission toggles (true)
fn default_true() -> bool {
    true
}

/// Default revocation reason
fn default_reason() -> String {
    "Access revocation".to_owned()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{CreateMailboxInput, ExecutionResult, MembersField, RemoveMembersInput};

    #[test]
    fn normalizes_csv_members_in_order() {
        let members = MembersField::Csv(" a@x.com, ,b@x.com ,, c@x.com".to_owned());
        assert_eq!(members.normalize(), vec!["a@x.com", "b@x.com", "c@x.com"]);
    }

    #[test]
    fn normalizes_array_members_trimming_blanks() {
        let members = MembersField::List(vec![" a@x.com ".to_owned(), "   ".to_owned()]);
        assert_eq!(members.normalize(), vec!["a@x.com"]);
    }

    #[test]
    fn create_input_applies_defaults() {
        let input: CreateMailboxInput = serde_json::from_value(json!({
            "mailboxName": "Support",
            "mailboxEmail": "support@x.com",
            "members": ["a@x.com"]
        }))
        .expect("valid body");
        assert!(input.full_access && input.send_as && input.send_on_behalf && input.auto_mapping);
        assert_eq!(input.members.normalize(), vec!["a@x.com"]);
    }

    #[test]
    fn remove_input_defaults_reason() {
        let input: RemoveMembersInput =
            serde_json::from_value(json!({ "mailboxEmail": "s@x.com" })).expect("valid body");
        assert_eq!(input.reason, "Access revocation");
        assert!(input.members.normalize().is_empty());
    }

    #[test]
    fn execution_result_accepts_scalar_logs() {
        let result: ExecutionResult =
            serde_json::from_str(r#"{"success":true,"data":null,"error":null,"logs":"only"}"#)
                .expect("payload parses");
        assert_eq!(result.logs, vec!["only"]);
        assert!(result.success);
    }

    #[test]
    fn execution_result_requires_success_flag() {
        let parsed = serde_json::from_str::<ExecutionResult>(r#"{"logs":[]}"#);
        assert!(parsed.is_err());
    }
}
