//! Script template engine
//!
//! Composes each mailbox operation as an ordered list of typed [`Statement`]
//! nodes and renders them to PowerShell only at the boundary. Composition is
//! interpreter-agnostic and can be inspected without spawning anything.
//!
//! Every caller-supplied value is rendered as a single-quoted literal via
//! [`ps_quote`]; nothing from a request is ever interpolated by the
//! interpreter.

use std::fmt;

use crate::errors::{AppError, AppResult};

/// Mailbox operation exposed by the API
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    CreateMailbox,
    AddMembers,
    RemoveMembers,
    ListPermissions,
    DeleteMailbox,
}

impl Operation {
    /// Stable kebab-case name, used in logs and temp file names
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CreateMailbox => "create-mailbox",
            Self::AddMembers => "add-members",
            Self::RemoveMembers => "remove-members",
            Self::ListPermissions => "list-permissions",
            Self::DeleteMailbox => "delete-mailbox",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Permission kind grantable per principal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionKind {
    FullAccess,
    SendAs,
    SendOnBehalf,
}

impl PermissionKind {
    /// Fixed application order per principal
    pub const ORDER: [Self; 3] = [Self::FullAccess, Self::SendAs, Self::SendOnBehalf];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::FullAccess => "FullAccess",
            Self::SendAs => "SendAs",
            Self::SendOnBehalf => "SendOnBehalf",
        }
    }
}

/// Which permission kinds a request enables
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PermissionSet {
    pub full_access: bool,
    pub send_as: bool,
    pub send_on_behalf: bool,
}

impl PermissionSet {
    /// Enabled kinds in [`PermissionKind::ORDER`]
    pub fn enabled(self) -> impl Iterator<Item = PermissionKind> {
        PermissionKind::ORDER.into_iter().filter(move |kind| match kind {
            PermissionKind::FullAccess => self.full_access,
            PermissionKind::SendAs => self.send_as,
            PermissionKind::SendOnBehalf => self.send_on_behalf,
        })
    }
}

/// One (principal, kind) pair inside a plan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionGrant {
    pub principal: String,
    pub kind: PermissionKind,
}

impl PermissionGrant {
    /// Audit-list entry, e.g. `SendAs:a@x.com`
    pub fn audit_entry(&self) -> String {
        format!("{}:{}", self.kind.as_str(), self.principal)
    }
}

/// Parameters for a new shared mailbox
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMailbox {
    pub name: String,
    pub email: String,
    pub alias: Option<String>,
}

/// Precondition checked before any mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Guard {
    /// Abort the session if the mailbox already exists
    MustNotExist,
    /// Abort the session unless the mailbox exists; binds `$mailbox`
    MustExist,
}

/// Audit list a sub-operation records into
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditList {
    Granted,
    Revoked,
}

impl AuditList {
    fn field(self) -> &'static str {
        match self {
            Self::Granted => "permissionsGranted",
            Self::Revoked => "permissionsRevoked",
        }
    }
}

/// Member bookkeeping list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberList {
    Added,
    Removed,
}

impl MemberList {
    fn field(self) -> &'static str {
        match self {
            Self::Added => "membersAdded",
            Self::Removed => "membersRemoved",
        }
    }
}

/// Shape of the `data` payload an operation fills in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataShape {
    Created,
    Membership(AuditList),
    Permissions,
    Deleted,
}

/// A single typed script statement
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Statement {
    Log(String),
    Guard(Guard),
    CreateMailbox(NewMailbox),
    InitData(DataShape),
    Grant {
        grant: PermissionGrant,
        auto_mapping: bool,
    },
    Revoke(PermissionGrant),
    RecordMember {
        principal: String,
        list: MemberList,
    },
    CollectPermissions,
    RemoveMailbox,
    Aggregate(AuditList),
}

/// Rendered script body plus the identity it targets
///
/// Ephemeral: built per API call and consumed by the executor.
#[derive(Debug, Clone)]
pub struct ScriptRequest {
    pub operation: Operation,
    pub mailbox: String,
    pub body: String,
}

/// Ordered statement list for one operation against one mailbox
#[derive(Debug, Clone)]
pub struct ScriptPlan {
    operation: Operation,
    identity: String,
    statements: Vec<Statement>,
}

impl ScriptPlan {
    /// Create a shared mailbox and grant initial members
    ///
    /// An empty member list is accepted and yields a mailbox with no grants.
    pub fn create_mailbox(
        mailbox: &NewMailbox,
        members: &[String],
        permissions: PermissionSet,
        auto_mapping: bool,
    ) -> Self {
        let mut statements = vec![
            Statement::Log(format!("Creating shared mailbox: {}", mailbox.email)),
            Statement::Guard(Guard::MustNotExist),
            Statement::CreateMailbox(mailbox.clone()),
            Statement::Log("Mailbox created successfully!".to_owned()),
            Statement::InitData(DataShape::Created),
        ];
        push_membership(
            &mut statements,
            members,
            permissions,
            MemberList::Added,
            |grant| Statement::Grant {
                grant,
                auto_mapping,
            },
        );
        statements.push(Statement::Aggregate(AuditList::Granted));

        Self {
            operation: Operation::CreateMailbox,
            identity: mailbox.email.clone(),
            statements,
        }
    }

    /// Grant permissions on an existing mailbox
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if `members` is empty.
    pub fn add_members(
        identity: &str,
        members: &[String],
        permissions: PermissionSet,
        auto_mapping: bool,
    ) -> AppResult<Self> {
        require_members(members)?;
        let mut statements = vec![
            Statement::Log(format!("Adding members to: {identity}")),
            Statement::Guard(Guard::MustExist),
            Statement::InitData(DataShape::Membership(AuditList::Granted)),
        ];
        push_membership(
            &mut statements,
            members,
            permissions,
            MemberList::Added,
            |grant| Statement::Grant {
                grant,
                auto_mapping,
            },
        );
        statements.push(Statement::Aggregate(AuditList::Granted));

        Ok(Self {
            operation: Operation::AddMembers,
            identity: identity.to_owned(),
            statements,
        })
    }

    /// Revoke permissions on an existing mailbox
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if `members` is empty.
    pub fn remove_members(
        identity: &str,
        members: &[String],
        permissions: PermissionSet,
        reason: &str,
    ) -> AppResult<Self> {
        require_members(members)?;
        let mut statements = vec![
            Statement::Log(format!("Removing members from: {identity}")),
            Statement::Log(format!("Reason: {reason}")),
            Statement::Guard(Guard::MustExist),
            Statement::InitData(DataShape::Membership(AuditList::Revoked)),
        ];
        push_membership(
            &mut statements,
            members,
            permissions,
            MemberList::Removed,
            Statement::Revoke,
        );
        statements.push(Statement::Aggregate(AuditList::Revoked));

        Ok(Self {
            operation: Operation::RemoveMembers,
            identity: identity.to_owned(),
            statements,
        })
    }

    /// Read FullAccess, SendAs and SendOnBehalf holders
    pub fn list_permissions(identity: &str) -> Self {
        Self {
            operation: Operation::ListPermissions,
            identity: identity.to_owned(),
            statements: vec![
                Statement::Log(format!("Getting permissions for: {identity}")),
                Statement::Guard(Guard::MustExist),
                Statement::InitData(DataShape::Permissions),
                Statement::CollectPermissions,
                Statement::Log("Permissions retrieved".to_owned()),
            ],
        }
    }

    /// Remove an existing mailbox
    pub fn delete_mailbox(identity: &str) -> Self {
        Self {
            operation: Operation::DeleteMailbox,
            identity: identity.to_owned(),
            statements: vec![
                Statement::Log(format!("Deleting shared mailbox: {identity}")),
                Statement::Guard(Guard::MustExist),
                Statement::InitData(DataShape::Deleted),
                Statement::RemoveMailbox,
                Statement::Log("Mailbox deleted successfully".to_owned()),
            ],
        }
    }

    pub fn operation(&self) -> Operation {
        self.operation
    }

    pub fn statements(&self) -> &[Statement] {
        &self.statements
    }

    /// Grants and revokes in execution order
    pub fn permission_changes(&self) -> impl Iterator<Item = &PermissionGrant> {
        self.statements.iter().filter_map(|s| match s {
            Statement::Grant { grant, .. } | Statement::Revoke(grant) => Some(grant),
            _ => None,
        })
    }

    /// Render the plan as a PowerShell script body
    pub fn render(&self) -> String {
        let mut out = format!("$identity = {}\n", ps_quote(&self.identity));
        for statement in &self.statements {
            out.push_str(&render_statement(statement));
            out.push('\n');
        }
        out
    }

    /// Render and package for execution
    pub fn into_request(self) -> ScriptRequest {
        let body = self.render();
        ScriptRequest {
            operation: self.operation,
            mailbox: self.identity,
            body,
        }
    }
}

fn require_members(members: &[String]) -> AppResult<()> {
    if members.is_empty() {
        return Err(AppError::invalid("At least one member is required"));
    }
    Ok(())
}

/// One statement per (principal × enabled kind), then the member record
///
/// Principals keep caller order; kinds follow [`PermissionKind::ORDER`].
fn push_membership(
    statements: &mut Vec<Statement>,
    members: &[String],
    permissions: PermissionSet,
    list: MemberList,
    make: impl Fn(PermissionGrant) -> Statement,
) {
    for principal in members {
        for kind in permissions.enabled() {
            statements.push(make(PermissionGrant {
                principal: principal.clone(),
                kind,
            }));
        }
        statements.push(Statement::RecordMember {
            principal: principal.clone(),
            list,
        });
    }
}

/// Quote a value as a PowerShell verbatim string
///
/// PowerShell treats the typographic single quotes as quote characters too,
/// so each of them is doubled along with `'`.
pub fn ps_quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('\'');
    for ch in value.chars() {
        if matches!(ch, '\'' | '\u{2018}' | '\u{2019}' | '\u{201A}' | '\u{201B}') {
            out.push(ch);
        }
        out.push(ch);
    }
    out.push('\'');
    out
}

fn render_statement(statement: &Statement) -> String {
    match statement {
        Statement::Log(line) => format!("$result.logs += {}", ps_quote(line)),
        Statement::Guard(Guard::MustNotExist) => "\
$existing = Get-Mailbox -Identity $identity -ErrorAction SilentlyContinue
if ($existing) {
    throw (\"Mailbox '\" + $identity + \"' already exists\")
}"
        .to_owned(),
        Statement::Guard(Guard::MustExist) => "\
$mailbox = Get-Mailbox -Identity $identity -ErrorAction Stop
$result.logs += ('Found mailbox: ' + $mailbox.DisplayName)"
            .to_owned(),
        Statement::CreateMailbox(mailbox) => {
            let alias = mailbox
                .alias
                .as_deref()
                .map(|a| format!(" -Alias {}", ps_quote(a)))
                .unwrap_or_default();
            format!(
                "$mailbox = New-Mailbox -Shared -Name {name} -DisplayName {name} -PrimarySmtpAddress $identity{alias} -ErrorAction Stop",
                name = ps_quote(&mailbox.name),
            )
        }
        Statement::InitData(shape) => render_data(*shape),
        Statement::Grant {
            grant,
            auto_mapping,
        } => render_change(grant, AuditList::Granted, &grant_command(grant, *auto_mapping)),
        Statement::Revoke(grant) => {
            render_change(grant, AuditList::Revoked, &revoke_command(grant))
        }
        Statement::RecordMember { principal, list } => {
            format!("$result.data.{} += {}", list.field(), ps_quote(principal))
        }
        Statement::CollectPermissions => "\
$fullAccess = Get-MailboxPermission -Identity $identity | Where-Object { $_.User -notlike 'NT AUTHORITY*' -and $_.User -notlike 'S-1-5*' -and $_.AccessRights -contains 'FullAccess' }
$result.data.fullAccess = @($fullAccess | ForEach-Object { $_.User.ToString() })
$sendAs = Get-RecipientPermission -Identity $identity | Where-Object { $_.Trustee -notlike 'NT AUTHORITY*' -and $_.Trustee -notlike 'S-1-5*' }
$result.data.sendAs = @($sendAs | ForEach-Object { $_.Trustee.ToString() })
$result.data.sendOnBehalf = @($mailbox.GrantSendOnBehalfTo | ForEach-Object { $_.ToString() })"
            .to_owned(),
        Statement::RemoveMailbox => {
            "Remove-Mailbox -Identity $identity -Confirm:$false -ErrorAction Stop".to_owned()
        }
        Statement::Aggregate(list) => format!(
            "$result.logs += ('Applied ' + @($result.data.{field}).Count + ' permission change(s) with ' + @($result.data.errors).Count + ' error(s)')",
            field = list.field(),
        ),
    }
}

fn render_data(shape: DataShape) -> String {
    match shape {
        DataShape::Created => "\
$result.data = [ordered]@{
    id = [string]$mailbox.ExternalDirectoryObjectId
    name = $mailbox.Name
    displayName = $mailbox.DisplayName
    email = [string]$mailbox.PrimarySmtpAddress
    alias = $mailbox.Alias
    type = 'SharedMailbox'
    membersAdded = @()
    permissionsGranted = @()
    errors = @()
}"
        .to_owned(),
        DataShape::Membership(list) => {
            let members = match list {
                AuditList::Granted => MemberList::Added,
                AuditList::Revoked => MemberList::Removed,
            };
            format!(
                "\
$result.data = [ordered]@{{
    mailbox = [string]$mailbox.PrimarySmtpAddress
    displayName = $mailbox.DisplayName
    {members} = @()
    {audit} = @()
    errors = @()
}}",
                members = members.field(),
                audit = list.field(),
            )
        }
        DataShape::Permissions => "\
$result.data = [ordered]@{
    mailbox = [ordered]@{
        displayName = $mailbox.DisplayName
        email = [string]$mailbox.PrimarySmtpAddress
        type = [string]$mailbox.RecipientTypeDetails
    }
    fullAccess = @()
    sendAs = @()
    sendOnBehalf = @()
}"
        .to_owned(),
        DataShape::Deleted => "\
$result.data = [ordered]@{
    deletedMailbox = $mailbox.DisplayName
    email = [string]$mailbox.PrimarySmtpAddress
}"
        .to_owned(),
    }
}

fn grant_command(grant: &PermissionGrant, auto_mapping: bool) -> String {
    let principal = ps_quote(&grant.principal);
    match grant.kind {
        PermissionKind::FullAccess => {
            let mapping = if auto_mapping { "" } else { " -AutoMapping $false" };
            format!(
                "Add-MailboxPermission -Identity $identity -User {principal} -AccessRights FullAccess -InheritanceType All{mapping} -ErrorAction Stop | Out-Null"
            )
        }
        PermissionKind::SendAs => format!(
            "Add-RecipientPermission -Identity $identity -Trustee {principal} -AccessRights SendAs -Confirm:$false -ErrorAction Stop | Out-Null"
        ),
        PermissionKind::SendOnBehalf => format!(
            "Set-Mailbox -Identity $identity -GrantSendOnBehalfTo @{{Add={principal}}} -ErrorAction Stop"
        ),
    }
}

fn revoke_command(grant: &PermissionGrant) -> String {
    let principal = ps_quote(&grant.principal);
    match grant.kind {
        PermissionKind::FullAccess => format!(
            "Remove-MailboxPermission -Identity $identity -User {principal} -AccessRights FullAccess -InheritanceType All -Confirm:$false -ErrorAction Stop | Out-Null"
        ),
        PermissionKind::SendAs => format!(
            "Remove-RecipientPermission -Identity $identity -Trustee {principal} -AccessRights SendAs -Confirm:$false -ErrorAction Stop | Out-Null"
        ),
        PermissionKind::SendOnBehalf => format!(
            "Set-Mailbox -Identity $identity -GrantSendOnBehalfTo @{{Remove={principal}}} -ErrorAction Stop"
        ),
    }
}

/// Wrap one sub-operation so its failure is recorded, not propagated
fn render_change(grant: &PermissionGrant, list: AuditList, command: &str) -> String {
    let kind = grant.kind.as_str();
    let (done, failed) = match list {
        AuditList::Granted => (
            format!("{kind} granted to {}", grant.principal),
            format!("Failed {kind} for {}: ", grant.principal),
        ),
        AuditList::Revoked => (
            format!("{kind} removed from {}", grant.principal),
            format!("Failed to remove {kind} from {}: ", grant.principal),
        ),
    };
    format!(
        "\
try {{
    {command}
    $result.data.{field} += {entry}
    $result.logs += {done}
}} catch {{
    $result.data.errors += ({error_prefix} + $_.Exception.Message)
    $result.logs += ({failed} + $_.Exception.Message)
}}",
        field = list.field(),
        entry = ps_quote(&grant.audit_entry()),
        done = ps_quote(&done),
        error_prefix = ps_quote(&format!("{}:", grant.audit_entry())),
        failed = ps_quote(&failed),
    )
}
