//! Session wrapper and credential material lifecycle
//!
//! [`SessionWrapper`] embeds an operation body between connect-setup and
//! disconnect-teardown boilerplate. The wrapped script always prints one
//! compressed JSON result object as its final stdout line, even when the
//! connection itself fails.
//!
//! [`CredentialFile`] owns the decoded certificate on disk for the duration
//! of one session and removes it on drop.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::config::ExchangeCredentials;
use crate::errors::{AppError, AppResult};
use crate::script::{ScriptRequest, ps_quote};

/// Environment variable through which the child receives the certificate
/// passphrase; it is never written into the script file.
pub const CERT_PASSWORD_ENV: &str = "MAILBOX_API_CERT_PASSWORD";

/// Builds complete, self-contained session scripts
#[derive(Debug, Clone)]
pub struct SessionWrapper {
    app_id: String,
    organization: String,
}

impl SessionWrapper {
    pub fn new(credentials: &ExchangeCredentials) -> Self {
        Self {
            app_id: credentials.app_id.clone(),
            organization: credentials.organization.clone(),
        }
    }

    /// Wrap `request.body` with connect/teardown and the result contract
    ///
    /// The produced script:
    /// 1. initializes `$result` so it is well-formed on every path
    /// 2. imports the module and connects with the certificate at `credential`
    /// 3. runs the body; any terminating error lands in `$result.error`
    /// 4. disconnects and deletes the certificate in `finally`
    /// 5. prints `$result` as a single JSON line
    pub fn wrap(&self, request: &ScriptRequest, credential: &Path) -> String {
        let body = indent(&request.body, "    ");
        format!(
            "\
$ErrorActionPreference = 'Continue'
$ProgressPreference = 'SilentlyContinue'
$result = [ordered]@{{
    success = $false
    data = $null
    error = $null
    logs = @()
}}
$tempCertPath = {cert_path}

try {{
    $result.logs += 'Importing Exchange Online module...'
    Import-Module ExchangeOnlineManagement -ErrorAction Stop

    $result.logs += 'Connecting to Exchange Online...'
    $certPassword = ConvertTo-SecureString ([string]$env:{password_env}) -AsPlainText -Force
    Connect-ExchangeOnline -AppId {app_id} -Organization {organization} -CertificateFilePath $tempCertPath -CertificatePassword $certPassword -ShowBanner:$false -ErrorAction Stop
    $result.logs += 'Connected successfully!'

{body}
    $result.success = $true
}}
catch {{
    $result.error = $_.Exception.Message
    $result.logs += ('ERROR: ' + $_.Exception.Message)
}}
finally {{
    try {{
        Disconnect-ExchangeOnline -Confirm:$false -ErrorAction SilentlyContinue | Out-Null
        $result.logs += 'Disconnected from Exchange Online'
    }} catch {{}}
    try {{
        if ($tempCertPath -and (Test-Path -LiteralPath $tempCertPath)) {{
            Remove-Item -LiteralPath $tempCertPath -Force -ErrorAction SilentlyContinue
        }}
    }} catch {{}}
}}

$result | ConvertTo-Json -Depth 10 -Compress
",
            cert_path = ps_quote(&credential.to_string_lossy()),
            password_env = CERT_PASSWORD_ENV,
            app_id = ps_quote(&self.app_id),
            organization = ps_quote(&self.organization),
        )
    }
}

fn indent(text: &str, prefix: &str) -> String {
    text.lines()
        .map(|line| {
            if line.is_empty() {
                String::new()
            } else {
                format!("{prefix}{line}")
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Certificate written to a private path for one session
///
/// Removed when dropped, on every exit path including panics and task
/// cancellation. Removal errors are logged, never propagated.
#[derive(Debug)]
pub struct CredentialFile {
    path: PathBuf,
}

impl CredentialFile {
    /// Write `bytes` to a fresh `cert_<uuid>.pfx` in `dir` with mode 0600
    ///
    /// # Errors
    ///
    /// Returns `Internal` if the file cannot be created or written. A
    /// partially written file is removed before returning.
    pub fn write(dir: &Path, bytes: &[u8]) -> AppResult<Self> {
        let path = dir.join(format!("cert_{}.pfx", Uuid::new_v4().simple()));
        let mut file = private_file(&path).map_err(|e| {
            AppError::Internal(format!("failed to create credential file: {e}"))
        })?;
        // From here on the guard owns the path, so a failed write still cleans up.
        let guard = Self { path };
        file.write_all(bytes)
            .and_then(|()| file.sync_all())
            .map_err(|e| AppError::Internal(format!("failed to write credential file: {e}")))?;
        Ok(guard)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for CredentialFile {
    fn drop(&mut self) {
        remove_quietly(&self.path, "credential");
    }
}

/// Create a new file readable only by the current user
pub(crate) fn private_file(path: &Path) -> std::io::Result<fs::File> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options.open(path)
}

/// Best-effort removal; a missing file is not an error
pub(crate) fn remove_quietly(path: &Path, kind: &str) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to remove {kind} file");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::Arc;

    use secrecy::{SecretSlice, SecretString};

    use super::{CERT_PASSWORD_ENV, CredentialFile, SessionWrapper};
    use crate::config::ExchangeCredentials;
    use crate::script::ScriptPlan;

    fn credentials() -> ExchangeCredentials {
        ExchangeCredentials {
            app_id: "app-123".to_owned(),
            tenant_id: None,
            organization: "contoso.onmicrosoft.com".to_owned(),
            certificate: Arc::new(SecretSlice::from(vec![1, 2, 3])),
            certificate_password: SecretString::new("pfx-secret".into()),
        }
    }

    #[test]
    fn wraps_body_between_connect_and_teardown() {
        let request = ScriptPlan::delete_mailbox("s@x.com").into_request();
        let script = SessionWrapper::new(&credentials())
            .wrap(&request, Path::new("/tmp/cert_abc.pfx"));

        let connect = script.find("Connect-ExchangeOnline").expect("connect");
        let body = script.find("Remove-Mailbox").expect("body");
        let teardown = script.find("Disconnect-ExchangeOnline").expect("disconnect");
        let output = script.find("ConvertTo-Json").expect("output");
        assert!(connect < body && body < teardown && teardown < output);

        assert!(script.contains("-AppId 'app-123' -Organization 'contoso.onmicrosoft.com'"));
        assert!(script.contains("$tempCertPath = '/tmp/cert_abc.pfx'"));
        assert!(script.contains(&format!("$env:{CERT_PASSWORD_ENV}")));
        assert!(script.trim_end().ends_with("$result | ConvertTo-Json -Depth 10 -Compress"));
    }

    #[test]
    fn wrapped_script_never_contains_passphrase() {
        let request = ScriptPlan::list_permissions("s@x.com").into_request();
        let script = SessionWrapper::new(&credentials()).wrap(&request, Path::new("/tmp/c.pfx"));
        assert!(!script.contains("pfx-secret"));
    }

    #[test]
    fn teardown_runs_in_finally_block() {
        let request = ScriptPlan::list_permissions("s@x.com").into_request();
        let script = SessionWrapper::new(&credentials()).wrap(&request, Path::new("/tmp/c.pfx"));
        let finally = script.find("finally {").expect("finally block");
        assert!(script[finally..].contains("Remove-Item -LiteralPath $tempCertPath"));
        assert!(script.contains("$result.error = $_.Exception.Message"));
    }

    #[test]
    fn credential_file_is_private_and_removed_on_drop() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = {
            let file = CredentialFile::write(dir.path(), b"pfx-bytes").expect("write");
            assert_eq!(std::fs::read(file.path()).expect("read"), b"pfx-bytes");
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let mode = std::fs::metadata(file.path()).expect("meta").permissions().mode();
                assert_eq!(mode & 0o777, 0o600);
            }
            file.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[test]
    fn credential_drop_tolerates_already_removed_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = CredentialFile::write(dir.path(), b"x").expect("write");
        std::fs::remove_file(file.path()).expect("external removal");
        drop(file);
    }

    /// Runs the shape the wrapper prints when `Connect-ExchangeOnline` throws:
    /// catch fills `error` and logs, finally removes the certificate, and the
    /// result object is still the last stdout line.
    #[cfg(unix)]
    #[tokio::test]
    async fn connection_failure_still_yields_structured_result() {
        use std::time::Duration;

        use crate::extract::extract;
        use crate::runner::ScriptRunner;

        let dir = tempfile::tempdir().expect("tempdir");
        let credential = CredentialFile::write(dir.path(), b"pfx").expect("write");
        let request = ScriptPlan::list_permissions("s@x.com").into_request();
        let wrapped = SessionWrapper::new(&credentials()).wrap(&request, credential.path());
        assert!(wrapped.contains("success = $false\n    data = $null"));
        assert!(wrapped.contains("$result.logs += ('ERROR: ' + $_.Exception.Message)"));

        let failure_shape = format!(
            "echo 'WARNING: The module is deprecated'\n\
             rm -f '{cert}'\n\
             printf '%s\\n' '{{\"success\":false,\"data\":null,\"error\":\"certificate rejected\",\
             \"logs\":[\"Importing Exchange Online module...\",\"Connecting to Exchange Online...\",\
             \"ERROR: certificate rejected\",\"Disconnected from Exchange Online\"]}}'\n",
            cert = credential.path().display()
        );
        let runner = ScriptRunner::new(
            "sh",
            Vec::new(),
            Duration::from_secs(10),
            dir.path().to_path_buf(),
            1,
        );
        let permit = runner.acquire().await.expect("permit");
        let output = permit.execute("connect", &failure_shape, &[]).await.expect("runs");
        let result = extract(&output);

        assert!(!result.success);
        assert!(result.data.is_none());
        assert_eq!(result.error.as_deref(), Some("certificate rejected"));
        assert_eq!(result.logs[2], "ERROR: certificate rejected");
        assert!(result.raw_output.is_none());
        assert!(!credential.path().exists());
        drop(credential);
        assert_eq!(std::fs::read_dir(dir.path()).expect("read dir").count(), 0);
    }
}
