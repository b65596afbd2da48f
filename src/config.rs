//! Configuration module for service credentials and runtime settings
//!
//! All configuration is loaded from environment variables once at start-up.
//! The resulting [`ServerConfig`] is immutable and shared by reference with
//! every request handler.

use std::env;
use std::env::VarError;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use secrecy::{SecretSlice, SecretString};

use crate::errors::{AppError, AppResult};

/// Certificate-based credentials for the remote Exchange Online session
///
/// Certificate bytes and passphrase are stored using `secrecy` types to
/// prevent accidental logging.
#[derive(Debug, Clone)]
pub struct ExchangeCredentials {
    /// Azure AD application (client) identifier
    pub app_id: String,
    /// Azure AD tenant identifier, if configured
    pub tenant_id: Option<String>,
    /// Organization passed to `Connect-ExchangeOnline`
    pub organization: String,
    /// Decoded PFX certificate bytes
    pub certificate: Arc<SecretSlice<u8>>,
    /// Passphrase protecting the certificate
    pub certificate_password: SecretString,
}

/// Subprocess execution settings
#[derive(Debug, Clone)]
pub struct ExecutionConfig {
    /// Automation interpreter program (usually `pwsh`)
    pub interpreter: String,
    /// Hard wall-clock limit for a single subprocess run
    pub timeout: Duration,
    /// Maximum number of concurrently running subprocesses
    pub max_concurrent: usize,
    /// Private directory for temporary script and credential files
    pub work_dir: PathBuf,
}

/// Server-wide configuration
///
/// Cloned into request handlers via `Arc` for thread-safe shared access.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Shared secret expected in `X-API-Key` / `Authorization: Bearer`
    pub api_key: SecretString,
    /// Remote session credentials
    pub exchange: ExchangeCredentials,
    /// Subprocess settings
    pub execution: ExecutionConfig,
    /// Listen address
    pub bind: IpAddr,
    /// Listen port
    pub port: u16,
    /// Free-form environment label reported by `/health`
    pub environment: String,
}

impl ServerConfig {
    /// Load all configuration from environment variables
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if required environment variables are missing
    /// or malformed.
    ///
    /// # Example Environment
    ///
    /// ```text
    /// API_KEY=change-me
    /// AZURE_CLIENT_ID=00000000-0000-0000-0000-000000000000
    /// AZURE_TENANT_ID=11111111-1111-1111-1111-111111111111
    /// EXCHANGE_ORG=contoso.onmicrosoft.com
    /// AZURE_CERT_BASE64=MIIK...
    /// AZURE_CERT_PASSWORD=pfx-pass
    /// PORT=3000
    /// MAILBOX_API_EXEC_TIMEOUT_MS=120000
    /// ```
    pub fn load_from_env() -> AppResult<Self> {
        let tenant_id = optional_env("AZURE_TENANT_ID")?;
        let organization = match optional_env("EXCHANGE_ORG")? {
            Some(org) => org,
            None => tenant_id.clone().ok_or_else(|| {
                AppError::invalid("missing required environment variable EXCHANGE_ORG")
            })?,
        };

        let certificate = decode_certificate(&required_env("AZURE_CERT_BASE64")?)?;
        let certificate_password = optional_env("AZURE_CERT_PASSWORD")?.unwrap_or_default();

        let exchange = ExchangeCredentials {
            app_id: required_env("AZURE_CLIENT_ID")?,
            tenant_id,
            organization,
            certificate: Arc::new(SecretSlice::from(certificate)),
            certificate_password: SecretString::new(certificate_password.into()),
        };

        let max_concurrent = parse_usize_env("MAILBOX_API_MAX_CONCURRENT", 4)?;
        if max_concurrent == 0 {
            return Err(AppError::invalid(
                "MAILBOX_API_MAX_CONCURRENT must be at least 1",
            ));
        }

        let execution = ExecutionConfig {
            interpreter: optional_env("MAILBOX_API_INTERPRETER")?
                .unwrap_or_else(|| "pwsh".to_owned()),
            timeout: Duration::from_millis(parse_u64_env("MAILBOX_API_EXEC_TIMEOUT_MS", 120_000)?),
            max_concurrent,
            work_dir: optional_env("MAILBOX_API_WORK_DIR")?
                .map(PathBuf::from)
                .unwrap_or_else(env::temp_dir),
        };

        Ok(Self {
            api_key: SecretString::new(required_env("API_KEY")?.into()),
            exchange,
            execution,
            bind: parse_ip_env("MAILBOX_API_BIND", IpAddr::from([0, 0, 0, 0]))?,
            port: parse_u16_env("PORT", 3000)?,
            environment: optional_env("MAILBOX_API_ENVIRONMENT")?
                .unwrap_or_else(|| "development".to_owned()),
        })
    }
}

/// Decode the base64 certificate blob, tolerating embedded whitespace
fn decode_certificate(encoded: &str) -> AppResult<Vec<u8>> {
    let compact: String = encoded.chars().filter(|ch| !ch.is_whitespace()).collect();
    let bytes = STANDARD
        .decode(compact.as_bytes())
        .map_err(|e| AppError::invalid(format!("AZURE_CERT_BASE64 is not valid base64: {e}")))?;
    if bytes.is_empty() {
        return Err(AppError::invalid("AZURE_CERT_BASE64 decodes to an empty certificate"));
    }
    Ok(bytes)
}

/// Read a required environment variable, returning error if missing or empty
fn required_env(key: &str) -> AppResult<String> {
    match env::var(key) {
        Ok(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(AppError::InvalidInput(format!(
            "missing required environment variable {key}"
        ))),
    }
}

/// Read an optional environment variable; blank values count as unset
fn optional_env(key: &str) -> AppResult<Option<String>> {
    match env::var(key) {
        Ok(v) if v.trim().is_empty() => Ok(None),
        Ok(v) => Ok(Some(v.trim().to_owned())),
        Err(VarError::NotPresent) => Ok(None),
        Err(VarError::NotUnicode(_)) => Err(AppError::InvalidInput(format!(
            "environment variable {key} contains non-unicode data"
        ))),
    }
}

/// Parse a `u16` environment variable with default fallback
fn parse_u16_env(key: &str, default: u16) -> AppResult<u16> {
    match optional_env(key)? {
        Some(v) => v.parse::<u16>().map_err(|_| {
            AppError::InvalidInput(format!("invalid u16 environment variable {key}: '{v}'"))
        }),
        None => Ok(default),
    }
}

/// Parse a `u64` environment variable with default fallback
fn parse_u64_env(key: &str, default: u64) -> AppResult<u64> {
    match optional_env(key)? {
        Some(v) => v.parse::<u64>().map_err(|_| {
            AppError::InvalidInput(format!("invalid u64 environment variable {key}: '{v}'"))
        }),
        None => Ok(default),
    }
}

/// Parse a `usize` environment variable with default fallback
fn parse_usize_env(key: &str, default: usize) -> AppResult<usize> {
    match optional_env(key)? {
        Some(v) => v.parse::<usize>().map_err(|_| {
            AppError::InvalidInput(format!("invalid usize environment variable {key}: '{v}'"))
        }),
        None => Ok(default),
    }
}

/// Parse an IP address environment variable with default fallback
fn parse_ip_env(key: &str, default: IpAddr) -> AppResult<IpAddr> {
    match optional_env(key)? {
        Some(v) => v.parse::<IpAddr>().map_err(|_| {
            AppError::InvalidInput(format!("invalid IP address environment variable {key}: '{v}'"))
        }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::decode_certificate;

    #[test]
    fn decode_certificate_accepts_wrapped_base64() {
        let bytes = decode_certificate("AAEC\nAwQF\r\n").expect("valid base64");
        assert_eq!(bytes, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn decode_certificate_rejects_garbage() {
        let err = decode_certificate("not base64!!").expect_err("must fail");
        assert!(err.to_string().contains("AZURE_CERT_BASE64"));
    }

    #[test]
    fn decode_certificate_rejects_empty_payload() {
        let err = decode_certificate("   ").expect_err("must fail");
        assert!(err.to_string().contains("empty certificate"));
    }
}
