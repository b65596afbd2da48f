//! Execution pipeline
//!
//! Subprocess slot → credential file → session wrapper → runner → result
//! extractor, behind the [`ScriptExecutor`] seam used by the HTTP handlers.
//! Every failure inside the pipeline is folded into a failed
//! [`ExecutionResult`]; nothing here returns an error to the caller.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use secrecy::{ExposeSecret, SecretSlice, SecretString};

use crate::config::ServerConfig;
use crate::extract;
use crate::models::ExecutionResult;
use crate::runner::ScriptRunner;
use crate::script::ScriptRequest;
use crate::session::{CERT_PASSWORD_ENV, CredentialFile, SessionWrapper};

/// Runs one script request inside one authenticated session
pub trait ScriptExecutor: Send + Sync {
    fn run<'a>(
        &'a self,
        request: ScriptRequest,
    ) -> Pin<Box<dyn Future<Output = ExecutionResult> + Send + 'a>>;
}

/// Production executor backed by the automation interpreter
pub struct ExchangeExecutor {
    session: SessionWrapper,
    runner: ScriptRunner,
    certificate: Arc<SecretSlice<u8>>,
    certificate_password: SecretString,
    work_dir: PathBuf,
}

impl ExchangeExecutor {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self::new(config, ScriptRunner::from_config(&config.execution))
    }

    /// Executor with a caller-supplied runner
    pub fn new(config: &ServerConfig, runner: ScriptRunner) -> Self {
        Self {
            session: SessionWrapper::new(&config.exchange),
            runner,
            certificate: config.exchange.certificate.clone(),
            certificate_password: config.exchange.certificate_password.clone(),
            work_dir: config.execution.work_dir.clone(),
        }
    }

    async fn execute(&self, request: ScriptRequest) -> ExecutionResult {
        // Credential material only exists while a subprocess slot is held.
        let permit = match self.runner.acquire().await {
            Ok(permit) => permit,
            Err(e) => {
                tracing::warn!(operation = %request.operation, error = %e, "no subprocess slot");
                return ExecutionResult::failure(e.message(), Vec::new());
            }
        };

        let credential =
            match CredentialFile::write(&self.work_dir, self.certificate.expose_secret()) {
                Ok(file) => file,
                Err(e) => {
                    tracing::warn!(
                        operation = %request.operation,
                        error = %e,
                        "credential setup failed"
                    );
                    return ExecutionResult::failure(
                        e.message(),
                        vec!["Failed to prepare session credentials".to_owned()],
                    );
                }
            };

        let script = self.session.wrap(&request, credential.path());
        let password = self.certificate_password.expose_secret();
        let outcome = permit
            .execute(
                request.operation.as_str(),
                &script,
                &[(CERT_PASSWORD_ENV, password)],
            )
            .await;
        drop(credential);
        drop(permit);

        match outcome {
            Ok(output) => extract::extract(&output),
            Err(e) => {
                tracing::warn!(
                    operation = %request.operation,
                    error = %e,
                    "script execution failed"
                );
                ExecutionResult::failure(e.message(), Vec::new())
            }
        }
    }
}

impl ScriptExecutor for ExchangeExecutor {
    fn run<'a>(
        &'a self,
        request: ScriptRequest,
    ) -> Pin<Box<dyn Future<Output = ExecutionResult> + Send + 'a>> {
        Box::pin(self.execute(request))
    }
}
