//! Subprocess runner for generated scripts
//!
//! Writes a script to a uniquely named private file, runs the interpreter
//! against it with a hard wall-clock limit, and drains stdout/stderr in full.
//! The script file is removed by a scoped guard once the child has exited or
//! been killed. Output is returned verbatim; interpretation belongs to
//! [`crate::extract`].

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::{Semaphore, SemaphorePermit};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use uuid::Uuid;

use crate::config::ExecutionConfig;
use crate::errors::{AppError, AppResult};
use crate::session::{private_file, remove_quietly};

/// How long to keep draining pipes after the child was killed
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Arguments placed before the script path for PowerShell
const PWSH_ARGS: [&str; 3] = ["-NoProfile", "-NonInteractive", "-File"];

/// Captured output of one subprocess run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the process was killed or terminated by a signal
    pub exit_code: Option<i32>,
    /// Set when the wall-clock limit fired and the child was killed
    pub timed_out: bool,
    pub elapsed: Duration,
}

/// Script file owned for the lifetime of one subprocess run
#[derive(Debug)]
struct ScriptFile {
    path: PathBuf,
}

impl ScriptFile {
    fn create(dir: &Path, label: &str, contents: &str) -> AppResult<Self> {
        let name = format!(
            "exchange_{label}_{}_{}.ps1",
            Utc::now().timestamp_millis(),
            Uuid::new_v4().simple()
        );
        let path = dir.join(name);
        let mut file = private_file(&path)
            .map_err(|e| AppError::Internal(format!("failed to create script file: {e}")))?;
        let guard = Self { path };
        file.write_all(contents.as_bytes())
            .and_then(|()| file.sync_all())
            .map_err(|e| AppError::Internal(format!("failed to write script file: {e}")))?;
        Ok(guard)
    }
}

impl Drop for ScriptFile {
    fn drop(&mut self) {
        remove_quietly(&self.path, "script");
    }
}

/// Runs scripts through the automation interpreter
///
/// Concurrent runs are bounded by a semaphore; callers hold one
/// [`RunPermit`] until the child has exited.
#[derive(Debug, Clone)]
pub struct ScriptRunner {
    program: String,
    args: Vec<String>,
    timeout: Duration,
    work_dir: PathBuf,
    permits: Arc<Semaphore>,
}

impl ScriptRunner {
    /// PowerShell runner configured from [`ExecutionConfig`]
    pub fn from_config(config: &ExecutionConfig) -> Self {
        Self::new(
            config.interpreter.clone(),
            PWSH_ARGS.iter().map(|a| (*a).to_owned()).collect(),
            config.timeout,
            config.work_dir.clone(),
            config.max_concurrent,
        )
    }

    /// Runner for an arbitrary interpreter invoked as `program args... <script>`
    pub fn new(
        program: impl Into<String>,
        args: Vec<String>,
        timeout: Duration,
        work_dir: PathBuf,
        max_concurrent: usize,
    ) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
            work_dir,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    /// Wait for a free subprocess slot
    ///
    /// The returned [`RunPermit`] is the only way to start a subprocess, so
    /// anything the caller prepares for the run (credential material) can be
    /// created after the wait instead of during it.
    ///
    /// # Errors
    ///
    /// Returns `Internal` if the semaphore was closed.
    pub async fn acquire(&self) -> AppResult<RunPermit<'_>> {
        let permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| AppError::Internal("script runner is shut down".to_owned()))?;
        Ok(RunPermit {
            runner: self,
            _permit: permit,
        })
    }

    async fn run(
        &self,
        label: &str,
        script: &str,
        env: &[(&str, &str)],
    ) -> AppResult<ProcessOutput> {
        let script_file = ScriptFile::create(&self.work_dir, label, script)?;
        let started = Instant::now();

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .arg(&script_file.path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in env {
            command.env(key, value);
        }

        let mut child = command.spawn().map_err(|e| {
            AppError::Internal(format!("failed to start interpreter '{}': {e}", self.program))
        })?;
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let (exit_code, timed_out) = match timeout(self.timeout, child.wait()).await {
            Ok(Ok(status)) => (status.code(), false),
            Ok(Err(e)) => {
                tracing::warn!(label, error = %e, "failed waiting for interpreter");
                (None, false)
            }
            Err(_) => {
                tracing::warn!(
                    label,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "script timed out; killing interpreter"
                );
                if let Err(e) = child.kill().await {
                    tracing::warn!(label, error = %e, "failed to kill interpreter");
                }
                (None, true)
            }
        };

        let output = ProcessOutput {
            stdout: collect(stdout).await,
            stderr: collect(stderr).await,
            exit_code,
            timed_out,
            elapsed: started.elapsed(),
        };
        drop(script_file);

        tracing::debug!(
            label,
            exit_code = ?output.exit_code,
            timed_out = output.timed_out,
            stdout_bytes = output.stdout.len(),
            stderr_bytes = output.stderr.len(),
            elapsed_ms = output.elapsed.as_millis() as u64,
            "interpreter finished"
        );
        Ok(output)
    }
}

/// One held subprocess slot
///
/// Dropping it frees the slot for the next waiting request.
#[derive(Debug)]
pub struct RunPermit<'a> {
    runner: &'a ScriptRunner,
    _permit: SemaphorePermit<'a>,
}

impl RunPermit<'_> {
    /// Execute `script` and capture its output
    ///
    /// `label` names the temp file; `env` entries are added to the child's
    /// environment. A timeout is reported through [`ProcessOutput::timed_out`]
    /// with whatever output was produced before the kill.
    ///
    /// # Errors
    ///
    /// Returns `Internal` if the script file cannot be written or the
    /// interpreter cannot be spawned.
    pub async fn execute(
        &self,
        label: &str,
        script: &str,
        env: &[(&str, &str)],
    ) -> AppResult<ProcessOutput> {
        self.runner.run(label, script, env).await
    }
}

/// Read a pipe to the end on a background task
fn drain<R>(pipe: Option<R>) -> Option<JoinHandle<Vec<u8>>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    pipe.map(|mut pipe| {
        tokio::spawn(async move {
            let mut buf = Vec::new();
            // Partial output is still useful; read errors end the stream.
            let _ = pipe.read_to_end(&mut buf).await;
            buf
        })
    })
}

/// Join a drain task, bounded so that orphaned grandchildren holding the
/// pipe open cannot stall the request
async fn collect(handle: Option<JoinHandle<Vec<u8>>>) -> String {
    let Some(mut handle) = handle else {
        return String::new();
    };
    match timeout(DRAIN_GRACE, &mut handle).await {
        Ok(Ok(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "output drain task failed");
            String::new()
        }
        Err(_) => {
            handle.abort();
            String::new()
        }
    }
}
