use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::{BackendError, CallKind, FailureClass};

pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// Captured result of one finished external command.
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Stderr if present, otherwise the exit code.
    pub fn describe_failure(&self) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            format!("Exit code: {:?}", self.exit_code)
        } else {
            stderr.to_string()
        }
    }
}

/// Why a command produced no [`ProcessOutput`].
#[derive(Debug)]
pub enum ProcessError {
    Spawn(std::io::Error),
    Timeout(Duration),
}

impl ProcessError {
    pub fn class(&self) -> FailureClass {
        match self {
            ProcessError::Spawn(_) => FailureClass::Spawn,
            ProcessError::Timeout(_) => FailureClass::Timeout,
        }
    }

    pub fn into_backend_error(self, backend: &str, call: CallKind) -> BackendError {
        BackendError::new(backend, call, self.class(), self.to_string())
    }
}

impl std::fmt::Display for ProcessError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessError::Spawn(e) => write!(f, "failed to run command: {}", e),
            ProcessError::Timeout(t) => write!(f, "command timed out after {}s", t.as_secs()),
        }
    }
}

/// Runs external commands with a hard timeout.
///
/// Shared by every concrete backend and by the credential inspector. A command
/// that outlives the timeout is killed.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    timeout: Duration,
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new(DEFAULT_COMMAND_TIMEOUT)
    }
}

impl ProcessRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn run(&self, program: &str, args: &[String]) -> Result<ProcessOutput, ProcessError> {
        self.run_with_input(program, args, None).await
    }

    pub async fn run_with_input(
        &self,
        program: &str,
        args: &[String],
        input: Option<&str>,
    ) -> Result<ProcessOutput, ProcessError> {
        tracing::debug!(program, ?args, "Running command");

        let mut child = Command::new(program)
            .args(args)
            .stdin(if input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(ProcessError::Spawn)?;

        if let (Some(text), Some(mut stdin)) = (input, child.stdin.take()) {
            stdin
                .write_all(text.as_bytes())
                .await
                .map_err(ProcessError::Spawn)?;
        }

        let result = tokio::time::timeout(self.timeout, child.wait_with_output()).await;
        match result {
            Ok(Ok(output)) => {
                let out = ProcessOutput {
                    exit_code: output.status.code(),
                    stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                    stderr: String::from_utf8_lossy(&output.stderr).to_string(),
                };
                tracing::debug!(program, exit_code = ?out.exit_code, "Command finished");
                Ok(out)
            }
            Ok(Err(e)) => {
                tracing::error!(program, error = %e, "Command execution failed");
                Err(ProcessError::Spawn(e))
            }
            Err(_) => {
                tracing::warn!(program, timeout_secs = self.timeout.as_secs(), "Command timed out");
                Err(ProcessError::Timeout(self.timeout))
            }
        }
    }

    /// Run a command whose failure is systemic for `backend`.
    ///
    /// Spawn failures, timeouts and nonzero exits all become a [`BackendError`].
    pub async fn run_checked(
        &self,
        backend: &str,
        call: CallKind,
        program: &str,
        args: &[String],
    ) -> Result<ProcessOutput, BackendError> {
        let output = self
            .run(program, args)
            .await
            .map_err(|e| e.into_backend_error(backend, call))?;
        if !output.success() {
            return Err(BackendError::new(
                backend,
                call,
                FailureClass::NonZeroExit,
                format!("{} {}", program, output.describe_failure()),
            ));
        }
        Ok(output)
    }
}
