use std::path::PathBuf;

use thiserror::Error;

use crate::scheduler::JobState;

/// Which backend operation a systemic failure happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Deploy,
    Submit,
    Check,
    Retrieve,
    Cancel,
    Discover,
}

impl std::fmt::Display for CallKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallKind::Deploy => write!(f, "deploy"),
            CallKind::Submit => write!(f, "submit"),
            CallKind::Check => write!(f, "check"),
            CallKind::Retrieve => write!(f, "retrieve"),
            CallKind::Cancel => write!(f, "cancel"),
            CallKind::Discover => write!(f, "discover"),
        }
    }
}

/// Coarse classification of why an external call failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Timeout,
    Parse,
    NonZeroExit,
    Spawn,
    /// A fan-out worker panicked
    Panic,
}

impl std::fmt::Display for FailureClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureClass::Timeout => write!(f, "timeout"),
            FailureClass::Parse => write!(f, "parse"),
            FailureClass::NonZeroExit => write!(f, "nonzero-exit"),
            FailureClass::Spawn => write!(f, "spawn"),
            FailureClass::Panic => write!(f, "panic"),
        }
    }
}

/// A backend is unreachable or misconfigured as a whole.
#[derive(Error, Debug, Clone)]
#[error("backend {backend} failed during {call} ({class}): {detail}")]
pub struct BackendError {
    pub backend: String,
    pub call: CallKind,
    pub class: FailureClass,
    pub detail: String,
}

impl BackendError {
    pub fn new(
        backend: impl Into<String>,
        call: CallKind,
        class: FailureClass,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            backend: backend.into(),
            call,
            class,
            detail: detail.into(),
        }
    }
}

/// The credential could not be determined. Distinct from a merely expired one.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CredentialError {
    #[error("credential inspection command failed: {0}")]
    CommandFailed(String),

    #[error("credential inspection timed out after {0}s")]
    Timeout(u64),

    #[error("unable to parse credential information: {0}")]
    Parse(String),

    #[error("no credential found ({0} missing)")]
    Missing(String),
}

#[derive(Error, Debug)]
pub enum GridError {
    #[error("credential error: {0}")]
    Credential(#[from] CredentialError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("backend {backend} reported unmapped status {raw:?}")]
    UnknownStatus { backend: String, raw: String },

    #[error("invalid transition for job {job}: {from} -> {to}")]
    InvalidTransition { job: u32, from: JobState, to: JobState },

    #[error("job {0} is not part of the task")]
    UnknownJob(u32),

    #[error("unknown backend: {0}")]
    UnknownBackend(String),

    #[error("backend {0} used before deploy")]
    NotDeployed(String),

    #[error("invalid global id: {0:?}")]
    InvalidGlobalId(String),

    #[error("persistence error at {path}: {source}")]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt job record at {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl GridError {
    pub fn persistence(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        GridError::Persistence {
            path: path.into(),
            source,
        }
    }

    /// Whether this error must stop the run rather than being retried next cycle.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            GridError::UnknownStatus { .. }
                | GridError::InvalidTransition { .. }
                | GridError::Persistence { .. }
                | GridError::Corrupt { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, GridError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_error_display_names_backend_call_and_class() {
        let err = BackendError::new("HOST1", CallKind::Check, FailureClass::Timeout, "ps hung");
        assert_eq!(
            err.to_string(),
            "backend HOST1 failed during check (timeout): ps hung"
        );
    }

    #[test]
    fn unknown_status_is_fatal_backend_error_is_not() {
        let unknown = GridError::UnknownStatus {
            backend: "SLURM".to_string(),
            raw: "REQUEUE_HOLD".to_string(),
        };
        assert!(unknown.is_fatal());

        let systemic: GridError =
            BackendError::new("SLURM", CallKind::Submit, FailureClass::Spawn, "no sbatch").into();
        assert!(!systemic.is_fatal());

        let credential: GridError = CredentialError::Missing("timeleft".to_string()).into();
        assert!(!credential.is_fatal());
    }
}
