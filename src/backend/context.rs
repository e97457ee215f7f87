use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::access::AccessToken;
use crate::backend::process::ProcessRunner;
use crate::backend::sandbox::Sandbox;
use crate::error::{GridError, Result};
use crate::scheduler::JobState;

/// Helpers every process-based backend is built from.
#[derive(Debug, Clone)]
pub struct BackendContext {
    pub runner: ProcessRunner,
    pub sandbox: Sandbox,
    pub token: Arc<AccessToken>,
}

impl BackendContext {
    pub fn new(workdir: &Path, runner: ProcessRunner, token: Arc<AccessToken>) -> Self {
        Self {
            runner,
            sandbox: Sandbox::new(workdir.join("sandbox")),
            token,
        }
    }

    /// Local submission policy chained onto `upstream_ok`.
    pub async fn can_submit(&self, needed_walltime: u64, upstream_ok: bool) -> Result<bool> {
        if !upstream_ok {
            return Ok(false);
        }
        Ok(self.token.can_submit(needed_walltime).await?)
    }
}

/// Tracks whether `deploy` ran.
#[derive(Debug, Default)]
pub struct Deployment(AtomicBool);

impl Deployment {
    pub fn mark(&self) -> bool {
        !self.0.swap(true, Ordering::SeqCst)
    }

    pub fn ensure(&self, backend: &str) -> Result<()> {
        if self.0.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(GridError::NotDeployed(backend.to_string()))
        }
    }
}

/// Map a raw backend status through a static table. Unmapped text is an error.
pub fn lookup_status(table: &[(&str, JobState)], backend: &str, raw: &str) -> Result<JobState> {
    table
        .iter()
        .find(|(key, _)| *key == raw)
        .map(|(_, state)| *state)
        .ok_or_else(|| GridError::UnknownStatus {
            backend: backend.to_string(),
            raw: raw.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE: &[(&str, JobState)] = &[("R", JobState::Running), ("Q", JobState::Queued)];

    #[test]
    fn lookup_maps_known_status() {
        assert_eq!(lookup_status(TABLE, "B", "R").unwrap(), JobState::Running);
    }

    #[test]
    fn lookup_refuses_to_guess() {
        let err = lookup_status(TABLE, "B", "H").unwrap_err();
        assert!(matches!(err, GridError::UnknownStatus { ref raw, .. } if raw == "H"));
    }

    #[test]
    fn deployment_marks_once() {
        let deployment = Deployment::default();
        assert!(deployment.ensure("B").is_err());
        assert!(deployment.mark());
        assert!(!deployment.mark());
        assert!(deployment.ensure("B").is_ok());
    }

    #[tokio::test]
    async fn refusal_upstream_is_kept() {
        let ctx = BackendContext::new(
            Path::new("/tmp"),
            ProcessRunner::default(),
            Arc::new(AccessToken::trivial()),
        );
        assert!(ctx.can_submit(10, true).await.unwrap());
        assert!(!ctx.can_submit(10, false).await.unwrap());
    }
}
