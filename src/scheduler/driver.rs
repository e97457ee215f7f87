use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::{GridError, Result};
use crate::scheduler::manager::{CycleReport, JobManager};

/// Why [`Driver::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Finished,
    Shutdown,
    /// `run_cycles` reached its limit
    CycleLimit,
}

/// Repeats manager cycles until the task is finished or shutdown is requested.
pub struct Driver {
    manager: JobManager,
    poll_interval: Duration,
    shutdown: CancellationToken,
}

impl Driver {
    pub fn new(manager: JobManager, poll_interval: Duration, shutdown: CancellationToken) -> Self {
        Self {
            manager,
            poll_interval,
            shutdown,
        }
    }

    pub fn manager(&self) -> &JobManager {
        &self.manager
    }

    pub fn into_manager(self) -> JobManager {
        self.manager
    }

    /// Pause between cycles: the configured interval, raised to what the
    /// most conservative backend permits.
    pub fn pause(&self) -> Duration {
        self.poll_interval.max(self.manager.backend().min_interval())
    }

    pub async fn run(&mut self) -> Result<StopReason> {
        self.run_cycles(None).await
    }

    /// Drive the cycle loop.
    ///
    /// ## Stopping
    /// - the task is finished
    /// - the shutdown token is cancelled; checked only between cycles, so an
    ///   in-flight cycle always completes and persists
    /// - `limit` cycles ran
    /// - a cycle fails with a fatal error, which is returned
    ///
    /// Non-fatal errors are logged and the next cycle retries naturally.
    pub async fn run_cycles(&mut self, limit: Option<usize>) -> Result<StopReason> {
        let mut cycles = 0usize;
        loop {
            if self.shutdown.is_cancelled() {
                return Ok(StopReason::Shutdown);
            }

            match self.manager.cycle().await {
                Ok(report) => log_report(&report),
                Err(e) if e.is_fatal() => {
                    tracing::error!(error = %e, "Stopping after fatal error");
                    return Err(e);
                }
                Err(e) => tracing::warn!(error = %e, "Cycle failed, retrying next cycle"),
            }
            cycles += 1;

            if self.manager.is_finished() {
                tracing::info!(cycles, "All jobs finished");
                return Ok(StopReason::Finished);
            }
            if limit.is_some_and(|limit| cycles >= limit) {
                return Ok(StopReason::CycleLimit);
            }

            let pause = self.pause();
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    tracing::info!("Shutdown requested, stopping between cycles");
                    return Ok(StopReason::Shutdown);
                }
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }
}

fn log_report(report: &CycleReport) {
    tracing::info!(
        retrieved = report.retrieved,
        succeeded = report.succeeded,
        checked = report.checked,
        lost = report.lost,
        submitted = report.submitted,
        submit_failed = report.submit_failed,
        retired = report.retired,
        errors = report.errors.len(),
        "Cycle complete"
    );
    for error in &report.errors {
        match error {
            GridError::Backend(e) => tracing::error!(
                backend = %e.backend,
                call = %e.call,
                class = %e.class,
                detail = %e.detail,
                "Backend error during cycle"
            ),
            other => tracing::error!(error = %other, "Error during cycle"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{BackendError, CallKind, FailureClass};
    use std::io::Write;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn systemic_errors_are_logged_at_error_level() {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();

        let mut report = CycleReport::default();
        report.errors.push(
            BackendError::new("SLURM", CallKind::Check, FailureClass::Timeout, "sacct hung").into(),
        );
        tracing::subscriber::with_default(subscriber, || log_report(&report));

        let output = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
        let line = output
            .lines()
            .find(|line| line.contains("Backend error during cycle"))
            .unwrap();
        assert!(line.contains("ERROR"));
        assert!(line.contains("backend=SLURM"));
        assert!(line.contains("call=check"));
        assert!(line.contains("class=timeout"));
    }
}
