//! Backend running jobs as detached processes on the local host.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};

use crate::backend::context::{lookup_status, BackendContext, Deployment};
use crate::backend::sandbox::{self, Sandbox};
use crate::backend::{
    from_batch, stop_after_error, BackendHandle, CancelStream, CheckStream, GlobalId,
    RetrieveStream, StatusReport, SubmitRequest, SubmitStream,
};
use crate::error::{BackendError, CallKind, FailureClass, GridError, Result};
use crate::scheduler::JobState;
use crate::task::Task;

/// First character of `ps` STAT to job state.
pub const HOST_STATUS_MAP: &[(&str, JobState)] = &[
    ("R", JobState::Running),
    ("S", JobState::Running),
    ("D", JobState::Running),
    ("I", JobState::Running),
    ("T", JobState::Queued),
    ("t", JobState::Queued),
    ("W", JobState::Waiting),
    ("Z", JobState::Done),
    ("X", JobState::Done),
];

pub struct HostBackend {
    name: String,
    ctx: BackendContext,
    deployment: Deployment,
    min_interval: Duration,
}

impl HostBackend {
    pub fn new(name: impl Into<String>, ctx: BackendContext) -> Self {
        Self {
            name: name.into(),
            ctx,
            deployment: Deployment::default(),
            min_interval: Duration::ZERO,
        }
    }

    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    fn sandbox(&self) -> &Sandbox {
        &self.ctx.sandbox
    }

    async fn submit_one(
        &self,
        request: SubmitRequest,
        task: Arc<dyn Task>,
    ) -> Result<(u32, Option<GlobalId>)> {
        let job = request.job;
        let prepared = match self.sandbox().prepare(job, task.as_ref()).await {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(backend = %self.name, job, error = %e, "Could not prepare sandbox");
                return Ok((job, None));
            }
        };

        let launch = format!(
            "setsid nohup sh {} > /dev/null 2>&1 < /dev/null & echo $!",
            sandbox::shell_quote(&prepared.script.to_string_lossy())
        );
        let output = self
            .ctx
            .runner
            .run("sh", &["-c".to_string(), launch])
            .await
            .map_err(|e| e.into_backend_error(&self.name, CallKind::Submit))?;

        let pid = output.stdout.trim();
        if !output.success() || pid.parse::<u32>().is_err() {
            tracing::warn!(
                backend = %self.name,
                job,
                error = %output.describe_failure(),
                "Job submission failed"
            );
            self.sandbox().remove(&prepared.name).await;
            return Ok((job, None));
        }

        let id = GlobalId::new(&self.name, Sandbox::local_id(pid, &prepared.name));
        tracing::info!(backend = %self.name, job, global_id = %id, "Job submitted");
        Ok((job, Some(id)))
    }

    async fn list_processes(&self, pids: &[&str]) -> Result<HashMap<String, String>> {
        let args = vec![
            "-o".to_string(),
            "pid=,stat=".to_string(),
            "-p".to_string(),
            pids.join(","),
        ];
        let output = self
            .ctx
            .runner
            .run("ps", &args)
            .await
            .map_err(|e| e.into_backend_error(&self.name, CallKind::Check))?;
        // ps exits 1 when none of the pids exist
        if !output.success() && !(output.exit_code == Some(1) && output.stdout.trim().is_empty()) {
            return Err(BackendError::new(
                &self.name,
                CallKind::Check,
                FailureClass::NonZeroExit,
                output.describe_failure(),
            )
            .into());
        }
        let mut listed = HashMap::new();
        for line in output.stdout.lines() {
            let mut fields = line.split_whitespace();
            match (fields.next(), fields.next()) {
                (Some(pid), Some(stat)) => {
                    listed.insert(pid.to_string(), stat.to_string());
                }
                (None, _) => {}
                _ => {
                    return Err(BackendError::new(
                        &self.name,
                        CallKind::Check,
                        FailureClass::Parse,
                        format!("unexpected ps line {:?}", line),
                    )
                    .into())
                }
            }
        }
        Ok(listed)
    }

    async fn check_batch(&self, ids: Vec<GlobalId>) -> Result<Vec<StatusReport>> {
        let parsed: Vec<(GlobalId, String, String)> = ids
            .into_iter()
            .filter_map(|id| {
                let (pid, name) = Sandbox::split_local_id(id.local())?;
                pid.parse::<u32>().ok()?;
                let (pid, name) = (pid.to_string(), name.to_string());
                Some((id, pid, name))
            })
            .collect();
        if parsed.is_empty() {
            return Ok(Vec::new());
        }

        let pids: Vec<&str> = parsed.iter().map(|(_, pid, _)| pid.as_str()).collect();
        let listed = self.list_processes(&pids).await?;

        let mut reports = Vec::with_capacity(parsed.len());
        for (id, pid, name) in parsed {
            let dir = self.sandbox().dir(&name);
            let state = if sandbox::read_job_info(&dir).await.is_some() {
                JobState::Done
            } else if let Some(stat) = listed.get(&pid) {
                let code: String = stat.chars().take(1).collect();
                lookup_status(HOST_STATUS_MAP, &self.name, &code)?
            } else {
                continue;
            };
            reports.push(StatusReport::new(id, state).with_attribute("dest", "localhost"));
        }
        Ok(reports)
    }

    async fn retrieve_batch(&self, ids: Vec<GlobalId>) -> Result<Vec<(GlobalId, Option<PathBuf>)>> {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let mut found = None;
            if let Some((_, name)) = Sandbox::split_local_id(id.local()) {
                let dir = self.sandbox().dir(name);
                if tokio::fs::metadata(&dir).await.is_ok() {
                    found = Some(dir);
                }
            }
            out.push((id, found));
        }
        Ok(out)
    }

    async fn cancel_one(&self, id: GlobalId) -> Result<Option<GlobalId>> {
        let Some(pid) = Sandbox::split_local_id(id.local())
            .and_then(|(pid, _)| pid.parse::<u32>().ok())
        else {
            return Ok(None);
        };
        // The wrapper runs in its own session, so signal the whole group.
        // dash's builtin kill rejects `--`, so the group is passed bare.
        let args = vec!["-c".to_string(), cancel_command(pid)];
        let output = self
            .ctx
            .runner
            .run("sh", &args)
            .await
            .map_err(|e| e.into_backend_error(&self.name, CallKind::Cancel))?;
        if output.success() {
            tracing::info!(backend = %self.name, global_id = %id, "Job cancelled");
            Ok(Some(id))
        } else {
            tracing::debug!(backend = %self.name, global_id = %id, "Cancel not confirmed");
            Ok(None)
        }
    }
}

fn cancel_command(pid: u32) -> String {
    format!("kill -TERM -{}", pid)
}

#[async_trait]
impl BackendHandle for HostBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn min_interval(&self) -> Duration {
        self.min_interval
    }

    async fn can_submit(&self, needed_walltime: u64, upstream_ok: bool) -> Result<bool> {
        self.ctx.can_submit(needed_walltime, upstream_ok).await
    }

    async fn deploy(&self, task: &dyn Task) -> Result<()> {
        self.sandbox()
            .create_root()
            .await
            .map_err(|e| GridError::persistence(self.sandbox().root(), e))?;
        if self.deployment.mark() {
            tracing::info!(backend = %self.name, task = task.task_id(), "Backend deployed");
        }
        Ok(())
    }

    fn submit(&self, requests: Vec<SubmitRequest>, task: Arc<dyn Task>) -> SubmitStream<'_> {
        if requests.is_empty() {
            return stream::empty().boxed();
        }
        if let Err(e) = self.deployment.ensure(&self.name) {
            return stream::iter(std::iter::once(Err(e))).boxed();
        }
        stop_after_error(
            stream::iter(requests)
                .then(move |request| self.submit_one(request, task.clone()))
                .boxed(),
        )
    }

    fn check(&self, ids: Vec<GlobalId>) -> CheckStream<'_> {
        if ids.is_empty() {
            return stream::empty().boxed();
        }
        from_batch(self.check_batch(ids))
    }

    fn retrieve(&self, ids: Vec<GlobalId>) -> RetrieveStream<'_> {
        if ids.is_empty() {
            return stream::empty().boxed();
        }
        from_batch(self.retrieve_batch(ids))
    }

    fn cancel(&self, ids: Vec<GlobalId>) -> CancelStream<'_> {
        if ids.is_empty() {
            return stream::empty().boxed();
        }
        stop_after_error(
            stream::iter(ids)
                .then(move |id| self.cancel_one(id))
                .filter_map(|outcome| async move { outcome.transpose() })
                .boxed(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_signals_the_process_group() {
        assert_eq!(cancel_command(4242), "kill -TERM -4242");
    }

    #[tokio::test]
    async fn cancel_command_is_accepted_by_sh() {
        let mut child = tokio::process::Command::new("setsid")
            .args(["sleep", "30"])
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let status = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(cancel_command(pid))
            .status()
            .await
            .unwrap();
        assert!(status.success());
        let exit = tokio::time::timeout(Duration::from_secs(5), child.wait())
            .await
            .unwrap()
            .unwrap();
        assert!(!exit.success());
    }
}
