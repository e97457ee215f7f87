//! Backend submitting to a Slurm cluster through its command line tools.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};

use crate::backend::context::{lookup_status, BackendContext, Deployment};
use crate::backend::process::{ProcessOutput, ProcessRunner};
use crate::backend::sandbox::{Sandbox, STDERR_NAME, STDOUT_NAME};
use crate::backend::{
    from_batch, stop_after_error, BackendHandle, CancelStream, CheckStream, GlobalId,
    RetrieveStream, StatusReport, SubmitRequest, SubmitStream,
};
use crate::broker::{Ceilings, Dimension, QueueDiscovery, QueueInfo};
use crate::error::{BackendError, CallKind, FailureClass, GridError, Result};
use crate::scheduler::JobState;
use crate::task::{Requirements, Task};

/// `sacct` job state to job state. `REQUEUED` and `RESIZING` stay unmapped.
pub const SLURM_STATUS_MAP: &[(&str, JobState)] = &[
    ("PENDING", JobState::Queued),
    ("CONFIGURING", JobState::Waiting),
    ("SUSPENDED", JobState::Waiting),
    ("RUNNING", JobState::Running),
    ("COMPLETING", JobState::Running),
    ("COMPLETED", JobState::Done),
    ("CANCELLED", JobState::Cancelled),
    ("FAILED", JobState::Failed),
    ("TIMEOUT", JobState::Aborted),
    ("NODE_FAIL", JobState::Aborted),
    ("PREEMPTED", JobState::Aborted),
    ("OUT_OF_MEMORY", JobState::Aborted),
    ("BOOT_FAIL", JobState::Aborted),
    ("DEADLINE", JobState::Aborted),
];

pub struct SlurmBackend {
    name: String,
    ctx: BackendContext,
    deployment: Deployment,
    min_interval: Duration,
}

impl SlurmBackend {
    pub fn new(name: impl Into<String>, ctx: BackendContext) -> Self {
        Self {
            name: name.into(),
            ctx,
            deployment: Deployment::default(),
            min_interval: Duration::from_secs(30),
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

        let mut args = vec![
            "--parsable".to_string(),
            format!("--job-name={}.{}", task.task_id(), job),
            format!("--chdir={}", prepared.dir.display()),
            format!("--output={}", prepared.dir.join(format!("slurm.{}", STDOUT_NAME)).display()),
            format!("--error={}", prepared.dir.join(format!("slurm.{}", STDERR_NAME)).display()),
        ];
        args.extend(sbatch_options(&request.requirements));
        args.push(prepared.script.display().to_string());

        let output = self
            .ctx
            .runner
            .run("sbatch", &args)
            .await
            .map_err(|e| e.into_backend_error(&self.name, CallKind::Submit))?;

        match parse_sbatch(&output) {
            Some(native) => {
                let id = GlobalId::new(&self.name, Sandbox::local_id(&native, &prepared.name));
                tracing::info!(backend = %self.name, job, global_id = %id, "Job submitted");
                Ok((job, Some(id)))
            }
            None => {
                tracing::warn!(
                    backend = %self.name,
                    job,
                    error = %output.describe_failure(),
                    "Job submission failed"
                );
                self.sandbox().remove(&prepared.name).await;
                Ok((job, None))
            }
        }
    }

    async fn check_batch(&self, ids: Vec<GlobalId>) -> Result<Vec<StatusReport>> {
        let parsed: Vec<(GlobalId, String)> = ids
            .into_iter()
            .filter_map(|id| {
                let native = native_id(&id)?.to_string();
                Some((id, native))
            })
            .collect();
        if parsed.is_empty() {
            return Ok(Vec::new());
        }

        let natives: Vec<&str> = parsed.iter().map(|(_, n)| n.as_str()).collect();
        let args = vec![
            "-n".to_string(),
            "-P".to_string(),
            "-X".to_string(),
            "-o".to_string(),
            "JobID,State,NodeList".to_string(),
            "-j".to_string(),
            natives.join(","),
        ];
        let output = self
            .ctx
            .runner
            .run_checked(&self.name, CallKind::Check, "sacct", &args)
            .await?;
        let rows = parse_sacct(&output.stdout)
            .map_err(|detail| BackendError::new(&self.name, CallKind::Check, FailureClass::Parse, detail))?;

        let mut reports = Vec::with_capacity(parsed.len());
        for (id, native) in parsed {
            let Some(row) = rows.iter().find(|row| row.job_id == native) else {
                continue;
            };
            let state = lookup_status(SLURM_STATUS_MAP, &self.name, &row.state)?;
            let mut report = StatusReport::new(id, state);
            if !row.nodes.is_empty() && row.nodes != "None assigned" {
                report = report.with_attribute("dest", row.nodes.clone());
            }
            reports.push(report);
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
        let Some(native) = native_id(&id) else {
            return Ok(None);
        };
        let output = self
            .ctx
            .runner
            .run("scancel", &[native.to_string()])
            .await
            .map_err(|e| e.into_backend_error(&self.name, CallKind::Cancel))?;
        if output.success() {
            tracing::info!(backend = %self.name, global_id = %id, "Job cancelled");
            Ok(Some(id))
        } else {
            tracing::debug!(
                backend = %self.name,
                global_id = %id,
                error = %output.describe_failure(),
                "Cancel not confirmed"
            );
            Ok(None)
        }
    }
}

/// Native Slurm job id of a global id, if it is numeric.
fn native_id(id: &GlobalId) -> Option<&str> {
    let (native, _) = Sandbox::split_local_id(id.local())?;
    native.parse::<u64>().ok()?;
    Some(native)
}

/// Translate brokered requirements into `sbatch` options.
pub fn sbatch_options(reqs: &Requirements) -> Vec<String> {
    let mut options = Vec::new();
    if let Some(walltime) = reqs.walltime {
        // Slurm takes minutes; never round a request down.
        options.push(format!("--time={}", walltime.div_ceil(60).max(1)));
    }
    if let Some(memory) = reqs.memory {
        options.push(format!("--mem={}", memory));
    }
    if let Some(cpus) = reqs.cpus {
        options.push(format!("--cpus-per-task={}", cpus));
    }
    if let Some(queues) = reqs.queues.as_ref().filter(|q| !q.is_empty()) {
        options.push(format!("--partition={}", queues.join(",")));
    }
    options
}

/// `sbatch --parsable` prints `<jobid>[;<cluster>]`.
fn parse_sbatch(output: &ProcessOutput) -> Option<String> {
    if !output.success() {
        return None;
    }
    let line = output.stdout.lines().find(|l| !l.trim().is_empty())?;
    let native = line.trim().split(';').next()?;
    native.parse::<u64>().ok()?;
    Some(native.to_string())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SacctRow {
    pub job_id: String,
    pub state: String,
    pub nodes: String,
}

/// Parse `sacct -n -P -o JobID,State,NodeList` output.
///
/// States like `CANCELLED by 1000` keep only their first word.
pub fn parse_sacct(stdout: &str) -> std::result::Result<Vec<SacctRow>, String> {
    let mut rows = Vec::new();
    for line in stdout.lines().filter(|l| !l.trim().is_empty()) {
        let fields: Vec<&str> = line.split('|').collect();
        if fields.len() < 2 {
            return Err(format!("unexpected sacct line {:?}", line));
        }
        let state = fields[1].split_whitespace().next().unwrap_or_default();
        rows.push(SacctRow {
            job_id: fields[0].trim().to_string(),
            state: state.trim_end_matches('+').to_string(),
            nodes: fields.get(2).map(|n| n.trim().to_string()).unwrap_or_default(),
        });
    }
    Ok(rows)
}

#[async_trait]
impl BackendHandle for SlurmBackend {
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

/// Discovers partitions and their limits with `sinfo`.
#[derive(Debug, Clone)]
pub struct SlurmQueues {
    runner: ProcessRunner,
}

impl SlurmQueues {
    pub fn new(runner: ProcessRunner) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl QueueDiscovery for SlurmQueues {
    async fn discover(&self) -> Result<QueueInfo> {
        let args = vec!["-h".to_string(), "-o".to_string(), "%P|%l|%m|%c".to_string()];
        let output = self
            .runner
            .run_checked("slurm", CallKind::Discover, "sinfo", &args)
            .await?;
        parse_sinfo(&output.stdout).map_err(|detail| {
            BackendError::new("slurm", CallKind::Discover, FailureClass::Parse, detail).into()
        })
    }
}

/// Parse `sinfo -h -o "%P|%l|%m|%c"`. Partitions listed on several lines keep
/// the most generous ceilings.
pub fn parse_sinfo(stdout: &str) -> std::result::Result<QueueInfo, String> {
    let mut info = QueueInfo::new();
    for line in stdout.lines().filter(|l| !l.trim().is_empty()) {
        let fields: Vec<&str> = line.split('|').map(str::trim).collect();
        if fields.len() != 4 {
            return Err(format!("unexpected sinfo line {:?}", line));
        }
        let name = fields[0].trim_end_matches('*').to_string();
        let mut ceilings = Ceilings::new();
        if let Some(walltime) = parse_slurm_duration(fields[1]) {
            ceilings.insert(Dimension::Walltime, walltime);
        }
        if let Ok(memory) = fields[2].trim_end_matches('+').parse::<u64>() {
            ceilings.insert(Dimension::Memory, memory);
        }
        if let Ok(cpus) = fields[3].trim_end_matches('+').parse::<u64>() {
            ceilings.insert(Dimension::Cpus, cpus);
        }
        if let Some(existing) = info.ceilings(&name) {
            for (dim, limit) in existing {
                let entry = ceilings.entry(*dim).or_insert(*limit);
                *entry = (*entry).max(*limit);
            }
        }
        info = info.with_queue(name, ceilings);
    }
    Ok(info)
}

/// Parse a Slurm time limit (`[D-]HH:MM:SS`, `MM:SS`, `MM`) into seconds.
/// `infinite` and unparsable values mean no ceiling.
pub fn parse_slurm_duration(text: &str) -> Option<u64> {
    let (days, clock) = match text.split_once('-') {
        Some((d, rest)) => (d.parse::<u64>().ok()?, rest),
        None => (0, text),
    };
    let parts: Vec<u64> = clock
        .split(':')
        .map(|p| p.parse::<u64>().ok())
        .collect::<Option<Vec<_>>>()?;
    let seconds = match parts.as_slice() {
        [m] => m * 60,
        [m, s] => m * 60 + s,
        [h, m, s] => h * 3600 + m * 60 + s,
        _ => return None,
    };
    Some(days * 86_400 + seconds)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sbatch_options_from_requirements() {
        let reqs = Requirements::default()
            .with_walltime(3601)
            .with_memory(2048)
            .with_cpus(4)
            .with_queues(vec!["short".to_string(), "long".to_string()]);
        assert_eq!(
            sbatch_options(&reqs),
            vec![
                "--time=61",
                "--mem=2048",
                "--cpus-per-task=4",
                "--partition=short,long"
            ]
        );
        assert!(sbatch_options(&Requirements::default()).is_empty());
    }

    #[test]
    fn sbatch_output_with_cluster_suffix() {
        let output = ProcessOutput {
            exit_code: Some(0),
            stdout: "4711;cluster1\n".to_string(),
            stderr: String::new(),
        };
        assert_eq!(parse_sbatch(&output), Some("4711".to_string()));

        let failed = ProcessOutput {
            exit_code: Some(1),
            stdout: String::new(),
            stderr: "sbatch: error: invalid partition".to_string(),
        };
        assert_eq!(parse_sbatch(&failed), None);
    }

    #[test]
    fn sacct_rows_keep_first_state_word() {
        let rows = parse_sacct("4711|CANCELLED by 1000|node01\n4712|RUNNING|node[02-03]\n").unwrap();
        assert_eq!(rows[0].state, "CANCELLED");
        assert_eq!(rows[1].nodes, "node[02-03]");
        assert!(parse_sacct("garbage").is_err());
    }

    #[test]
    fn sacct_states_map_or_fail() {
        assert_eq!(
            lookup_status(SLURM_STATUS_MAP, "SLURM", "PENDING").unwrap(),
            JobState::Queued
        );
        assert_eq!(
            lookup_status(SLURM_STATUS_MAP, "SLURM", "TIMEOUT").unwrap(),
            JobState::Aborted
        );
        assert!(lookup_status(SLURM_STATUS_MAP, "SLURM", "REQUEUED").is_err());
    }

    #[test]
    fn slurm_durations() {
        assert_eq!(parse_slurm_duration("30"), Some(1800));
        assert_eq!(parse_slurm_duration("1:00:00"), Some(3600));
        assert_eq!(parse_slurm_duration("2-00:00:00"), Some(172_800));
        assert_eq!(parse_slurm_duration("infinite"), None);
    }

    #[test]
    fn sinfo_partitions_become_queues() {
        let info = parse_sinfo("short*|1:00:00|4000|8\nlong|7-00:00:00|16000|32\n").unwrap();
        assert_eq!(info.len(), 2);
        assert_eq!(info.ceilings("short").unwrap()[&Dimension::Walltime], 3600);
        assert_eq!(info.ceilings("long").unwrap()[&Dimension::Cpus], 32);

        let reqs = Requirements::default().with_walltime(7200);
        assert_eq!(info.matching(&reqs), vec!["long"]);
    }

    #[test]
    fn native_id_requires_numeric_prefix() {
        let id = GlobalId::new("SLURM", "4711.0-abc");
        assert_eq!(native_id(&id), Some("4711"));
        assert_eq!(native_id(&GlobalId::new("SLURM", "x.0-abc")), None);
    }
}
