//! The orchestration cycle.
//!
//! One cycle runs three phases against the backend and persists the job
//! database after each of them:
//!
//! 1. retrieval: DONE jobs fetch their output and become SUCCESS or FAILED
//! 2. status: jobs with an outstanding id are checked and advanced
//! 3. submission: new, reset and retry-eligible jobs are brokered and submitted
//!
//! Systemic backend errors end only the affected part of a phase and are
//! collected in the [`CycleReport`]. Fatal errors (unmapped status, invalid
//! transition, persistence) end the cycle with `Err` once the updates applied
//! so far are persisted.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use futures::StreamExt;

use crate::backend::sandbox;
use crate::backend::{GlobalId, SharedBackend, SubmitRequest};
use crate::broker::{Broker, DiscoveryCache, NullBroker, QueueInfo};
use crate::config::JobsConfig;
use crate::error::{GridError, Result};
use crate::scheduler::job::JobState;
use crate::scheduler::jobdb::{JobDb, Storage};
use crate::task::{Requirements, Task};

/// What one cycle did.
#[derive(Debug, Default)]
pub struct CycleReport {
    pub retrieved: usize,
    pub succeeded: usize,
    pub checked: usize,
    pub lost: usize,
    pub submitted: usize,
    pub submit_failed: usize,
    pub retired: usize,
    /// Systemic errors that ended part of a phase
    pub errors: Vec<GridError>,
}

impl CycleReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

pub struct JobManager {
    db: JobDb,
    backend: SharedBackend,
    task: Arc<dyn Task>,
    broker: Box<dyn Broker>,
    discovery: Option<DiscoveryCache>,
    limits: JobsConfig,
    /// job number -> consecutive cycles missing from status reports
    missing: HashMap<u32, u32>,
    deployed: bool,
}

impl JobManager {
    pub fn new(db: JobDb, backend: SharedBackend, task: Arc<dyn Task>, limits: JobsConfig) -> Self {
        Self {
            db,
            backend,
            task,
            broker: Box::new(NullBroker),
            discovery: None,
            limits,
            missing: HashMap::new(),
            deployed: false,
        }
    }

    pub fn with_broker(mut self, broker: Box<dyn Broker>) -> Self {
        self.broker = broker;
        self
    }

    pub fn with_discovery(mut self, discovery: DiscoveryCache) -> Self {
        self.discovery = Some(discovery);
        self
    }

    pub fn db(&self) -> &JobDb {
        &self.db
    }

    pub fn into_db(self) -> JobDb {
        self.db
    }

    pub fn backend(&self) -> &SharedBackend {
        &self.backend
    }

    /// Forget cached queue information so the next submission rediscovers it.
    pub fn invalidate_queues(&mut self) {
        if let Some(discovery) = self.discovery.as_mut() {
            discovery.invalidate();
        }
    }

    /// True once no job can make further progress automatically.
    pub fn is_finished(&self) -> bool {
        self.db.iter().all(|(_, job)| match job.state() {
            JobState::Success | JobState::Disabled => true,
            state if state.is_retryable() => job.attempt() >= self.limits.retry_limit,
            _ => false,
        })
    }

    pub async fn cycle(&mut self) -> Result<CycleReport> {
        let mut report = CycleReport::default();
        self.retrieve_phase(&mut report).await?;
        self.status_phase(&mut report).await?;
        self.submit_phase(&mut report).await?;
        Ok(report)
    }

    /// Ask the backend to cancel outstanding jobs. Returns the job numbers
    /// whose cancellation was confirmed.
    pub async fn cancel_jobs(&mut self, job_nums: &[u32]) -> Result<Vec<u32>> {
        let mut by_id = HashMap::new();
        for &job_num in job_nums {
            let job = self.db.get(job_num).ok_or(GridError::UnknownJob(job_num))?;
            match (job.global_id(), job.state().is_outstanding()) {
                (Some(id), true) if job.state() != JobState::Done => {
                    by_id.insert(id.clone(), job_num);
                }
                _ => tracing::debug!(job = job_num, state = %job.state(), "Nothing to cancel"),
            }
        }

        let backend = self.backend.clone();
        let mut stream = backend.cancel(by_id.keys().cloned().collect());
        let mut confirmed = Vec::new();
        let mut outcome = Ok(());
        while let Some(item) = stream.next().await {
            match item {
                Ok(id) => {
                    let Some(&job_num) = by_id.get(&id) else {
                        continue;
                    };
                    if let Err(e) = self.db.get_mut(job_num)?.advance(job_num, JobState::Cancelled) {
                        outcome = Err(e);
                        break;
                    }
                    self.missing.remove(&job_num);
                    confirmed.push(job_num);
                }
                Err(e) if e.is_fatal() => {
                    outcome = Err(e);
                    break;
                }
                Err(e) => tracing::warn!(error = %e, "Cancel incomplete"),
            }
        }
        drop(stream);
        self.db.commit_many(&confirmed)?;
        outcome?;
        confirmed.sort_unstable();
        tracing::info!(requested = job_nums.len(), confirmed = confirmed.len(), "Cancelled jobs");
        Ok(confirmed)
    }

    async fn retrieve_phase(&mut self, report: &mut CycleReport) -> Result<()> {
        let by_id = self.ids_in(|state| state == JobState::Done);
        if by_id.is_empty() {
            return Ok(());
        }

        let backend = self.backend.clone();
        let mut stream = backend.retrieve(by_id.keys().cloned().collect());
        let mut dirty = Vec::new();
        let mut outcome = Ok(());
        while let Some(item) = stream.next().await {
            match item {
                Ok((id, dir)) => {
                    let Some(&job_num) = by_id.get(&id) else {
                        continue;
                    };
                    let exit_code = match dir {
                        Some(dir) => validate_output(&dir).await,
                        None => None,
                    };
                    let state = if exit_code == Some(0) {
                        JobState::Success
                    } else {
                        JobState::Failed
                    };
                    let job = self.db.get_mut(job_num)?;
                    job.exit_code = exit_code;
                    if let Err(e) = job.advance(job_num, state) {
                        outcome = Err(e);
                        break;
                    }
                    tracing::info!(job = job_num, global_id = %id, ?exit_code, %state, "Retrieved job");
                    report.retrieved += 1;
                    if state == JobState::Success {
                        report.succeeded += 1;
                    }
                    dirty.push(job_num);
                }
                Err(e) if e.is_fatal() => {
                    outcome = Err(e);
                    break;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Retrieval incomplete");
                    report.errors.push(e);
                }
            }
        }
        drop(stream);
        self.db.commit_many(&dirty)?;
        outcome
    }

    async fn status_phase(&mut self, report: &mut CycleReport) -> Result<()> {
        let by_id = self.ids_in(|state| state.is_outstanding() && state != JobState::Done);
        if by_id.is_empty() {
            return Ok(());
        }

        let backend = self.backend.clone();
        let mut stream = backend.check(by_id.keys().cloned().collect());
        let mut seen = HashSet::new();
        let mut failed_backends = HashSet::new();
        let mut unattributed_failure = false;
        let mut dirty = Vec::new();
        let mut outcome = Ok(());
        while let Some(item) = stream.next().await {
            match item {
                Ok(status) => {
                    let Some(&job_num) = by_id.get(&status.global_id) else {
                        continue;
                    };
                    seen.insert(job_num);
                    report.checked += 1;
                    let job = self.db.get_mut(job_num)?;
                    let from = job.state();
                    job.merge_attributes(status.attributes);
                    match job.advance(job_num, status.state) {
                        Ok(true) => {
                            tracing::info!(job = job_num, %from, to = %status.state, "Job state changed");
                        }
                        Ok(false) => {}
                        Err(e) => {
                            dirty.push(job_num);
                            outcome = Err(e);
                            break;
                        }
                    }
                    dirty.push(job_num);
                }
                Err(e) if e.is_fatal() => {
                    tracing::error!(error = %e, "Status check halted");
                    outcome = Err(e);
                    break;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Status check incomplete");
                    match &e {
                        GridError::Backend(be) => {
                            failed_backends.insert(be.backend.clone());
                        }
                        _ => unattributed_failure = true,
                    }
                    report.errors.push(e);
                }
            }
        }
        drop(stream);

        if outcome.is_ok() && !unattributed_failure {
            for (id, &job_num) in &by_id {
                if seen.contains(&job_num) {
                    self.missing.remove(&job_num);
                    continue;
                }
                // A stray prefix is answered by whichever backend it routes to.
                if failed_backends.contains(self.backend.route(id)) {
                    continue;
                }
                let misses = self.missing.entry(job_num).or_insert(0);
                *misses += 1;
                if *misses < self.limits.grace_cycles {
                    tracing::debug!(job = job_num, misses = *misses, "Job missing from status report");
                    continue;
                }
                self.missing.remove(&job_num);
                let job = self.db.get_mut(job_num)?;
                job.advance(job_num, JobState::Failed)?;
                tracing::warn!(job = job_num, global_id = %id, "Job lost by backend");
                report.lost += 1;
                dirty.push(job_num);
            }
        }

        dirty.sort_unstable();
        dirty.dedup();
        self.db.commit_many(&dirty)?;
        outcome
    }

    async fn submit_phase(&mut self, report: &mut CycleReport) -> Result<()> {
        self.retire_exhausted(report)?;

        let in_flight = self
            .db
            .iter()
            .filter(|(_, job)| job.state().is_outstanding())
            .count();
        let room = self
            .limits
            .max_in_flight
            .saturating_sub(in_flight)
            .min(self.limits.burst);
        if room == 0 {
            return Ok(());
        }

        let candidates = self.candidates();
        if candidates.is_empty() {
            return Ok(());
        }

        if !self.deployed {
            if let Err(e) = self.backend.deploy(self.task.as_ref()).await {
                tracing::warn!(error = %e, "Deploy failed, skipping submission");
                report.errors.push(e);
                return Ok(());
            }
            self.deployed = true;
        }

        let queues = self.discover_queues(report).await;
        let mut requests = Vec::new();
        for (job_num, reqs) in candidates {
            if requests.len() >= room {
                break;
            }
            let walltime = reqs.walltime.unwrap_or(0);
            match self.backend.can_submit(walltime, true).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::info!(job = job_num, walltime, "Submission paused by backend policy");
                    break;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Submission phase aborted");
                    report.errors.push(e);
                    break;
                }
            }
            let reqs = self.broker.broker(reqs, queues.as_ref());
            if unsatisfiable(&reqs) {
                tracing::debug!(job = job_num, "No site or queue left after brokering");
                continue;
            }
            requests.push(SubmitRequest::new(job_num, reqs));
        }
        if requests.is_empty() {
            return Ok(());
        }

        // The archived form rewrites every record on commit, so it is written
        // once per phase instead.
        let commit_each = self.db.storage() == Storage::Plain;
        let mut pending = Vec::new();
        let backend = self.backend.clone();
        let mut stream = backend.submit(requests, self.task.clone());
        let mut outcome = Ok(());
        while let Some(item) = stream.next().await {
            match item {
                Ok((job_num, Some(id))) => {
                    let attempt = match self.db.get_mut(job_num) {
                        Ok(job) => {
                            if let Err(e) = job.mark_submitted(job_num, id.clone()) {
                                outcome = Err(e);
                                break;
                            }
                            job.attempt()
                        }
                        Err(e) => {
                            outcome = Err(e);
                            break;
                        }
                    };
                    // Commit right away so a crash cannot orphan the backend job.
                    if commit_each {
                        if let Err(e) = self.db.commit(job_num) {
                            outcome = Err(e);
                            break;
                        }
                    } else {
                        pending.push(job_num);
                    }
                    self.missing.remove(&job_num);
                    tracing::debug!(job = job_num, global_id = %id, attempt, "Recorded submission");
                    report.submitted += 1;
                }
                Ok((job_num, None)) => {
                    tracing::warn!(job = job_num, "Submission failed, will retry");
                    report.submit_failed += 1;
                }
                Err(e) if e.is_fatal() => {
                    outcome = Err(e);
                    break;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Submission incomplete");
                    report.errors.push(e);
                }
            }
        }
        drop(stream);
        self.db.commit_many(&pending)?;
        outcome
    }

    /// ABORTED or CANCELLED jobs without attempts left become FAILED for good.
    fn retire_exhausted(&mut self, report: &mut CycleReport) -> Result<()> {
        let limit = self.limits.retry_limit;
        let exhausted = self.db.select(|job| {
            matches!(job.state(), JobState::Aborted | JobState::Cancelled) && job.attempt() >= limit
        });
        for &job_num in &exhausted {
            self.db.get_mut(job_num)?.advance(job_num, JobState::Failed)?;
            tracing::warn!(job = job_num, attempts = limit, "Retry limit reached");
            report.retired += 1;
        }
        self.db.commit_many(&exhausted)
    }

    /// Submittable jobs in job number order, with their task requirements.
    fn candidates(&self) -> Vec<(u32, Requirements)> {
        let limit = self.limits.retry_limit;
        self.db
            .iter()
            .filter(|(_, job)| match job.state() {
                JobState::Init | JobState::Ready => true,
                state if state.is_retryable() => job.attempt() < limit,
                _ => false,
            })
            .filter_map(|(job_num, _)| Some((job_num, self.task.requirements(job_num)?)))
            .collect()
    }

    async fn discover_queues(&mut self, report: &mut CycleReport) -> Option<QueueInfo> {
        let discovery = self.discovery.as_mut()?;
        match discovery.get().await {
            Ok(info) => Some(info.clone()),
            Err(e) => {
                tracing::warn!(error = %e, "Queue discovery failed");
                report.errors.push(e);
                None
            }
        }
    }

    fn ids_in(&self, pred: impl Fn(JobState) -> bool) -> HashMap<GlobalId, u32> {
        self.db
            .iter()
            .filter(|(_, job)| pred(job.state()))
            .filter_map(|(job_num, job)| Some((job.global_id()?.clone(), job_num)))
            .collect()
    }
}

/// A broker left an explicitly empty site or queue list.
fn unsatisfiable(reqs: &Requirements) -> bool {
    matches!(&reqs.sites, Some(sites) if sites.is_empty())
        || matches!(&reqs.queues, Some(queues) if queues.is_empty())
}

/// Exit code recorded in a retrieved output directory.
async fn validate_output(dir: &Path) -> Option<i32> {
    sandbox::read_job_info(dir).await?.exit_code
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_allow_lists_are_unsatisfiable() {
        assert!(!unsatisfiable(&Requirements::default()));
        assert!(unsatisfiable(&Requirements::default().with_queues(Vec::new())));
        assert!(unsatisfiable(&Requirements::default().with_sites(Vec::new())));
        assert!(!unsatisfiable(
            &Requirements::default().with_sites(vec!["site".to_string()])
        ));
    }

    #[tokio::test]
    async fn output_validation_reads_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(validate_output(dir.path()).await, None);
        std::fs::write(dir.path().join(sandbox::INFO_NAME), "EXITCODE=0\n").unwrap();
        assert_eq!(validate_output(dir.path()).await, Some(0));
        std::fs::write(dir.path().join(sandbox::INFO_NAME), "EXITCODE=3\n").unwrap();
        assert_eq!(validate_output(dir.path()).await, Some(3));
    }
}
