use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::backend::GlobalId;
use crate::error::{GridError, Result};

/// Destination recorded for an attempt before the backend reports one.
pub const UNKNOWN_DESTINATION: &str = "unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobState {
    Init,
    Submitted,
    Disabled,
    Ready,
    Waiting,
    Queued,
    Aborted,
    Running,
    Cancelled,
    Done,
    Failed,
    Success,
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Init => write!(f, "INIT"),
            JobState::Submitted => write!(f, "SUBMITTED"),
            JobState::Disabled => write!(f, "DISABLED"),
            JobState::Ready => write!(f, "READY"),
            JobState::Waiting => write!(f, "WAITING"),
            JobState::Queued => write!(f, "QUEUED"),
            JobState::Aborted => write!(f, "ABORTED"),
            JobState::Running => write!(f, "RUNNING"),
            JobState::Cancelled => write!(f, "CANCELLED"),
            JobState::Done => write!(f, "DONE"),
            JobState::Failed => write!(f, "FAILED"),
            JobState::Success => write!(f, "SUCCESS"),
        }
    }
}

impl std::str::FromStr for JobState {
    type Err = GridError;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s.to_ascii_uppercase().as_str() {
            "INIT" => JobState::Init,
            "SUBMITTED" => JobState::Submitted,
            "DISABLED" => JobState::Disabled,
            "READY" => JobState::Ready,
            "WAITING" => JobState::Waiting,
            "QUEUED" => JobState::Queued,
            "ABORTED" => JobState::Aborted,
            "RUNNING" => JobState::Running,
            "CANCELLED" => JobState::Cancelled,
            "DONE" => JobState::Done,
            "FAILED" => JobState::Failed,
            "SUCCESS" => JobState::Success,
            other => return Err(GridError::Config(format!("unknown job state {other:?}"))),
        })
    }
}

impl JobState {
    pub const ALL: [JobState; 12] = [
        JobState::Init,
        JobState::Submitted,
        JobState::Disabled,
        JobState::Ready,
        JobState::Waiting,
        JobState::Queued,
        JobState::Aborted,
        JobState::Running,
        JobState::Cancelled,
        JobState::Done,
        JobState::Failed,
        JobState::Success,
    ];

    /// States in which the job holds an id the backend is expected to know.
    pub fn is_outstanding(self) -> bool {
        matches!(
            self,
            JobState::Submitted
                | JobState::Waiting
                | JobState::Queued
                | JobState::Running
                | JobState::Done
        )
    }

    /// States reachable only through a backend status report.
    pub fn is_reportable(self) -> bool {
        matches!(
            self,
            JobState::Waiting
                | JobState::Queued
                | JobState::Running
                | JobState::Done
                | JobState::Aborted
                | JobState::Cancelled
                | JobState::Failed
        )
    }

    /// States an attempt can end in that allow another attempt.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            JobState::Aborted | JobState::Cancelled | JobState::Failed
        )
    }

    /// Edges of the automatic job life cycle.
    pub fn can_advance_to(self, to: JobState) -> bool {
        use JobState::*;
        match self {
            Init | Ready => to == Submitted,
            Submitted | Waiting | Queued | Running => to.is_reportable(),
            Done => matches!(to, Success | Failed),
            Aborted | Cancelled => matches!(to, Submitted | Failed),
            Failed => to == Submitted,
            Disabled | Success => false,
        }
    }
}

/// Persistent record of one job number.
///
/// `attempt == 0` exactly when `global_id` is unset: the id is only ever
/// replaced by a newer submission, never cleared.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    state: JobState,
    attempt: u32,
    global_id: Option<GlobalId>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub changed_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    /// attempt -> last known destination
    history: BTreeMap<u32, String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl Default for Job {
    fn default() -> Self {
        Self::new()
    }
}

impl Job {
    pub fn new() -> Self {
        Self {
            state: JobState::Init,
            attempt: 0,
            global_id: None,
            submitted_at: None,
            changed_at: None,
            exit_code: None,
            history: BTreeMap::new(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Id of the current attempt.
    pub fn global_id(&self) -> Option<&GlobalId> {
        self.global_id.as_ref()
    }

    pub fn history(&self) -> &BTreeMap<u32, String> {
        &self.history
    }

    /// Destination of the current attempt, if the job was ever submitted.
    pub fn destination(&self) -> Option<&str> {
        self.history.get(&self.attempt).map(String::as_str)
    }

    /// Record a successful submission under a fresh global id.
    pub fn mark_submitted(&mut self, job_num: u32, global_id: GlobalId) -> Result<()> {
        self.check_edge(job_num, JobState::Submitted)?;
        let now = Utc::now();
        self.attempt += 1;
        self.global_id = Some(global_id);
        self.submitted_at = Some(now);
        self.changed_at = Some(now);
        self.exit_code = None;
        self.attributes.clear();
        self.history
            .insert(self.attempt, UNKNOWN_DESTINATION.to_string());
        self.state = JobState::Submitted;
        Ok(())
    }

    /// Apply a state reported by a backend or derived by the manager.
    ///
    /// Returns `Ok(false)` when the job already is in `to`.
    pub fn advance(&mut self, job_num: u32, to: JobState) -> Result<bool> {
        if self.state == to {
            return Ok(false);
        }
        self.check_edge(job_num, to)?;
        self.state = to;
        self.changed_at = Some(Utc::now());
        Ok(true)
    }

    /// Merge attributes from a status report, updating the destination of the
    /// current attempt when the backend names one.
    pub fn merge_attributes(&mut self, attributes: BTreeMap<String, String>) {
        if let Some(dest) = attributes.get("dest") {
            if self.attempt > 0 {
                self.history.insert(self.attempt, dest.clone());
            }
        }
        self.attributes.extend(attributes);
    }

    /// Out-of-band override used by operator tooling.
    pub fn disable(&mut self, job_num: u32) -> Result<()> {
        if self.state == JobState::Disabled {
            return Ok(());
        }
        if self.state.is_outstanding() {
            return Err(GridError::InvalidTransition {
                job: job_num,
                from: self.state,
                to: JobState::Disabled,
            });
        }
        self.state = JobState::Disabled;
        self.changed_at = Some(Utc::now());
        Ok(())
    }

    /// Out-of-band override making a disabled or finished job submittable again.
    pub fn reset(&mut self, job_num: u32) -> Result<()> {
        match self.state {
            JobState::Disabled
            | JobState::Failed
            | JobState::Aborted
            | JobState::Cancelled
            | JobState::Success => {
                self.state = JobState::Ready;
                self.changed_at = Some(Utc::now());
                Ok(())
            }
            JobState::Init | JobState::Ready => Ok(()),
            from => Err(GridError::InvalidTransition {
                job: job_num,
                from,
                to: JobState::Ready,
            }),
        }
    }

    fn check_edge(&self, job_num: u32, to: JobState) -> Result<()> {
        if self.state.can_advance_to(to) {
            Ok(())
        } else {
            Err(GridError::InvalidTransition {
                job: job_num,
                from: self.state,
                to,
            })
        }
    }
}
