//! Task collaborator: what each job number runs and what it needs.
//!
//! The engine only consumes these traits; parameter-space expansion and
//! dataset partitioning live outside the crate. [`StaticTask`] is the small
//! configuration-driven implementation the binary uses.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Placeholder in task arguments replaced by the job number.
pub const JOB_PLACEHOLDER: &str = "@JOB@";

/// Resource and placement requirements of one job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Requirements {
    /// Wall clock time in seconds
    pub walltime: Option<u64>,
    /// CPU time in seconds
    pub cputime: Option<u64>,
    /// Memory in MB
    pub memory: Option<u64>,
    pub cpus: Option<u64>,
    /// Storage elements holding the job's input data
    pub storage: Vec<String>,
    /// Sites the job may run at; `None` means unrestricted
    pub sites: Option<Vec<String>>,
    /// Queues the job may run in; `None` means unrestricted
    pub queues: Option<Vec<String>>,
}

impl Requirements {
    pub fn with_walltime(mut self, seconds: u64) -> Self {
        self.walltime = Some(seconds);
        self
    }

    pub fn with_memory(mut self, megabytes: u64) -> Self {
        self.memory = Some(megabytes);
        self
    }

    pub fn with_cputime(mut self, seconds: u64) -> Self {
        self.cputime = Some(seconds);
        self
    }

    pub fn with_cpus(mut self, cpus: u64) -> Self {
        self.cpus = Some(cpus);
        self
    }

    pub fn with_storage(mut self, storage: Vec<String>) -> Self {
        self.storage = storage;
        self
    }

    pub fn with_sites(mut self, sites: Vec<String>) -> Self {
        self.sites = Some(sites);
        self
    }

    pub fn with_queues(mut self, queues: Vec<String>) -> Self {
        self.queues = Some(queues);
        self
    }
}

/// Executable description of one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobCommand {
    pub executable: String,
    pub arguments: Vec<String>,
    pub env: BTreeMap<String, String>,
}

pub trait Task: Send + Sync {
    fn task_id(&self) -> &str;

    /// Number of jobs, fixed for the lifetime of the task.
    fn job_count(&self) -> u32;

    /// Requirements of a job, or `None` while they are not yet known.
    fn requirements(&self, job: u32) -> Option<Requirements>;

    fn command(&self, job: u32) -> JobCommand;
}

/// Dataset collaborator: where a job's input data lives.
pub trait StorageAffinity: Send + Sync {
    fn locations(&self, job: u32) -> Vec<String>;
}

/// Task with one command line and one set of requirements for every job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StaticTask {
    pub task_id: String,
    pub job_count: u32,
    pub executable: String,
    pub arguments: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub requirements: Requirements,
    /// job number -> storage locations of its input
    pub storage: BTreeMap<u32, Vec<String>>,
}

impl Default for StaticTask {
    fn default() -> Self {
        Self {
            task_id: "GC000000000000".to_string(),
            job_count: 0,
            executable: "/bin/true".to_string(),
            arguments: Vec::new(),
            env: BTreeMap::new(),
            requirements: Requirements::default(),
            storage: BTreeMap::new(),
        }
    }
}

impl StaticTask {
    pub fn new(job_count: u32, executable: impl Into<String>) -> Self {
        Self {
            job_count,
            executable: executable.into(),
            ..Default::default()
        }
    }

    pub fn with_arguments(mut self, arguments: Vec<String>) -> Self {
        self.arguments = arguments;
        self
    }

    pub fn with_requirements(mut self, requirements: Requirements) -> Self {
        self.requirements = requirements;
        self
    }
}

impl StorageAffinity for StaticTask {
    fn locations(&self, job: u32) -> Vec<String> {
        self.storage.get(&job).cloned().unwrap_or_default()
    }
}

impl Task for StaticTask {
    fn task_id(&self) -> &str {
        &self.task_id
    }

    fn job_count(&self) -> u32 {
        self.job_count
    }

    fn requirements(&self, job: u32) -> Option<Requirements> {
        if job >= self.job_count {
            return None;
        }
        let mut reqs = self.requirements.clone();
        let locations = self.locations(job);
        if !locations.is_empty() {
            reqs.storage = locations;
        }
        Some(reqs)
    }

    fn command(&self, job: u32) -> JobCommand {
        let job_text = job.to_string();
        JobCommand {
            executable: self.executable.clone(),
            arguments: self
                .arguments
                .iter()
                .map(|a| a.replace(JOB_PLACEHOLDER, &job_text))
                .collect(),
            env: self.env.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_substitutes_job_number() {
        let task = StaticTask::new(3, "/bin/echo")
            .with_arguments(vec!["job".to_string(), "@JOB@".to_string()]);
        let cmd = task.command(2);
        assert_eq!(cmd.executable, "/bin/echo");
        assert_eq!(cmd.arguments, vec!["job", "2"]);
    }

    #[test]
    fn requirements_include_storage_affinity() {
        let mut task = StaticTask::new(2, "/bin/true")
            .with_requirements(Requirements::default().with_walltime(3600));
        task.storage
            .insert(1, vec!["se.example.org".to_string()]);

        let reqs0 = task.requirements(0).unwrap();
        assert_eq!(reqs0.walltime, Some(3600));
        assert!(reqs0.storage.is_empty());

        let reqs1 = task.requirements(1).unwrap();
        assert_eq!(reqs1.storage, vec!["se.example.org"]);
    }

    #[test]
    fn requirements_outside_task_are_unknown() {
        let task = StaticTask::new(2, "/bin/true");
        assert!(task.requirements(2).is_none());
    }
}
