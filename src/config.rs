use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::access::{AccessPolicy, AccessToken, CommandCredential, TrivialCredential};
use crate::backend::process::{ProcessRunner, DEFAULT_COMMAND_TIMEOUT};
use crate::broker::{BrokerChain, BrokerSpec, QueueInfo};
use crate::error::{GridError, Result};
use crate::task::StaticTask;

/// Top-level configuration, read from a JSON file.
///
/// Every section has defaults, so `{}` is a valid configuration describing an
/// empty task run on one local host backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory holding the job database and the sandboxes
    pub workdir: PathBuf,
    pub task: StaticTask,
    pub jobs: JobsConfig,
    pub credential: CredentialConfig,
    pub broker: BrokerConfig,
    pub backends: Vec<BackendConfig>,
    pub router: RouterConfig,
    pub driver: DriverConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workdir: PathBuf::from("work"),
            task: StaticTask::default(),
            jobs: JobsConfig::default(),
            credential: CredentialConfig::default(),
            broker: BrokerConfig::default(),
            backends: vec![BackendConfig::new("HOST", BackendKind::Host)],
            router: RouterConfig::default(),
            driver: DriverConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| GridError::persistence(path, e))?;
        let config: EngineConfig = serde_json::from_str(&text)
            .map_err(|e| GridError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.backends.is_empty() {
            return Err(GridError::Config("at least one backend is required".to_string()));
        }
        let mut names = HashSet::new();
        for backend in &self.backends {
            if backend.name.is_empty() || backend.name.contains('.') {
                return Err(GridError::Config(format!(
                    "invalid backend name {:?}",
                    backend.name
                )));
            }
            if !names.insert(backend.name.as_str()) {
                return Err(GridError::Config(format!(
                    "duplicate backend name {:?}",
                    backend.name
                )));
            }
        }
        if self.backends.iter().filter(|b| b.default).count() > 1 {
            return Err(GridError::Config("more than one default backend".to_string()));
        }
        if self.jobs.retry_limit == 0 {
            return Err(GridError::Config("jobs.retry_limit must be at least 1".to_string()));
        }
        Ok(())
    }
}

/// Retry and pacing limits of the job manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobsConfig {
    /// Submissions allowed per job, first one included
    pub retry_limit: u32,
    /// Ceiling on jobs submitted but not yet retrieved
    pub max_in_flight: usize,
    /// Ceiling on submissions per cycle
    pub burst: usize,
    /// Consecutive cycles a job may be missing from status reports
    pub grace_cycles: u32,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            retry_limit: 3,
            max_in_flight: 100,
            burst: 10,
            grace_cycles: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialKind {
    #[default]
    Trivial,
    Command,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialConfig {
    pub kind: CredentialKind,
    /// Inspection command for `kind = "command"`
    pub program: String,
    pub args: Vec<String>,
    /// Key of the output line holding the remaining lifetime
    pub key: String,
    /// Seconds before the inspection command is killed
    pub timeout: u64,
    #[serde(flatten)]
    pub policy: AccessPolicy,
}

impl Default for CredentialConfig {
    fn default() -> Self {
        Self {
            kind: CredentialKind::Trivial,
            program: "voms-proxy-info".to_string(),
            args: vec!["--all".to_string()],
            key: "timeleft".to_string(),
            timeout: 10,
            policy: AccessPolicy::default(),
        }
    }
}

impl CredentialConfig {
    pub fn build(&self) -> AccessToken {
        match self.kind {
            CredentialKind::Trivial => AccessToken::new(TrivialCredential, self.policy),
            CredentialKind::Command => {
                let runner = ProcessRunner::new(Duration::from_secs(self.timeout));
                let source = CommandCredential::new(runner, &self.program, self.args.clone())
                    .with_key(&self.key);
                AccessToken::new(source, self.policy)
            }
        }
    }
}

/// Where the capability broker learns about queues.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscoverySource {
    /// `queue_info` from this file
    #[default]
    Static,
    /// Slurm partitions reported by `sinfo`
    Slurm,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub sites: BrokerSpec,
    pub queues: BrokerSpec,
    pub discovery: DiscoverySource,
    pub queue_info: QueueInfo,
    /// Seed for random selections; entropy when unset
    pub seed: Option<u64>,
}

impl BrokerConfig {
    pub fn build(&self) -> BrokerChain {
        BrokerChain::from_specs(&self.sites, &self.queues, self.seed)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Host,
    Slurm,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Host => "host",
            BackendKind::Slurm => "slurm",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Prefix of the global ids this backend issues
    pub name: String,
    #[serde(default)]
    pub kind: BackendKind,
    /// Receives ids whose prefix names no configured backend
    #[serde(default)]
    pub default: bool,
    /// Seconds between two polls; the backend's own default when unset
    #[serde(default)]
    pub min_interval: Option<u64>,
    /// Seconds before a backend command is killed
    #[serde(default)]
    pub timeout: Option<u64>,
}

impl BackendConfig {
    pub fn new(name: impl Into<String>, kind: BackendKind) -> Self {
        Self {
            name: name.into(),
            kind,
            default: false,
            min_interval: None,
            timeout: None,
        }
    }

    pub fn as_default(mut self) -> Self {
        self.default = true;
        self
    }

    pub fn runner(&self) -> ProcessRunner {
        ProcessRunner::new(
            self.timeout
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_COMMAND_TIMEOUT),
        )
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Fan calls out to the backends concurrently
    pub threaded: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Seconds between cycles, raised to the slowest backend's interval
    pub poll_interval: u64,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self { poll_interval: 60 }
    }
}
