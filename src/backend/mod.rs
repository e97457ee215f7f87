//! Uniform contract over batch and grid backends.
//!
//! Every concrete scheduler is reached through [`BackendHandle`]. Calls that
//! take a list of jobs or ids return a single-pass [`ResultStream`]:
//!
//! - Per-job failures are data (`None` or absence), never errors
//! - A systemic failure is yielded as one `Err` item, after which the stream ends
//! - Empty input yields an empty stream without contacting the backend
//!
//! # Components
//!
//! - [`GlobalId`]: `WMSID.<backend>.<local-id>` identifier assigned at submission
//! - [`context`], [`process`], [`sandbox`]: helpers shared by the concrete backends
//! - [`host`], [`slurm`]: concrete backends
//! - [`multi`]: the router composing several backends behind one handle
//! - [`registry`]: name to constructor factory used at startup

pub mod context;
pub mod host;
pub mod multi;
pub mod process;
pub mod registry;
pub mod sandbox;
pub mod slurm;

pub use multi::MultiBackendRouter;
pub use registry::BackendRegistry;

use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};

use crate::error::{GridError, Result};
use crate::scheduler::JobState;
use crate::task::{Requirements, Task};

/// Marker prefixed to every rendered global id.
pub const GLOBAL_ID_MARKER: &str = "WMSID";

/// Identifier of one submission, encoding the backend that issued it.
///
/// The backend name never contains `.`, so the name is everything up to the
/// first separator after the marker and the local id is the remainder.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct GlobalId {
    backend: String,
    local: String,
}

impl GlobalId {
    pub fn new(backend: impl Into<String>, local: impl Into<String>) -> Self {
        Self {
            backend: backend.into(),
            local: local.into(),
        }
    }

    /// Parse `WMSID.<backend>.<local>`; the marker is optional.
    pub fn parse(text: &str) -> Result<Self> {
        let rest = text
            .strip_prefix(GLOBAL_ID_MARKER)
            .and_then(|r| r.strip_prefix('.'))
            .unwrap_or(text);
        match rest.split_once('.') {
            Some((backend, local)) if !backend.is_empty() && !local.is_empty() => {
                Ok(Self::new(backend, local))
            }
            _ => Err(GridError::InvalidGlobalId(text.to_string())),
        }
    }

    pub fn backend(&self) -> &str {
        &self.backend
    }

    pub fn local(&self) -> &str {
        &self.local
    }
}

impl std::fmt::Display for GlobalId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", GLOBAL_ID_MARKER, self.backend, self.local)
    }
}

impl TryFrom<String> for GlobalId {
    type Error = GridError;

    fn try_from(value: String) -> Result<Self> {
        GlobalId::parse(&value)
    }
}

impl From<GlobalId> for String {
    fn from(id: GlobalId) -> Self {
        id.to_string()
    }
}

impl std::str::FromStr for GlobalId {
    type Err = GridError;

    fn from_str(s: &str) -> Result<Self> {
        GlobalId::parse(s)
    }
}

/// One job handed to [`BackendHandle::submit`], with brokered requirements.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmitRequest {
    pub job: u32,
    pub requirements: Requirements,
}

impl SubmitRequest {
    pub fn new(job: u32, requirements: Requirements) -> Self {
        Self { job, requirements }
    }
}

/// State of one id as reported by [`BackendHandle::check`].
#[derive(Debug, Clone, PartialEq)]
pub struct StatusReport {
    pub global_id: GlobalId,
    pub state: JobState,
    pub attributes: BTreeMap<String, String>,
}

impl StatusReport {
    pub fn new(global_id: GlobalId, state: JobState) -> Self {
        Self {
            global_id,
            state,
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

/// Single-pass lazy sequence of backend results.
pub type ResultStream<'a, T> = BoxStream<'a, Result<T>>;

pub type SubmitStream<'a> = ResultStream<'a, (u32, Option<GlobalId>)>;
pub type CheckStream<'a> = ResultStream<'a, StatusReport>;
pub type RetrieveStream<'a> = ResultStream<'a, (GlobalId, Option<PathBuf>)>;
pub type CancelStream<'a> = ResultStream<'a, GlobalId>;

#[async_trait]
pub trait BackendHandle: Send + Sync {
    fn name(&self) -> &str;

    /// Name of the backend that answers for `id`, as tagged in its errors.
    fn route(&self, _id: &GlobalId) -> &str {
        self.name()
    }

    /// Minimum time between two submission or polling rounds.
    fn min_interval(&self) -> Duration {
        Duration::ZERO
    }

    /// AND this backend's own policy into `upstream_ok`.
    async fn can_submit(&self, needed_walltime: u64, upstream_ok: bool) -> Result<bool>;

    /// One-time, idempotent preparation for `task`. Must precede `submit`.
    async fn deploy(&self, task: &dyn Task) -> Result<()>;

    fn submit(&self, requests: Vec<SubmitRequest>, task: Arc<dyn Task>) -> SubmitStream<'_>;

    /// Ids the backend no longer knows are omitted.
    fn check(&self, ids: Vec<GlobalId>) -> CheckStream<'_>;

    fn retrieve(&self, ids: Vec<GlobalId>) -> RetrieveStream<'_>;

    /// Yields only ids whose cancellation was confirmed.
    fn cancel(&self, ids: Vec<GlobalId>) -> CancelStream<'_>;
}

/// Stream over the outcome of one batched backend call.
pub fn from_batch<'a, T, F>(call: F) -> ResultStream<'a, T>
where
    T: Send + 'a,
    F: Future<Output = Result<Vec<T>>> + Send + 'a,
{
    stream::once(call)
        .flat_map(|outcome| match outcome {
            Ok(items) => stream::iter(items.into_iter().map(Ok)).boxed(),
            Err(e) => stream::iter(std::iter::once(Err(e))).boxed(),
        })
        .boxed()
}

/// End the stream right after its first error.
pub fn stop_after_error<'a, T>(inner: ResultStream<'a, T>) -> ResultStream<'a, T>
where
    T: Send + 'a,
{
    inner
        .scan(false, |stopped, item| {
            if *stopped {
                return futures::future::ready(None);
            }
            *stopped = item.is_err();
            futures::future::ready(Some(item))
        })
        .boxed()
}

/// Shared handle to a backend.
pub type SharedBackend = Arc<dyn BackendHandle>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_id_renders_with_marker() {
        let id = GlobalId::new("HOST1", "100000");
        assert_eq!(id.to_string(), "WMSID.HOST1.100000");
    }

    #[test]
    fn global_id_parse_accepts_optional_marker() {
        let with = GlobalId::parse("WMSID.HOST2.300000").unwrap();
        let without = GlobalId::parse("HOST2.300000").unwrap();
        assert_eq!(with, without);
        assert_eq!(with.backend(), "HOST2");
        assert_eq!(with.local(), "300000");
    }

    #[test]
    fn global_id_local_part_may_contain_separator() {
        let id = GlobalId::parse("WMSID.SLURM.4711.3f2a").unwrap();
        assert_eq!(id.backend(), "SLURM");
        assert_eq!(id.local(), "4711.3f2a");
        assert_eq!(GlobalId::parse(&id.to_string()).unwrap(), id);
    }

    #[test]
    fn global_id_rejects_malformed_text() {
        assert!(GlobalId::parse("").is_err());
        assert!(GlobalId::parse("WMSID.HOST").is_err());
        assert!(GlobalId::parse("HOST.").is_err());
        assert!(GlobalId::parse(".123").is_err());
    }

    #[test]
    fn global_id_serializes_as_string() {
        let id = GlobalId::new("HOST", "42.abc");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"WMSID.HOST.42.abc\"");
        let back: GlobalId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[tokio::test]
    async fn batch_stream_yields_items_then_errors_once() {
        let ok: Vec<Result<u32>> = from_batch(async { Ok(vec![1, 2, 3]) }).collect().await;
        assert_eq!(ok.len(), 3);

        let err: Vec<Result<u32>> =
            from_batch(async { Err(GridError::Internal("down".to_string())) })
                .collect()
                .await;
        assert_eq!(err.len(), 1);
        assert!(err[0].is_err());
    }

    #[tokio::test]
    async fn stop_after_error_truncates() {
        let items = vec![
            Ok(1),
            Err(GridError::Internal("down".to_string())),
            Ok(2),
        ];
        let out: Vec<Result<u32>> = stop_after_error(stream::iter(items).boxed())
            .collect()
            .await;
        assert_eq!(out.len(), 2);
        assert!(out[1].is_err());
    }
}
