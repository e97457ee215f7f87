//! One [`BackendHandle`] facade over several backends.
//!
//! New jobs are assigned to a backend by an internal random selection; every
//! later call for a job is routed by the backend name embedded in its
//! [`GlobalId`], so routing never needs to contact a backend. Ids whose prefix
//! names no known backend fall to the default backend.

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use futures::FutureExt;
use tokio::task::JoinSet;

use crate::backend::{
    BackendHandle, CancelStream, CheckStream, GlobalId, ResultStream, RetrieveStream,
    SharedBackend, SubmitRequest, SubmitStream,
};
use crate::broker::Selection;
use crate::error::{BackendError, CallKind, FailureClass, GridError, Result};
use crate::task::Task;

pub const ROUTER_NAME: &str = "multi";

type Bucket<'a, I> = (&'a SharedBackend, Vec<I>);

pub struct MultiBackendRouter {
    default: String,
    backends: BTreeMap<String, SharedBackend>,
    selection: Mutex<Selection>,
    threaded: bool,
}

impl MultiBackendRouter {
    pub fn new(default: SharedBackend) -> Self {
        let name = default.name().to_string();
        Self {
            default: name.clone(),
            backends: BTreeMap::from([(name, default)]),
            selection: Mutex::new(Selection::random(1)),
            threaded: false,
        }
    }

    /// Add a backend under its own name.
    pub fn with_backend(mut self, backend: SharedBackend) -> Result<Self> {
        let name = backend.name().to_string();
        if name.contains('.') {
            return Err(GridError::Config(format!(
                "backend name {:?} must not contain '.'",
                name
            )));
        }
        if self.backends.contains_key(&name) {
            return Err(GridError::Config(format!("duplicate backend name {:?}", name)));
        }
        self.backends.insert(name, backend);
        Ok(self)
    }

    /// Run each backend's bucket as its own task.
    pub fn threaded(mut self, threaded: bool) -> Self {
        self.threaded = threaded;
        self
    }

    /// Replace the selection assigning new jobs to backends.
    pub fn with_selection(mut self, selection: Selection) -> Self {
        self.selection = Mutex::new(selection);
        self
    }

    pub fn is_threaded(&self) -> bool {
        self.threaded
    }

    pub fn default_backend(&self) -> &str {
        &self.default
    }

    pub fn backend_names(&self) -> Vec<String> {
        self.backends.keys().cloned().collect()
    }

    /// Name of the member backend `id` is dispatched to.
    fn owner(&self, id: &GlobalId) -> &str {
        match self.backends.get_key_value(id.backend()) {
            Some((name, _)) => name,
            None => &self.default,
        }
    }

    fn backend(&self, name: &str) -> &SharedBackend {
        match self.backends.get(name) {
            Some(backend) => backend,
            None => &self.backends[&self.default],
        }
    }

    fn bucket_ids(&self, ids: Vec<GlobalId>) -> Vec<Bucket<'_, GlobalId>> {
        let mut buckets: BTreeMap<&str, Vec<GlobalId>> = BTreeMap::new();
        for id in ids {
            let name = self.owner(&id);
            if name != id.backend() {
                tracing::debug!(global_id = %id, fallback = name, "Unknown backend prefix");
            }
            buckets.entry(name).or_default().push(id);
        }
        buckets
            .into_iter()
            .map(|(name, ids)| (self.backend(name), ids))
            .collect()
    }

    fn bucket_requests(&self, requests: Vec<SubmitRequest>) -> Vec<Bucket<'_, SubmitRequest>> {
        let names = self.backend_names();
        let mut selection = self.selection.lock().unwrap_or_else(|e| e.into_inner());
        let mut buckets: BTreeMap<String, Vec<SubmitRequest>> = BTreeMap::new();
        for request in requests {
            let name = selection
                .pick(&names)
                .into_iter()
                .next()
                .unwrap_or_else(|| self.default.clone());
            tracing::debug!(job = request.job, backend = %name, "Assigned job to backend");
            buckets.entry(name).or_default().push(request);
        }
        buckets
            .into_iter()
            .map(|(name, requests)| (self.backend(&name), requests))
            .collect()
    }

    /// Invoke `call` on every bucket and merge the results.
    fn dispatch<'a, I, T, F>(
        &'a self,
        buckets: Vec<Bucket<'a, I>>,
        kind: CallKind,
        call: F,
    ) -> ResultStream<'a, T>
    where
        I: Send + 'static,
        T: Send + 'static,
        F: for<'b> Fn(&'b dyn BackendHandle, Vec<I>) -> ResultStream<'b, T>
            + Clone
            + Send
            + Sync
            + 'static,
    {
        if buckets.is_empty() {
            return stream::empty().boxed();
        }
        if self.threaded {
            fork_join(buckets, kind, call)
        } else {
            stream::iter(buckets)
                .flat_map(move |(backend, items)| call(backend.as_ref(), items))
                .boxed()
        }
    }
}

/// One task per bucket, all joined before any result is yielded.
fn fork_join<'a, I, T, F>(buckets: Vec<Bucket<'a, I>>, kind: CallKind, call: F) -> ResultStream<'a, T>
where
    I: Send + 'static,
    T: Send + 'static,
    F: for<'b> Fn(&'b dyn BackendHandle, Vec<I>) -> ResultStream<'b, T>
        + Clone
        + Send
        + Sync
        + 'static,
{
    let owned: Vec<(SharedBackend, Vec<I>)> = buckets
        .into_iter()
        .map(|(backend, items)| (Arc::clone(backend), items))
        .collect();

    let joined = async move {
        let mut workers = JoinSet::new();
        for (backend, items) in owned {
            let call = call.clone();
            workers.spawn(async move {
                let name = backend.name().to_string();
                let outcome = AssertUnwindSafe(async move {
                    call(backend.as_ref(), items).collect::<Vec<_>>().await
                })
                .catch_unwind()
                .await;
                match outcome {
                    Ok(results) => results,
                    Err(_) => {
                        tracing::error!(backend = %name, call = %kind, "Backend worker panicked");
                        vec![Err(BackendError::new(
                            name,
                            kind,
                            FailureClass::Panic,
                            "worker panicked",
                        )
                        .into())]
                    }
                }
            });
        }

        let mut merged = Vec::new();
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(results) => merged.extend(results),
                Err(e) => merged.push(Err(GridError::Internal(format!(
                    "backend worker did not finish: {}",
                    e
                )))),
            }
        }
        merged
    };

    stream::once(joined)
        .flat_map(stream::iter)
        .boxed()
}

#[async_trait]
impl BackendHandle for MultiBackendRouter {
    fn name(&self) -> &str {
        ROUTER_NAME
    }

    fn route(&self, id: &GlobalId) -> &str {
        self.backend(self.owner(id)).route(id)
    }

    fn min_interval(&self) -> Duration {
        self.backends
            .values()
            .map(|b| b.min_interval())
            .max()
            .unwrap_or(Duration::ZERO)
    }

    async fn can_submit(&self, needed_walltime: u64, upstream_ok: bool) -> Result<bool> {
        let mut ok = upstream_ok;
        for (name, backend) in &self.backends {
            ok = backend.can_submit(needed_walltime, ok).await?;
            if !ok {
                tracing::debug!(backend = %name, "Backend refuses submission");
            }
        }
        Ok(ok)
    }

    async fn deploy(&self, task: &dyn Task) -> Result<()> {
        for backend in self.backends.values() {
            backend.deploy(task).await?;
        }
        Ok(())
    }

    fn submit(&self, requests: Vec<SubmitRequest>, task: Arc<dyn Task>) -> SubmitStream<'_> {
        let buckets = self.bucket_requests(requests);
        self.dispatch(buckets, CallKind::Submit, move |backend, requests| {
            backend.submit(requests, task.clone())
        })
    }

    fn check(&self, ids: Vec<GlobalId>) -> CheckStream<'_> {
        let buckets = self.bucket_ids(ids);
        self.dispatch(buckets, CallKind::Check, |backend, ids| backend.check(ids))
    }

    fn retrieve(&self, ids: Vec<GlobalId>) -> RetrieveStream<'_> {
        let buckets = self.bucket_ids(ids);
        self.dispatch(buckets, CallKind::Retrieve, |backend, ids| backend.retrieve(ids))
    }

    fn cancel(&self, ids: Vec<GlobalId>) -> CancelStream<'_> {
        let buckets = self.bucket_ids(ids);
        self.dispatch(buckets, CallKind::Cancel, |backend, ids| backend.cancel(ids))
    }
}
