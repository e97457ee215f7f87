use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::broker::{Broker, BrokerTarget};
use crate::error::Result;
use crate::task::Requirements;

/// Resource dimension a queue advertises a ceiling for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dimension {
    Walltime,
    Cputime,
    Memory,
    Cpus,
}

pub type Ceilings = BTreeMap<Dimension, u64>;

/// Snapshot of discovered queues and their ceilings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueueInfo {
    queues: BTreeMap<String, Ceilings>,
}

impl QueueInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_queue(mut self, name: impl Into<String>, ceilings: Ceilings) -> Self {
        self.queues.insert(name.into(), ceilings);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.queues.keys()
    }

    pub fn ceilings(&self, queue: &str) -> Option<&Ceilings> {
        self.queues.get(queue)
    }

    /// Queues whose ceilings cover `reqs` on every dimension both sides define.
    pub fn matching(&self, reqs: &Requirements) -> Vec<String> {
        let wanted = requested(reqs);
        self.queues
            .iter()
            .filter(|(_, ceilings)| {
                wanted.iter().all(|(dim, need)| match ceilings.get(dim) {
                    Some(limit) => limit >= need,
                    None => true,
                })
            })
            .map(|(name, _)| name.clone())
            .collect()
    }
}

fn requested(reqs: &Requirements) -> Vec<(Dimension, u64)> {
    [
        (Dimension::Walltime, reqs.walltime),
        (Dimension::Cputime, reqs.cputime),
        (Dimension::Memory, reqs.memory),
        (Dimension::Cpus, reqs.cpus),
    ]
    .into_iter()
    .filter_map(|(dim, value)| value.map(|v| (dim, v)))
    .collect()
}

/// Keeps the queues able to run the job, intersected with the allow-list.
#[derive(Debug, Clone)]
pub struct CapabilityBroker {
    target: BrokerTarget,
    allow: Vec<String>,
}

impl CapabilityBroker {
    pub fn new(target: BrokerTarget, allow: Vec<String>) -> Self {
        Self { target, allow }
    }
}

impl Broker for CapabilityBroker {
    fn broker(&mut self, mut reqs: Requirements, queues: Option<&QueueInfo>) -> Requirements {
        let discovered = queues.filter(|q| !q.is_empty());
        let selected = match discovered {
            None => self.target.candidates(&self.allow, &reqs),
            Some(info) => {
                let matched = info.matching(&reqs);
                let allowed = self.target.candidates(&self.allow, &reqs);
                if allowed.is_empty() && self.target.get(&reqs).is_none() {
                    matched
                } else {
                    allowed
                        .into_iter()
                        .filter(|q| matched.contains(q))
                        .collect()
                }
            }
        };
        if discovered.is_none() && selected.is_empty() {
            return reqs;
        }
        if selected.is_empty() {
            tracing::warn!(
                broker_target = %self.target,
                "No discovered queue satisfies the job requirements"
            );
        }
        self.target.set(&mut reqs, selected);
        reqs
    }
}

/// Source of [`QueueInfo`].
#[async_trait]
pub trait QueueDiscovery: Send + Sync {
    async fn discover(&self) -> Result<QueueInfo>;
}

/// Queue information taken from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticQueues(pub QueueInfo);

#[async_trait]
impl QueueDiscovery for StaticQueues {
    async fn discover(&self) -> Result<QueueInfo> {
        Ok(self.0.clone())
    }
}

/// Caches discovery results until explicitly invalidated.
pub struct DiscoveryCache {
    source: Box<dyn QueueDiscovery>,
    cached: Option<QueueInfo>,
}

impl DiscoveryCache {
    pub fn new(source: impl QueueDiscovery + 'static) -> Self {
        Self {
            source: Box::new(source),
            cached: None,
        }
    }

    pub async fn get(&mut self) -> Result<&QueueInfo> {
        if self.cached.is_none() {
            let info = self.source.discover().await?;
            tracing::info!(queues = info.len(), "Discovered queues");
            self.cached = Some(info);
        }
        Ok(self.cached.get_or_insert_with(QueueInfo::default))
    }

    pub fn invalidate(&mut self) {
        self.cached = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn queues() -> QueueInfo {
        QueueInfo::new()
            .with_queue("Q1", Ceilings::from([(Dimension::Walltime, 100)]))
            .with_queue(
                "Q2",
                Ceilings::from([(Dimension::Walltime, 50), (Dimension::Memory, 200)]),
            )
    }

    #[test]
    fn walltime_requirement_selects_q1_only() {
        let reqs = Requirements::default().with_walltime(60);
        assert_eq!(queues().matching(&reqs), vec!["Q1"]);
    }

    #[test]
    fn incomparable_queues_are_both_kept() {
        let reqs = Requirements::default().with_walltime(40).with_memory(150);
        assert_eq!(queues().matching(&reqs), vec!["Q1", "Q2"]);
    }

    #[test]
    fn broker_intersects_with_allow_list() {
        let mut broker = CapabilityBroker::new(BrokerTarget::Queues, vec!["Q2".to_string()]);
        let reqs = Requirements::default().with_walltime(40);
        let out = broker.broker(reqs, Some(&queues()));
        assert_eq!(out.queues, Some(vec!["Q2".to_string()]));
    }

    #[test]
    fn broker_uses_matched_set_without_allow_list() {
        let mut broker = CapabilityBroker::new(BrokerTarget::Queues, Vec::new());
        let out = broker.broker(Requirements::default().with_walltime(60), Some(&queues()));
        assert_eq!(out.queues, Some(vec!["Q1".to_string()]));
    }

    #[test]
    fn nothing_discovered_and_nothing_allowed_adds_no_requirement() {
        let mut broker = CapabilityBroker::new(BrokerTarget::Queues, Vec::new());
        let reqs = Requirements::default().with_walltime(60);
        assert!(broker.broker(reqs.clone(), None).queues.is_none());
        assert!(broker
            .broker(reqs, Some(&QueueInfo::new()))
            .queues
            .is_none());
    }

    struct CountingDiscovery(Arc<AtomicU32>);

    #[async_trait]
    impl QueueDiscovery for CountingDiscovery {
        async fn discover(&self) -> Result<QueueInfo> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(queues())
        }
    }

    #[tokio::test]
    async fn discovery_is_cached_until_invalidated() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut cache = DiscoveryCache::new(CountingDiscovery(calls.clone()));

        assert_eq!(cache.get().await.unwrap().len(), 2);
        assert_eq!(cache.get().await.unwrap().len(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        cache.invalidate();
        cache.get().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
