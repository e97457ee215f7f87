//! Requirement brokering: narrow where a job may run before it is submitted.
//!
//! A [`Broker`] receives the requirements of one job plus the currently
//! discovered queue capabilities and returns possibly augmented requirements.
//! Brokers are heuristics, not matchmakers: when they have nothing to go on
//! they leave the requirements untouched.

pub mod capability;
pub mod selection;

pub use capability::{
    CapabilityBroker, Ceilings, Dimension, DiscoveryCache, QueueDiscovery, QueueInfo, StaticQueues,
};
pub use selection::{Selection, SelectionBroker, SelectionMode};

use serde::{Deserialize, Serialize};

use crate::task::Requirements;

/// Which requirement list a broker restricts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerTarget {
    Sites,
    Queues,
}

impl BrokerTarget {
    pub fn get(self, reqs: &Requirements) -> Option<&Vec<String>> {
        match self {
            BrokerTarget::Sites => reqs.sites.as_ref(),
            BrokerTarget::Queues => reqs.queues.as_ref(),
        }
    }

    pub fn set(self, reqs: &mut Requirements, values: Vec<String>) {
        match self {
            BrokerTarget::Sites => reqs.sites = Some(values),
            BrokerTarget::Queues => reqs.queues = Some(values),
        }
    }

    /// Candidates for this target: the allow-list (or, for sites, the job's
    /// storage locations), narrowed by any restriction the job already has.
    pub fn candidates(self, allow: &[String], reqs: &Requirements) -> Vec<String> {
        let base: &[String] = if allow.is_empty() && self == BrokerTarget::Sites {
            &reqs.storage
        } else {
            allow
        };
        match self.get(reqs) {
            Some(existing) if base.is_empty() => existing.clone(),
            Some(existing) => base
                .iter()
                .filter(|c| existing.contains(c))
                .cloned()
                .collect(),
            None => base.to_vec(),
        }
    }
}

impl std::fmt::Display for BrokerTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BrokerTarget::Sites => write!(f, "sites"),
            BrokerTarget::Queues => write!(f, "queues"),
        }
    }
}

pub trait Broker: Send {
    fn broker(&mut self, reqs: Requirements, queues: Option<&QueueInfo>) -> Requirements;
}

/// Leaves requirements untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullBroker;

impl Broker for NullBroker {
    fn broker(&mut self, reqs: Requirements, _queues: Option<&QueueInfo>) -> Requirements {
        reqs
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerStrategy {
    #[default]
    None,
    First,
    Random,
    Coverage,
    Capability,
}

/// Configuration of the broker for one target.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerSpec {
    pub strategy: BrokerStrategy,
    pub allow: Vec<String>,
    /// Maximum number of entries to keep; 0 keeps all
    pub count: usize,
}

impl BrokerSpec {
    pub fn new(strategy: BrokerStrategy) -> Self {
        Self {
            strategy,
            ..Default::default()
        }
    }

    pub fn with_allow(mut self, allow: Vec<String>) -> Self {
        self.allow = allow;
        self
    }

    pub fn with_count(mut self, count: usize) -> Self {
        self.count = count;
        self
    }

    pub fn build(&self, target: BrokerTarget, seed: Option<u64>) -> Box<dyn Broker> {
        let selection = |mode| Selection::new(mode, self.count, seed);
        match self.strategy {
            BrokerStrategy::None => Box::new(NullBroker),
            BrokerStrategy::First => Box::new(SelectionBroker::new(
                target,
                self.allow.clone(),
                selection(SelectionMode::First),
            )),
            BrokerStrategy::Random => Box::new(SelectionBroker::new(
                target,
                self.allow.clone(),
                selection(SelectionMode::Random),
            )),
            BrokerStrategy::Coverage => Box::new(SelectionBroker::new(
                target,
                self.allow.clone(),
                selection(SelectionMode::Coverage),
            )),
            BrokerStrategy::Capability => {
                Box::new(CapabilityBroker::new(target, self.allow.clone()))
            }
        }
    }
}

/// Applies a site broker and then a queue broker.
pub struct BrokerChain {
    brokers: Vec<Box<dyn Broker>>,
}

impl Default for BrokerChain {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl BrokerChain {
    pub fn new(brokers: Vec<Box<dyn Broker>>) -> Self {
        Self { brokers }
    }

    pub fn from_specs(sites: &BrokerSpec, queues: &BrokerSpec, seed: Option<u64>) -> Self {
        Self::new(vec![
            sites.build(BrokerTarget::Sites, seed),
            queues.build(BrokerTarget::Queues, seed),
        ])
    }
}

impl Broker for BrokerChain {
    fn broker(&mut self, reqs: Requirements, queues: Option<&QueueInfo>) -> Requirements {
        self.brokers
            .iter_mut()
            .fold(reqs, |reqs, broker| broker.broker(reqs, queues))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn candidates_fall_back_to_storage_for_sites() {
        let reqs = Requirements::default().with_storage(names(&["se1", "se2"]));
        assert_eq!(
            BrokerTarget::Sites.candidates(&[], &reqs),
            names(&["se1", "se2"])
        );
        assert!(BrokerTarget::Queues.candidates(&[], &reqs).is_empty());
    }

    #[test]
    fn candidates_respect_existing_restriction() {
        let reqs = Requirements::default().with_sites(names(&["b", "c"]));
        assert_eq!(
            BrokerTarget::Sites.candidates(&names(&["a", "b", "c"]), &reqs),
            names(&["b", "c"])
        );
        assert_eq!(BrokerTarget::Sites.candidates(&[], &reqs), names(&["b", "c"]));
    }

    #[test]
    fn null_strategy_adds_nothing() {
        let mut broker = BrokerSpec::default().build(BrokerTarget::Sites, None);
        let reqs = Requirements::default().with_walltime(10);
        assert_eq!(broker.broker(reqs.clone(), None), reqs);
    }

    #[test]
    fn chain_applies_sites_then_queues() {
        let sites = BrokerSpec::new(BrokerStrategy::First)
            .with_allow(names(&["s1", "s2"]))
            .with_count(1);
        let queues = BrokerSpec::new(BrokerStrategy::First).with_allow(names(&["short"]));
        let mut chain = BrokerChain::from_specs(&sites, &queues, Some(1));

        let out = chain.broker(Requirements::default(), None);
        assert_eq!(out.sites, Some(names(&["s1"])));
        assert_eq!(out.queues, Some(names(&["short"])));
    }
}
