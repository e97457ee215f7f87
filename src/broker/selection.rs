use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::broker::{Broker, BrokerTarget, QueueInfo};
use crate::task::Requirements;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionMode {
    /// Leading entries of the pool, in pool order
    First,
    /// Random entries without replacement
    Random,
    /// Rotate through the pool so consecutive picks start at different entries
    Coverage,
}

/// Picks up to `count` entries from a pool of names.
#[derive(Debug, Clone)]
pub struct Selection {
    mode: SelectionMode,
    count: usize,
    rng: StdRng,
    cursor: usize,
}

impl Selection {
    /// `count == 0` keeps the whole pool. A `seed` makes random picks reproducible.
    pub fn new(mode: SelectionMode, count: usize, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            mode,
            count,
            rng,
            cursor: 0,
        }
    }

    pub fn random(count: usize) -> Self {
        Self::new(SelectionMode::Random, count, None)
    }

    pub fn mode(&self) -> SelectionMode {
        self.mode
    }

    pub fn pick(&mut self, pool: &[String]) -> Vec<String> {
        if pool.is_empty() {
            return Vec::new();
        }
        let take = if self.count == 0 {
            pool.len()
        } else {
            self.count.min(pool.len())
        };
        match self.mode {
            SelectionMode::First => pool[..take].to_vec(),
            SelectionMode::Random => pool
                .choose_multiple(&mut self.rng, take)
                .cloned()
                .collect(),
            SelectionMode::Coverage => {
                let start = self.cursor % pool.len();
                self.cursor = self.cursor.wrapping_add(take);
                pool.iter()
                    .cycle()
                    .skip(start)
                    .take(take)
                    .cloned()
                    .collect()
            }
        }
    }
}

/// Broker restricting one target to a selection from a static allow-list.
#[derive(Debug, Clone)]
pub struct SelectionBroker {
    target: BrokerTarget,
    allow: Vec<String>,
    selection: Selection,
}

impl SelectionBroker {
    pub fn new(target: BrokerTarget, allow: Vec<String>, selection: Selection) -> Self {
        Self {
            target,
            allow,
            selection,
        }
    }
}

impl Broker for SelectionBroker {
    fn broker(&mut self, mut reqs: Requirements, _queues: Option<&QueueInfo>) -> Requirements {
        let pool = self.target.candidates(&self.allow, &reqs);
        if pool.is_empty() {
            return reqs;
        }
        let picked = self.selection.pick(&pool);
        tracing::debug!(broker_target = %self.target, ?picked, "Brokered requirement");
        self.target.set(&mut reqs, picked);
        reqs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn pool(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("site{}", i)).collect()
    }

    #[test]
    fn first_takes_leading_entries() {
        let mut sel = Selection::new(SelectionMode::First, 2, None);
        assert_eq!(sel.pick(&pool(4)), vec!["site0", "site1"]);
        assert_eq!(sel.pick(&pool(4)), vec!["site0", "site1"]);
    }

    #[test]
    fn random_picks_distinct_entries() {
        let mut sel = Selection::new(SelectionMode::Random, 3, Some(7));
        for _ in 0..20 {
            let picked = sel.pick(&pool(5));
            assert_eq!(picked.len(), 3);
            let unique: HashSet<_> = picked.iter().collect();
            assert_eq!(unique.len(), 3);
        }
    }

    #[test]
    fn random_with_same_seed_is_reproducible() {
        let mut a = Selection::new(SelectionMode::Random, 2, Some(42));
        let mut b = Selection::new(SelectionMode::Random, 2, Some(42));
        assert_eq!(a.pick(&pool(6)), b.pick(&pool(6)));
    }

    #[test]
    fn coverage_spreads_consecutive_jobs() {
        let mut sel = Selection::new(SelectionMode::Coverage, 1, None);
        let picks: Vec<Vec<String>> = (0..4).map(|_| sel.pick(&pool(3))).collect();
        assert_eq!(
            picks,
            vec![
                vec!["site0".to_string()],
                vec!["site1".to_string()],
                vec!["site2".to_string()],
                vec!["site0".to_string()],
            ]
        );
    }

    #[test]
    fn count_zero_keeps_whole_pool() {
        let mut sel = Selection::new(SelectionMode::First, 0, None);
        assert_eq!(sel.pick(&pool(3)).len(), 3);
        assert!(sel.pick(&[]).is_empty());
    }

    #[test]
    fn empty_allow_list_adds_no_requirement() {
        let mut broker = SelectionBroker::new(
            BrokerTarget::Queues,
            Vec::new(),
            Selection::new(SelectionMode::First, 1, None),
        );
        let out = broker.broker(Requirements::default(), None);
        assert!(out.queues.is_none());
    }

    #[test]
    fn broker_uses_storage_locations_for_sites() {
        let mut broker = SelectionBroker::new(
            BrokerTarget::Sites,
            Vec::new(),
            Selection::new(SelectionMode::First, 1, None),
        );
        let reqs = Requirements::default().with_storage(vec!["se-a".to_string(), "se-b".to_string()]);
        let out = broker.broker(reqs, None);
        assert_eq!(out.sites, Some(vec!["se-a".to_string()]));
    }
}
