use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};

/// Per-agent record of the ranges it has not completed yet.
///
/// An agent id seen for the first time starts with every range unseen.
/// Ranges leave an agent's set only when that agent's submission is accepted.
#[derive(Debug)]
pub struct SeenRangesIndex {
    range_count: usize,
    unseen: Mutex<HashMap<String, BTreeSet<usize>>>,
}

impl SeenRangesIndex {
    pub fn new(range_count: usize) -> Self {
        Self {
            range_count,
            unseen: Mutex::new(HashMap::new()),
        }
    }

    /// Unseen range ids for `agent_id` in ascending order, registering the
    /// agent if it is new
    pub fn unseen_for(&self, agent_id: &str) -> Vec<usize> {
        let mut unseen = self.unseen.lock();
        unseen
            .entry(agent_id.to_string())
            .or_insert_with(|| (0..self.range_count).collect())
            .iter()
            .copied()
            .collect()
    }

    /// Record that `agent_id` completed `range_id`
    pub fn mark_seen(&self, agent_id: &str, range_id: usize) {
        if let Some(set) = self.unseen.lock().get_mut(agent_id) {
            set.remove(&range_id);
        }
    }

    pub fn has_seen(&self, agent_id: &str, range_id: usize) -> bool {
        self.unseen
            .lock()
            .get(agent_id)
            .is_some_and(|set| !set.contains(&range_id))
    }

    /// Number of agents that have ever asked for work
    pub fn agent_count(&self) -> usize {
        self.unseen.lock().len()
    }
}
