use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::lease::error::LeaseError;
use crate::lease::range::IpRange;
use crate::lease::seen::SeenRangesIndex;
use crate::lease::targets::partition;
use crate::stopset::{SafeSet, StopSet, StopSetParams, StopSetSnapshot};

/// A successful acquisition: the range to probe and what is already known about it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RangeGrant {
    pub range_id: usize,
    pub addresses: Vec<Ipv4Addr>,
    pub stops: StopSetSnapshot,
}

/// Results an agent hands back for the range it leased
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Submission {
    pub agent_id: String,
    pub range_id: usize,
    /// Stop keys discovered during the session
    pub stops: StopSetSnapshot,
    /// Responder addresses discovered during the session
    pub nodes: StopSetSnapshot,
}

/// Point-in-time leader bookkeeping
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderStats {
    pub ranges: usize,
    pub leased: usize,
    pub addresses: usize,
    pub agents: usize,
    /// Sum of every shard's `len()`
    pub shard_entries: usize,
    pub nodes: usize,
}

/// The leader's whole state: range table, seen index, discovered nodes.
///
/// Each range has its own lock; no operation takes a lock spanning unrelated
/// ranges. Lock order where two are held: range, then the node set.
pub struct LeaseManager<S: StopSet> {
    ranges: Vec<IpRange<S>>,
    seen: SeenRangesIndex,
    nodes: SafeSet<S>,
    lease_timeout: Duration,
    shutdown: CancellationToken,
}

impl<S: StopSet> LeaseManager<S> {
    /// Build a range per address chunk, each with an empty stop shard
    pub fn new(chunks: Vec<Vec<Ipv4Addr>>, lease_timeout: Duration, params: &StopSetParams) -> Self {
        let ranges: Vec<IpRange<S>> = chunks
            .into_iter()
            .enumerate()
            .map(|(id, addresses)| IpRange::new(id, addresses, S::with_params(params)))
            .collect();
        let count = ranges.len();

        Self {
            ranges,
            seen: SeenRangesIndex::new(count),
            nodes: SafeSet::with_params(params),
            lease_timeout,
            shutdown: CancellationToken::new(),
        }
    }

    /// Partition `addresses` into `range_count` ranges
    pub fn from_addresses(
        addresses: &[Ipv4Addr],
        range_count: usize,
        lease_timeout: Duration,
        params: &StopSetParams,
    ) -> Self {
        Self::new(partition(addresses, range_count), lease_timeout, params)
    }

    pub fn range_count(&self) -> usize {
        self.ranges.len()
    }

    pub fn range(&self, range_id: usize) -> Result<&IpRange<S>, LeaseError> {
        self.ranges
            .get(range_id)
            .ok_or(LeaseError::UnknownRange { range_id })
    }

    pub fn lease_timeout(&self) -> Duration {
        self.lease_timeout
    }

    /// Every responder address reported so far
    pub fn nodes(&self) -> &SafeSet<S> {
        &self.nodes
    }

    /// Lease the first free range `agent_id` has not completed.
    ///
    /// Never waits: returns `NoRangesAvailable` when every unseen range is
    /// held by someone else, `Exhausted` when nothing is left unseen. A grant
    /// arms a reclaim timer, so this must run inside a tokio runtime.
    pub fn acquire_range(self: &Arc<Self>, agent_id: &str) -> Result<RangeGrant, LeaseError> {
        let unseen = self.seen.unseen_for(agent_id);
        if unseen.is_empty() {
            return Err(LeaseError::Exhausted {
                agent_id: agent_id.to_string(),
            });
        }

        for range_id in unseen {
            let range = self.range(range_id)?;
            let mut state = range.lock();
            if !state.is_free() {
                continue;
            }

            state.lessee = Some(agent_id.to_string());
            state.generation += 1;
            let token = self.shutdown.child_token();
            state.reclaim = Some(token.clone());
            let generation = state.generation;
            let grant = RangeGrant {
                range_id,
                addresses: range.addresses().to_vec(),
                stops: state.stops.to_snapshot(),
            };
            drop(state);

            self.arm_reclaim(range_id, generation, token);
            tracing::info!(
                agent_id,
                range_id,
                addresses = grant.addresses.len(),
                "range leased"
            );
            return Ok(grant);
        }

        tracing::debug!(agent_id, "every unseen range is leased");
        Err(LeaseError::NoRangesAvailable {
            agent_id: agent_id.to_string(),
        })
    }

    /// First of {submission, deadline} wins
    fn arm_reclaim(self: &Arc<Self>, range_id: usize, generation: u64, done: CancellationToken) {
        let manager = Arc::clone(self);
        let timeout = self.lease_timeout;
        tokio::spawn(async move {
            tokio::select! {
                _ = done.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    manager.reclaim(range_id, generation);
                }
            }
        });
    }

    /// Merge an agent's results and release its lease.
    ///
    /// Only the current lessee may submit. Anything else is rejected without
    /// touching the shard or the node set, as is a submission whose snapshots
    /// cannot be merged.
    pub fn submit_results(&self, submission: &Submission) -> Result<(), LeaseError> {
        let range_id = submission.range_id;
        let agent_id = submission.agent_id.as_str();
        let range = self.range(range_id)?;

        let mut state = range.lock();
        match state.lessee.as_deref() {
            Some(holder) if holder == agent_id => {}
            Some(holder) => {
                tracing::warn!(agent_id, range_id, holder, "submission from non-holder rejected");
                return Err(LeaseError::NotLeaseHolder { range_id });
            }
            None => {
                tracing::warn!(agent_id, range_id, "submission after lease expiry rejected");
                return Err(LeaseError::LeaseExpired { range_id });
            }
        }

        // Decode both snapshots against the live sets before mutating either
        // The lease stays held; a bad submission waits out the timeout
        let invalid = |e: crate::stopset::StopSetError| {
            tracing::warn!(agent_id, range_id, reason = %e, "unmergeable submission rejected");
            LeaseError::InvalidSubmission {
                range_id,
                reason: e.to_string(),
            }
        };
        let mut stops = state.stops.empty_like();
        stops.union_snapshot(&submission.stops).map_err(invalid)?;
        let mut nodes = self.nodes.lock().empty_like();
        nodes.union_snapshot(&submission.nodes).map_err(invalid)?;

        state.stops.union_with(&stops).map_err(invalid)?;
        self.nodes.union_set(&nodes).map_err(invalid)?;
        state.release();
        drop(state);

        self.seen.mark_seen(agent_id, range_id);
        tracing::info!(
            agent_id,
            range_id,
            new_stops = stops.len(),
            new_nodes = nodes.len(),
            "results merged"
        );
        Ok(())
    }

    /// Clear the lease granted as `generation`, if it is still outstanding.
    ///
    /// Returns whether a lease was cleared. The agent keeps the range in its
    /// unseen set, so anyone (the original holder included) can take it next.
    pub fn reclaim(&self, range_id: usize, generation: u64) -> bool {
        let Ok(range) = self.range(range_id) else {
            return false;
        };
        let mut state = range.lock();
        if state.generation != generation || state.is_free() {
            return false;
        }
        let holder = state.release();
        tracing::info!(range_id, agent_id = holder.as_deref().unwrap_or(""), "lease reclaimed after timeout");
        true
    }

    /// Reclaim a range's lease now, whatever its generation
    pub fn expire_lease(&self, range_id: usize) -> Result<bool, LeaseError> {
        let range = self.range(range_id)?;
        let generation = range.lock().generation;
        Ok(self.reclaim(range_id, generation))
    }

    pub fn stats(&self) -> LeaderStats {
        let mut stats = LeaderStats {
            ranges: self.ranges.len(),
            agents: self.seen.agent_count(),
            nodes: self.nodes.len(),
            ..Default::default()
        };
        for range in &self.ranges {
            stats.addresses += range.addresses().len();
            let state = range.lock();
            if !state.is_free() {
                stats.leased += 1;
            }
            stats.shard_entries += state.stops.len();
        }
        stats
    }

    /// Stop every outstanding reclaim timer
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stopset::{BloomSet, ExactSet, StopKey};
    use std::collections::HashMap;

    fn addrs(n: u8) -> Vec<Ipv4Addr> {
        (1..=n).map(|i| Ipv4Addr::new(198, 51, 100, i)).collect()
    }

    fn manager(ranges: usize, timeout: Duration) -> Arc<LeaseManager<ExactSet>> {
        Arc::new(LeaseManager::from_addresses(
            &addrs(12),
            ranges,
            timeout,
            &StopSetParams::default(),
        ))
    }

    fn keys(keys: &[&str]) -> StopSetSnapshot {
        StopSetSnapshot::Exact {
            keys: keys.iter().map(|k| k.to_string()).collect(),
        }
    }

    fn submission(agent: &str, range_id: usize, stops: &[&str], nodes: &[&str]) -> Submission {
        Submission {
            agent_id: agent.to_string(),
            range_id,
            stops: keys(stops),
            nodes: keys(nodes),
        }
    }

    #[tokio::test]
    async fn test_acquire_first_free_range() {
        let mgr = manager(3, Duration::from_secs(60));
        let a = mgr.acquire_range("a").unwrap();
        let b = mgr.acquire_range("b").unwrap();
        assert_eq!(a.range_id, 0);
        assert_eq!(b.range_id, 1);
        assert_eq!(a.addresses.len(), 4);
        assert_eq!(a.stops, StopSetSnapshot::Exact { keys: vec![] });
        assert_eq!(mgr.range(0).unwrap().lessee().as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_no_ranges_available_then_exhausted() {
        let mgr = manager(1, Duration::from_secs(60));
        let grant = mgr.acquire_range("a").unwrap();
        assert_eq!(
            mgr.acquire_range("b").unwrap_err(),
            LeaseError::NoRangesAvailable { agent_id: "b".into() }
        );

        mgr.submit_results(&submission("a", grant.range_id, &[], &[])).unwrap();
        assert_eq!(
            mgr.acquire_range("a").unwrap_err(),
            LeaseError::Exhausted { agent_id: "a".into() }
        );
        // Another agent still has it unseen
        assert_eq!(mgr.acquire_range("b").unwrap().range_id, 0);
    }

    #[tokio::test]
    async fn test_submit_merges_and_releases() {
        let mgr = manager(2, Duration::from_secs(60));
        let grant = mgr.acquire_range("a").unwrap();
        let key = StopKey::forward(Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(198, 51, 100, 1));

        mgr.submit_results(&submission("a", grant.range_id, &[key.as_str()], &["10.0.0.1"]))
            .unwrap();

        let state = mgr.range(grant.range_id).unwrap().lock();
        assert!(state.is_free());
        assert!(state.stops.contains(key.as_str()));
        drop(state);
        assert!(mgr.nodes().contains("10.0.0.1"));

        // The next agent to lease it receives the merged shard
        let next = mgr.acquire_range("b").unwrap();
        assert_eq!(next.range_id, 0);
        assert_eq!(next.stops, keys(&[key.as_str()]));
    }

    #[tokio::test]
    async fn test_non_holder_submission_changes_nothing() {
        let mgr = manager(2, Duration::from_secs(60));
        let grant = mgr.acquire_range("a").unwrap();

        let err = mgr
            .submit_results(&submission("b", grant.range_id, &["x-y"], &["10.9.9.9"]))
            .unwrap_err();
        assert_eq!(err, LeaseError::NotLeaseHolder { range_id: grant.range_id });

        let state = mgr.range(grant.range_id).unwrap().lock();
        assert!(state.stops.is_empty());
        assert!(state.is_held_by("a"));
        drop(state);
        assert!(mgr.nodes().is_empty());
    }

    #[tokio::test]
    async fn test_submit_after_forced_expiry() {
        let mgr = manager(2, Duration::from_secs(60));
        let grant = mgr.acquire_range("a").unwrap();
        assert!(mgr.expire_lease(grant.range_id).unwrap());
        assert!(!mgr.expire_lease(grant.range_id).unwrap());

        let err = mgr
            .submit_results(&submission("a", grant.range_id, &["x-y"], &["10.9.9.9"]))
            .unwrap_err();
        assert_eq!(err, LeaseError::LeaseExpired { range_id: grant.range_id });
        assert_eq!(mgr.stats().shard_entries, 0);
        assert!(mgr.nodes().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_range() {
        let mgr = manager(2, Duration::from_secs(60));
        assert_eq!(
            mgr.submit_results(&submission("a", 99, &[], &[])).unwrap_err(),
            LeaseError::UnknownRange { range_id: 99 }
        );
        assert!(mgr.expire_lease(99).is_err());
    }

    #[tokio::test]
    async fn test_incompatible_snapshot_rejected_without_merge() {
        let mgr = manager(1, Duration::from_secs(60));
        let grant = mgr.acquire_range("a").unwrap();
        let bloom = BloomSet::new(64, 2).to_snapshot();

        let err = mgr
            .submit_results(&Submission {
                agent_id: "a".into(),
                range_id: grant.range_id,
                stops: keys(&["x-y"]),
                nodes: bloom,
            })
            .unwrap_err();
        assert!(matches!(err, LeaseError::InvalidSubmission { .. }));
        let state = mgr.range(0).unwrap().lock();
        assert!(state.stops.is_empty());
        assert!(state.is_held_by("a"));
    }

    #[derive(Clone, Default)]
    struct LogBuffer(Arc<parking_lot::Mutex<Vec<u8>>>);

    impl std::io::Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_unmergeable_submission_is_logged() {
        let logs = LogBuffer::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::WARN)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let mgr = manager(1, Duration::from_secs(60));
        let grant = mgr.acquire_range("a").unwrap();
        mgr.submit_results(&Submission {
            agent_id: "a".into(),
            range_id: grant.range_id,
            stops: BloomSet::new(64, 2).to_snapshot(),
            nodes: keys(&[]),
        })
        .unwrap_err();

        let text = String::from_utf8(logs.0.lock().clone()).unwrap();
        assert!(text.contains("unmergeable submission rejected"), "{}", text);
        assert!(text.contains("range_id=0"), "{}", text);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_reclaimed_after_timeout() {
        let mgr = manager(1, Duration::from_secs(90));
        let grant = mgr.acquire_range("a").unwrap();
        assert!(mgr.acquire_range("b").is_err());

        tokio::time::sleep(Duration::from_secs(91)).await;

        assert_eq!(mgr.range(grant.range_id).unwrap().lessee(), None);
        // Original holder may take it again
        assert_eq!(mgr.acquire_range("a").unwrap().range_id, grant.range_id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_submission_cancels_reclaim() {
        let mgr = manager(1, Duration::from_secs(90));
        let grant = mgr.acquire_range("a").unwrap();
        mgr.submit_results(&submission("a", grant.range_id, &[], &[])).unwrap();
        let regrant = mgr.acquire_range("b").unwrap();

        // The first lease's timer must not clear b's lease
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(mgr.range(regrant.range_id).unwrap().lessee().as_deref(), Some("b"));
        tokio::time::sleep(Duration::from_secs(35)).await;
        assert_eq!(mgr.range(regrant.range_id).unwrap().lessee(), None);
    }

    #[tokio::test]
    async fn test_stale_generation_is_noop() {
        let mgr = manager(1, Duration::from_secs(60));
        mgr.acquire_range("a").unwrap();
        mgr.expire_lease(0).unwrap();
        mgr.acquire_range("b").unwrap();
        // Generation 1 belonged to a's lease
        assert!(!mgr.reclaim(0, 1));
        assert_eq!(mgr.range(0).unwrap().lessee().as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_only_one_winner_for_last_range() {
        let mgr = manager(1, Duration::from_secs(60));
        let mut handles = Vec::new();
        for agent in ["a", "b"] {
            let mgr = mgr.clone();
            handles.push(tokio::spawn(async move { mgr.acquire_range(agent) }));
        }
        let mut wins = 0;
        let mut busy = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => wins += 1,
                Err(LeaseError::NoRangesAvailable { .. }) => busy += 1,
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
        assert_eq!((wins, busy), (1, 1));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_acquisition_single_lessee() {
        let mgr = manager(4, Duration::from_secs(60));
        let mut handles = Vec::new();
        for i in 0..32 {
            let mgr = mgr.clone();
            handles.push(tokio::spawn(async move {
                let agent = format!("agent-{}", i);
                mgr.acquire_range(&agent).ok().map(|g| (g.range_id, agent))
            }));
        }

        let mut holders: HashMap<usize, String> = HashMap::new();
        for handle in handles {
            if let Some((range_id, agent)) = handle.await.unwrap() {
                assert!(holders.insert(range_id, agent).is_none(), "range {} granted twice", range_id);
            }
        }
        assert_eq!(holders.len(), 4);
        for (range_id, agent) in holders {
            assert_eq!(mgr.range(range_id).unwrap().lessee(), Some(agent));
        }
        assert_eq!(mgr.stats().leased, 4);
    }

    #[tokio::test]
    async fn test_stats() {
        let mgr = manager(3, Duration::from_secs(60));
        let grant = mgr.acquire_range("a").unwrap();
        mgr.submit_results(&submission("a", grant.range_id, &["k1", "k2"], &["10.0.0.1"]))
            .unwrap();
        mgr.acquire_range("b").unwrap();

        let stats = mgr.stats();
        assert_eq!(stats.ranges, 3);
        assert_eq!(stats.addresses, 12);
        assert_eq!(stats.leased, 1);
        assert_eq!(stats.agents, 2);
        assert_eq!(stats.shard_entries, 2);
        assert_eq!(stats.nodes, 1);
    }
}
