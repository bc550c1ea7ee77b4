//! Probing agent: lease a range, trace it, hand the results back, repeat.

use anyhow::Result;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::{MonitorConfig, ProbeConfig};
use crate::lease::{LeaseError, Submission};
use crate::lookup::ReverseLookup;
use crate::probe::ProbeTransport;
use crate::rpc::{LeaseClient, RpcError};
use crate::stopset::{SafeSet, StopSet, StopSetParams};
use crate::trace::{ProbeContext, probe_range};

/// Totals over a monitor's lifetime
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MonitorSummary {
    /// Sessions whose results the leader accepted
    pub sessions: u64,
    /// Sessions whose results were discarded (lease expired or moved)
    pub rejected: u64,
    /// Leased ranges abandoned before probing; their leases time out
    pub failed: u64,
    pub destinations: u64,
    pub failed_destinations: u64,
    pub probes_sent: u64,
}

impl MonitorSummary {
    /// Lease cycles counted against `max_sessions`
    pub fn cycles(&self) -> u64 {
        self.sessions + self.rejected + self.failed
    }
}

pub struct Monitor<S: StopSet> {
    agent_id: String,
    client: Arc<dyn LeaseClient>,
    transport: Arc<dyn ProbeTransport>,
    resolver: Option<Arc<dyn ReverseLookup>>,
    probe: ProbeConfig,
    settings: MonitorConfig,
    params: StopSetParams,
    source: Ipv4Addr,
    /// Survives across sessions; never wiped
    lss: Arc<SafeSet<S>>,
    cancel: CancellationToken,
}

impl<S: StopSet> Monitor<S> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        agent_id: String,
        client: Arc<dyn LeaseClient>,
        transport: Arc<dyn ProbeTransport>,
        probe: ProbeConfig,
        settings: MonitorConfig,
        params: StopSetParams,
        source: Ipv4Addr,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            agent_id,
            client,
            transport,
            resolver: None,
            probe,
            settings,
            params,
            source,
            lss: Arc::new(SafeSet::with_params(&params)),
            cancel,
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn ReverseLookup>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn local_stop_set(&self) -> &Arc<SafeSet<S>> {
        &self.lss
    }

    /// Run sessions until every range is done, `max_sessions` lease cycles
    /// are spent, or shutdown is requested.
    ///
    /// A range whose shard cannot be imported is skipped, not fatal.
    pub async fn run(&self) -> Result<MonitorSummary> {
        let mut summary = MonitorSummary::default();
        let budget = self.settings.max_sessions;
        tracing::info!(agent_id = %self.agent_id, source = %self.source, "monitor started");

        while !self.cancel.is_cancelled() && (budget == 0 || summary.cycles() < budget) {
            let grant = match self.client.acquire_range(&self.agent_id).await {
                Ok(grant) => grant,
                Err(RpcError::Remote(LeaseError::Exhausted { .. })) => {
                    tracing::info!(agent_id = %self.agent_id, "every range probed");
                    break;
                }
                Err(RpcError::Remote(e)) if e.is_retryable() => {
                    tracing::debug!(agent_id = %self.agent_id, "no free range, waiting");
                    self.pause(self.settings.retry_interval).await;
                    continue;
                }
                Err(e) => {
                    tracing::warn!(agent_id = %self.agent_id, error = %e, "range request failed");
                    self.pause(self.settings.retry_interval).await;
                    continue;
                }
            };

            let range_id = grant.range_id;
            let gss = match SafeSet::<S>::from_snapshot(&grant.stops, &self.params) {
                Ok(set) => Arc::new(set),
                Err(e) => {
                    summary.failed += 1;
                    tracing::warn!(
                        agent_id = %self.agent_id,
                        range_id,
                        error = %e,
                        "leader sent an unusable stop shard, skipping range"
                    );
                    self.pause(self.settings.retry_interval).await;
                    continue;
                }
            };
            let new_nodes = Arc::new(SafeSet::<S>::with_params(&self.params));

            let mut ctx = ProbeContext::new(
                self.probe.clone(),
                self.source,
                gss.clone(),
                self.lss.clone(),
                self.transport.clone(),
            )
            .with_cancel(self.cancel.clone());
            if let Some(ref resolver) = self.resolver {
                ctx = ctx.with_resolver(resolver.clone());
            }

            tracing::info!(
                agent_id = %self.agent_id,
                range_id,
                addresses = grant.addresses.len(),
                shard_entries = gss.len(),
                "probing range"
            );
            let report = probe_range(Arc::new(ctx), &grant.addresses, new_nodes.clone()).await;
            summary.destinations += report.outcomes.len() as u64;
            summary.failed_destinations += report.failures.len() as u64;
            summary.probes_sent += report.probes_sent();

            if self.cancel.is_cancelled() {
                // Partial results; the lease times out on the leader
                break;
            }

            let submission = Submission {
                agent_id: self.agent_id.clone(),
                range_id,
                stops: gss.to_snapshot(),
                nodes: new_nodes.to_snapshot(),
            };
            match self.client.submit_results(submission).await {
                Ok(()) => {
                    summary.sessions += 1;
                    tracing::info!(
                        agent_id = %self.agent_id,
                        range_id,
                        destinations = report.outcomes.len(),
                        failed = report.failures.len(),
                        new_nodes = new_nodes.len(),
                        probes = report.probes_sent(),
                        "results accepted"
                    );
                }
                Err(RpcError::Remote(e)) if e.is_rejection() => {
                    summary.rejected += 1;
                    tracing::warn!(agent_id = %self.agent_id, range_id, error = %e, "results discarded by leader");
                }
                Err(e) => {
                    summary.rejected += 1;
                    tracing::warn!(agent_id = %self.agent_id, range_id, error = %e, "submitting results failed");
                }
            }
        }

        tracing::info!(agent_id = %self.agent_id, summary = ?summary, "monitor stopped");
        Ok(summary)
    }

    async fn pause(&self, interval: Duration) {
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lease::LeaseManager;
    use crate::probe::ScriptedProbe;
    use crate::stopset::{BloomSet, ExactSet, StopKey};

    const SRC: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 10);
    const R1: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
    const R2: Ipv4Addr = Ipv4Addr::new(10, 0, 1, 1);

    fn targets() -> Vec<Ipv4Addr> {
        (1..=4).map(|i| Ipv4Addr::new(198, 51, 100, i)).collect()
    }

    fn transport() -> Arc<ScriptedProbe> {
        let mut probe = ScriptedProbe::new();
        for dest in targets() {
            probe = probe.route(dest, &[R1, R2, dest]);
        }
        Arc::new(probe)
    }

    fn monitor(
        agent: &str,
        leader: Arc<LeaseManager<ExactSet>>,
        transport: Arc<ScriptedProbe>,
        settings: MonitorConfig,
    ) -> Monitor<ExactSet> {
        Monitor::new(
            agent.to_string(),
            Arc::new(leader),
            transport,
            ProbeConfig::default(),
            settings,
            StopSetParams::default(),
            SRC,
            CancellationToken::new(),
        )
    }

    fn leader(ranges: usize) -> Arc<LeaseManager<ExactSet>> {
        Arc::new(LeaseManager::from_addresses(
            &targets(),
            ranges,
            Duration::from_secs(60),
            &StopSetParams::default(),
        ))
    }

    #[tokio::test]
    async fn test_monitor_drains_all_ranges() {
        let leader = leader(2);
        let m = monitor("a", leader.clone(), transport(), MonitorConfig::default());

        let summary = m.run().await.unwrap();
        assert_eq!(summary.sessions, 2);
        assert_eq!(summary.destinations, 4);
        assert_eq!(summary.failed_destinations, 0);

        let stats = leader.stats();
        assert_eq!(stats.leased, 0);
        assert_eq!(stats.nodes, 6);
        let shard = leader.range(0).unwrap().lock();
        assert!(shard.stops.contains(StopKey::forward(R1, targets()[0]).as_str()));
        drop(shard);
        // Backward links closed in session one stay closed in session two
        assert!(m.local_stop_set().contains(StopKey::backward(R1, SRC).as_str()));
    }

    #[tokio::test]
    async fn test_session_budget() {
        let leader = leader(4);
        let settings = MonitorConfig {
            max_sessions: 1,
            ..Default::default()
        };
        let summary = monitor("a", leader.clone(), transport(), settings).run().await.unwrap();
        assert_eq!(summary.sessions, 1);
        assert!(leader.range(1).unwrap().lessee().is_none());
    }

    #[tokio::test]
    async fn test_second_monitor_reuses_shards() {
        let leader = leader(1);
        let probe = transport();
        monitor("a", leader.clone(), probe.clone(), MonitorConfig::default())
            .run()
            .await
            .unwrap();
        let first_round = probe.calls().len();

        monitor("b", leader.clone(), probe.clone(), MonitorConfig::default())
            .run()
            .await
            .unwrap();
        let second_round = probe.calls().len() - first_round;
        // Forward phases stop at the first hop already in the shard
        assert!(second_round < first_round);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unusable_shard_skips_range_and_keeps_running() {
        // Leader configured for bloom sets, monitor for exact sets
        let leader = Arc::new(LeaseManager::<BloomSet>::from_addresses(
            &targets(),
            2,
            Duration::from_secs(60),
            &StopSetParams::default(),
        ));
        let probe = transport();
        let settings = MonitorConfig {
            max_sessions: 2,
            ..Default::default()
        };
        let m = Monitor::<ExactSet>::new(
            "a".into(),
            Arc::new(leader.clone()),
            probe.clone(),
            ProbeConfig::default(),
            settings,
            StopSetParams::default(),
            SRC,
            CancellationToken::new(),
        );

        let summary = m.run().await.unwrap();
        assert_eq!(summary.failed, 2);
        assert_eq!(summary.sessions, 0);
        assert!(probe.calls().is_empty());
        // Both leases stay with the agent until the leader reclaims them
        assert_eq!(leader.range(0).unwrap().lessee().as_deref(), Some("a"));
        assert_eq!(leader.range(1).unwrap().lessee().as_deref(), Some("a"));

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(leader.range(0).unwrap().lessee().is_none());
        assert!(leader.range(1).unwrap().lessee().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_while_ranges_are_busy() {
        let leader = leader(1);
        leader.acquire_range("other").unwrap();
        let cancel = CancellationToken::new();
        let m = Monitor::<ExactSet>::new(
            "a".into(),
            Arc::new(leader.clone()),
            transport(),
            ProbeConfig::default(),
            MonitorConfig::default(),
            StopSetParams::default(),
            SRC,
            cancel.clone(),
        );

        let handle = tokio::spawn(async move { m.run().await });
        tokio::time::sleep(Duration::from_secs(12)).await;
        cancel.cancel();
        let summary = handle.await.unwrap().unwrap();
        assert_eq!(summary.sessions, 0);
    }
}
