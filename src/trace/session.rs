//! One probing session: every address of a leased range traced concurrently.

use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::task::JoinSet;

use crate::state::TraceOutcome;
use crate::stopset::{SafeSet, StopSet};
use crate::trace::engine::{ProbeContext, ProbeEngine};

/// A destination whose trace ended in a local error
#[derive(Debug, Clone)]
pub struct TraceFailure {
    pub destination: Ipv4Addr,
    pub error: String,
}

/// Everything a session produced
#[derive(Debug, Default)]
pub struct SessionReport {
    pub outcomes: Vec<TraceOutcome>,
    pub failures: Vec<TraceFailure>,
}

impl SessionReport {
    pub fn probes_sent(&self) -> u64 {
        self.outcomes.iter().map(|o| o.probes_sent() as u64).sum()
    }
}

/// Trace every address concurrently and wait for all of them.
///
/// All tasks share the context's stop sets. Responders land in `new_nodes`
/// as they are found. A failing destination is logged and reported but
/// never cancels its siblings.
pub async fn probe_range<S: StopSet>(
    ctx: Arc<ProbeContext<S>>,
    addresses: &[Ipv4Addr],
    new_nodes: Arc<SafeSet<S>>,
) -> SessionReport {
    let mut tasks = JoinSet::new();
    for &destination in addresses {
        let engine = ProbeEngine::new(ctx.clone(), destination);
        let new_nodes = new_nodes.clone();
        tasks.spawn(async move {
            let result = engine.run().await;
            if let Ok(ref outcome) = result {
                for node in outcome.responders() {
                    new_nodes.add(&node.to_string());
                }
            }
            (destination, result)
        });
    }

    let mut report = SessionReport::default();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((_, Ok(outcome))) => report.outcomes.push(outcome),
            Ok((destination, Err(e))) => {
                tracing::warn!(%destination, error = %format!("{:#}", e), "trace failed");
                report.failures.push(TraceFailure {
                    destination,
                    error: format!("{:#}", e),
                });
            }
            Err(e) => tracing::error!(error = %e, "trace task panicked"),
        }
    }

    // Completion order is arbitrary; report in range order
    report
        .outcomes
        .sort_by_key(|o| addresses.iter().position(|a| *a == o.destination));
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProbeConfig;
    use crate::probe::ScriptedProbe;
    use crate::stopset::{ExactSet, StopKey, StopSetParams};

    const SRC: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 10);
    const R1: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
    const R2: Ipv4Addr = Ipv4Addr::new(10, 0, 1, 1);

    fn ctx(probe: ScriptedProbe) -> Arc<ProbeContext<ExactSet>> {
        let params = StopSetParams::default();
        Arc::new(ProbeContext::new(
            ProbeConfig::default(),
            SRC,
            Arc::new(SafeSet::with_params(&params)),
            Arc::new(SafeSet::with_params(&params)),
            Arc::new(probe),
        ))
    }

    #[tokio::test]
    async fn test_range_fans_out_and_collects_nodes() {
        let a = Ipv4Addr::new(198, 51, 100, 1);
        let b = Ipv4Addr::new(198, 51, 100, 2);
        let ctx = ctx(ScriptedProbe::new().route(a, &[R1, R2, a]).route(b, &[R1, R2, b]));
        let nodes = Arc::new(SafeSet::new(ExactSet::new()));

        let report = probe_range(ctx.clone(), &[a, b], nodes.clone()).await;
        assert!(report.failures.is_empty());
        assert_eq!(report.outcomes.len(), 2);
        assert_eq!(report.outcomes[0].destination, a);
        assert_eq!(report.outcomes[1].destination, b);
        assert!(report.outcomes.iter().all(|o| o.reached_destination()));

        for node in [R1, R2, a, b] {
            assert!(nodes.contains(&node.to_string()));
        }
        assert!(ctx.gss.contains(StopKey::forward(R1, a).as_str()));
        assert!(ctx.gss.contains(StopKey::forward(R1, b).as_str()));
    }

    #[tokio::test]
    async fn test_failure_does_not_abort_siblings() {
        let good = Ipv4Addr::new(198, 51, 100, 1);
        let bad = Ipv4Addr::new(198, 51, 100, 9);
        let ctx = ctx(ScriptedProbe::new().route(good, &[R1, good]).failing(bad));
        let nodes = Arc::new(SafeSet::new(ExactSet::new()));

        let report = probe_range(ctx, &[bad, good], nodes.clone()).await;
        assert_eq!(report.outcomes.len(), 1);
        assert_eq!(report.outcomes[0].destination, good);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].destination, bad);
        assert!(nodes.contains(&good.to_string()));
    }

    #[tokio::test]
    async fn test_empty_range() {
        let ctx = ctx(ScriptedProbe::new());
        let report = probe_range(ctx, &[], Arc::new(SafeSet::new(ExactSet::new()))).await;
        assert!(report.outcomes.is_empty());
        assert_eq!(report.probes_sent(), 0);
    }
}
