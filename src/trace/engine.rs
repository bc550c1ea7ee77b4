use anyhow::{Context, Result};
use chrono::Utc;
use rand::Rng;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::ProbeConfig;
use crate::lookup::ReverseLookup;
use crate::probe::{ProbeReply, ProbeTransport};
use crate::state::{Hop, PhaseResult, StopReason, TraceOutcome};
use crate::stopset::{SafeSet, StopKey, StopSet};

/// Everything the engines of one agent share: settings, the stop sets and
/// the transport.
pub struct ProbeContext<S: StopSet> {
    pub config: ProbeConfig,
    /// Outbound interface address; backward keys pair hops with it
    pub source: Ipv4Addr,
    pub gss: Arc<SafeSet<S>>,
    pub lss: Arc<SafeSet<S>>,
    transport: Arc<dyn ProbeTransport>,
    resolver: Option<Arc<dyn ReverseLookup>>,
    cancel: CancellationToken,
}

impl<S: StopSet> ProbeContext<S> {
    pub fn new(
        config: ProbeConfig,
        source: Ipv4Addr,
        gss: Arc<SafeSet<S>>,
        lss: Arc<SafeSet<S>>,
        transport: Arc<dyn ProbeTransport>,
    ) -> Self {
        Self {
            config,
            source,
            gss,
            lss,
            transport,
            resolver: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn ReverseLookup>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Uniform hop limit in [floor, ceiling]
    pub fn draw_hop_limit(&self) -> u8 {
        let floor = self.config.hop_floor;
        let ceiling = self.config.hop_ceiling.max(floor);
        rand::rng().random_range(floor..=ceiling)
    }
}

/// DoubleTree traversal for one (source, destination) pair
pub struct ProbeEngine<S: StopSet> {
    ctx: Arc<ProbeContext<S>>,
    destination: Ipv4Addr,
    hop_limit: u8,
}

impl<S: StopSet> ProbeEngine<S> {
    /// Engine with a freshly drawn hop limit
    pub fn new(ctx: Arc<ProbeContext<S>>, destination: Ipv4Addr) -> Self {
        let hop_limit = ctx.draw_hop_limit();
        Self::with_hop_limit(ctx, destination, hop_limit)
    }

    pub fn with_hop_limit(ctx: Arc<ProbeContext<S>>, destination: Ipv4Addr, hop_limit: u8) -> Self {
        Self {
            ctx,
            destination,
            hop_limit,
        }
    }

    pub fn destination(&self) -> Ipv4Addr {
        self.destination
    }

    pub fn hop_limit(&self) -> u8 {
        self.hop_limit
    }

    /// Forward then backward phase
    pub async fn run(self) -> Result<TraceOutcome> {
        let started_at = Utc::now();
        let forward = self.probe_forward().await?;
        let backward = if forward.stop == StopReason::Cancelled {
            PhaseResult::new(StopReason::Cancelled)
        } else {
            self.probe_backward(&forward.path).await?
        };

        tracing::debug!(
            destination = %self.destination,
            hop_limit = self.hop_limit,
            forward_hops = forward.path.len(),
            forward_stop = ?forward.stop,
            backward_hops = backward.path.len(),
            backward_stop = ?backward.stop,
            "trace complete"
        );

        Ok(TraceOutcome {
            source: self.ctx.source,
            destination: self.destination,
            hop_limit: self.hop_limit,
            started_at,
            forward,
            backward,
        })
    }

    /// Probe toward the destination with increasing TTL.
    ///
    /// Stops on a global stop set hit (that hop is not recorded), when the
    /// destination answers (recorded), or once the hop limit is used up.
    /// Each answered hop's forward key joins the global stop set.
    pub async fn probe_forward(&self) -> Result<PhaseResult> {
        let ctx = &self.ctx;
        let mut result = PhaseResult::new(StopReason::HopLimit);

        'ttl: for ttl in ctx.config.first_hop..=self.hop_limit {
            let mut failures = 0u32;
            loop {
                let Some(reply) = self.send(self.destination, ttl).await? else {
                    result.stop = StopReason::Cancelled;
                    break 'ttl;
                };
                result.probes_sent += 1;

                if !reply.success {
                    failures += 1;
                    if failures > ctx.config.retries {
                        tracing::trace!(destination = %self.destination, ttl, "no reply, moving on");
                        result.unanswered.push(Hop::unanswered(ttl));
                        continue 'ttl;
                    }
                    continue;
                }

                let key = StopKey::forward(reply.responder, self.destination);
                if !ctx.gss.insert_if_absent(key.as_str()) {
                    tracing::debug!(destination = %self.destination, ttl, %key, "global stop set hit");
                    result.stop = StopReason::GlobalStopSet;
                    break 'ttl;
                }
                result.path.push(self.record(&reply).await);

                if reply.responder == self.destination {
                    result.stop = StopReason::Destination;
                    break 'ttl;
                }
                continue 'ttl;
            }
        }

        Ok(result)
    }

    /// Walk the forward path back toward the source.
    ///
    /// Starts at the second-to-last forward hop and probes each hop address
    /// directly at the TTL it was found at. A local stop set hit ends the walk.
    /// Each answered hop's backward key joins both stop sets.
    pub async fn probe_backward(&self, forward: &[Hop]) -> Result<PhaseResult> {
        let ctx = &self.ctx;
        let mut result = PhaseResult::new(StopReason::PathExhausted);
        let Some((_, earlier)) = forward.split_last() else {
            return Ok(result);
        };

        'hop: for hop in earlier.iter().rev() {
            let key = StopKey::backward(hop.address, ctx.source);
            if ctx.lss.contains(key.as_str()) {
                tracing::debug!(destination = %self.destination, ttl = hop.ttl, %key, "local stop set hit");
                result.stop = StopReason::LocalStopSet;
                break;
            }

            let mut failures = 0u32;
            loop {
                let Some(reply) = self.send(hop.address, hop.ttl).await? else {
                    result.stop = StopReason::Cancelled;
                    break 'hop;
                };
                result.probes_sent += 1;

                if reply.success {
                    result.path.push(self.record(&reply).await);
                    ctx.gss.add(key.as_str());
                    ctx.lss.add(key.as_str());
                    continue 'hop;
                }

                failures += 1;
                if failures > ctx.config.retries {
                    result.unanswered.push(Hop::unanswered(hop.ttl));
                    continue 'hop;
                }
            }
        }

        Ok(result)
    }

    /// One transport call; `None` if shutdown won the race
    async fn send(&self, dest: Ipv4Addr, ttl: u8) -> Result<Option<ProbeReply>> {
        let ctx = &self.ctx;
        tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => Ok(None),
            reply = ctx.transport.send_probe(ctx.source, dest, ttl, ctx.config.timeout) => {
                reply
                    .map(Some)
                    .with_context(|| format!("Probe to {} at ttl {} failed", dest, ttl))
            }
        }
    }

    async fn record(&self, reply: &ProbeReply) -> Hop {
        let mut hop = Hop::reply(reply.responder, reply.ttl, reply.elapsed);
        if let Some(ref resolver) = self.ctx.resolver {
            hop.hostname = resolver.reverse_lookup(reply.responder).await;
        }
        hop
    }
}
