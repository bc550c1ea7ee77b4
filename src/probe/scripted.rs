//! Deterministic in-memory transport for driving the engine without a network.

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::time::Duration;

use crate::probe::{ProbeReply, ProbeTransport};

/// A [`ProbeTransport`] answering from a fixed routing table.
///
/// Each route lists the responders at TTL 1, 2, ... toward a destination; the
/// last entry is normally the destination itself. A probe whose TTL reaches
/// past the end of the route is answered by the final entry. Probes toward an
/// intermediate hop of a known route follow that route's prefix.
#[derive(Debug, Default)]
pub struct ScriptedProbe {
    routes: HashMap<Ipv4Addr, Vec<Ipv4Addr>>,
    silent: HashSet<Ipv4Addr>,
    failing: HashSet<Ipv4Addr>,
    drops: Mutex<HashMap<(Ipv4Addr, u8), u32>>,
    calls: Mutex<Vec<(Ipv4Addr, u8)>>,
    latency: Duration,
}

impl ScriptedProbe {
    pub fn new() -> Self {
        Self {
            latency: Duration::from_millis(1),
            ..Default::default()
        }
    }

    /// Register the responders toward `dest`, TTL 1 first
    pub fn route(mut self, dest: Ipv4Addr, hops: &[Ipv4Addr]) -> Self {
        self.routes.insert(dest, hops.to_vec());
        self
    }

    /// `addr` never answers
    pub fn silent(mut self, addr: Ipv4Addr) -> Self {
        self.silent.insert(addr);
        self
    }

    /// Probes toward `dest` fail with a local error
    pub fn failing(mut self, dest: Ipv4Addr) -> Self {
        self.failing.insert(dest);
        self
    }

    /// The first `count` probes to `(dest, ttl)` time out
    pub fn drop_first(self, dest: Ipv4Addr, ttl: u8, count: u32) -> Self {
        self.drops.lock().insert((dest, ttl), count);
        self
    }

    /// Every (destination, ttl) probed so far, in call order
    pub fn calls(&self) -> Vec<(Ipv4Addr, u8)> {
        self.calls.lock().clone()
    }

    /// Number of probes sent toward `dest`
    pub fn probes_to(&self, dest: Ipv4Addr) -> usize {
        self.calls.lock().iter().filter(|(d, _)| *d == dest).count()
    }

    fn route_to(&self, dest: Ipv4Addr) -> Option<&[Ipv4Addr]> {
        if let Some(route) = self.routes.get(&dest) {
            return Some(route);
        }
        self.routes.values().find_map(|route| {
            route
                .iter()
                .position(|hop| *hop == dest)
                .map(|idx| &route[..=idx])
        })
    }

    fn take_drop(&self, dest: Ipv4Addr, ttl: u8) -> bool {
        let mut drops = self.drops.lock();
        match drops.get_mut(&(dest, ttl)) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl ProbeTransport for ScriptedProbe {
    async fn send_probe(
        &self,
        _source: Ipv4Addr,
        dest: Ipv4Addr,
        ttl: u8,
        timeout: Duration,
    ) -> Result<ProbeReply> {
        self.calls.lock().push((dest, ttl));

        if self.failing.contains(&dest) {
            return Err(anyhow!("No route to {}", dest));
        }
        if ttl == 0 || self.take_drop(dest, ttl) {
            return Ok(ProbeReply::timed_out(ttl, timeout));
        }

        let Some(route) = self.route_to(dest) else {
            return Ok(ProbeReply::timed_out(ttl, timeout));
        };
        let Some(&responder) = route.get((ttl as usize).min(route.len()).saturating_sub(1)) else {
            return Ok(ProbeReply::timed_out(ttl, timeout));
        };
        if self.silent.contains(&responder) {
            return Ok(ProbeReply::timed_out(ttl, timeout));
        }

        Ok(ProbeReply::answered(responder, ttl, self.latency * ttl as u32))
    }
}
