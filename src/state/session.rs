use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::time::Duration;

/// One probe attempt's outcome, immutable once recorded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hop {
    pub success: bool,
    /// Responder address (unspecified for an unanswered hop)
    pub address: Ipv4Addr,
    pub ttl: u8,
    #[serde(with = "rtt_micros")]
    pub elapsed: Duration,
    pub hostname: Option<String>,
}

impl Hop {
    /// A hop that answered
    pub fn reply(address: Ipv4Addr, ttl: u8, elapsed: Duration) -> Self {
        Self {
            success: true,
            address,
            ttl,
            elapsed,
            hostname: None,
        }
    }

    /// A TTL that exhausted its retries without an answer
    pub fn unanswered(ttl: u8) -> Self {
        Self {
            success: false,
            address: Ipv4Addr::UNSPECIFIED,
            ttl,
            elapsed: Duration::ZERO,
            hostname: None,
        }
    }

    /// Hostname if resolved, otherwise the dotted address
    pub fn host_or_address(&self) -> String {
        match self.hostname {
            Some(ref name) => name.clone(),
            None => self.address.to_string(),
        }
    }
}

/// Why a traversal phase ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Forward: reached a link already in the global stop set
    GlobalStopSet,
    /// Forward: the destination answered
    Destination,
    /// Forward: TTL reached the session hop limit
    HopLimit,
    /// Backward: reached a link already in the local stop set
    LocalStopSet,
    /// Backward: walked every forward hop back to the source
    PathExhausted,
    /// Shutdown requested mid-traversal
    Cancelled,
}

/// Result of one traversal direction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseResult {
    /// Answered hops, in traversal order
    pub path: Vec<Hop>,
    /// TTLs that exhausted their retries
    pub unanswered: Vec<Hop>,
    pub stop: StopReason,
    /// Probes sent, retries included
    pub probes_sent: u32,
}

impl PhaseResult {
    pub fn new(stop: StopReason) -> Self {
        Self {
            path: Vec::new(),
            unanswered: Vec::new(),
            stop,
            probes_sent: 0,
        }
    }
}

/// Forward and backward results for one (source, destination) pair
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceOutcome {
    pub source: Ipv4Addr,
    pub destination: Ipv4Addr,
    /// Per-destination hop limit drawn for this trace
    pub hop_limit: u8,
    pub started_at: DateTime<Utc>,
    pub forward: PhaseResult,
    pub backward: PhaseResult,
}

impl TraceOutcome {
    /// Did the forward phase reach the destination itself?
    pub fn reached_destination(&self) -> bool {
        self.forward.stop == StopReason::Destination
    }

    /// Every responder address observed in either direction, first-seen order
    pub fn responders(&self) -> Vec<Ipv4Addr> {
        let mut seen = Vec::new();
        for hop in self.forward.path.iter().chain(self.backward.path.iter()) {
            if hop.success && !seen.contains(&hop.address) {
                seen.push(hop.address);
            }
        }
        seen
    }

    /// Total probes sent across both phases
    pub fn probes_sent(&self) -> u32 {
        self.forward.probes_sent + self.backward.probes_sent
    }
}

/// Hop RTTs as integer microseconds, so exported traces read back exactly.
/// Config durations use float seconds instead (`config::duration_serde`).
mod rtt_micros {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_micros().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let micros = u64::deserialize(deserializer)?;
        Ok(Duration::from_micros(micros))
    }
}
