//! Probe transport: send one TTL-limited probe and wait for the reply.
//!
//! The DoubleTree engine only sees the [`ProbeTransport`] trait. [`UdpProbe`]
//! is the real implementation (UDP out, ICMP back); tests substitute scripted
//! transports.

pub mod correlate;
pub mod interface;
pub mod scripted;
pub mod socket;
pub mod udp;

pub use correlate::*;
pub use interface::*;
pub use scripted::ScriptedProbe;
pub use socket::*;
pub use udp::*;

use anyhow::Result;
use async_trait::async_trait;
use std::net::Ipv4Addr;
use std::time::Duration;

/// Outcome of a single probe attempt.
///
/// A timeout is not an error: it is a reply with `success == false`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeReply {
    pub success: bool,
    pub responder: Ipv4Addr,
    pub elapsed: Duration,
    /// TTL the probe was sent with
    pub ttl: u8,
}

impl ProbeReply {
    pub fn answered(responder: Ipv4Addr, ttl: u8, elapsed: Duration) -> Self {
        Self {
            success: true,
            responder,
            elapsed,
            ttl,
        }
    }

    pub fn timed_out(ttl: u8, elapsed: Duration) -> Self {
        Self {
            success: false,
            responder: Ipv4Addr::UNSPECIFIED,
            elapsed,
            ttl,
        }
    }
}

/// Sends a single outbound probe and waits up to `timeout` for an answer.
///
/// `Err` is reserved for local failures (no socket, bad interface) that make
/// further probing from this task pointless.
#[async_trait]
pub trait ProbeTransport: Send + Sync {
    async fn send_probe(
        &self,
        source: Ipv4Addr,
        dest: Ipv4Addr,
        ttl: u8,
        timeout: Duration,
    ) -> Result<ProbeReply>;
}
