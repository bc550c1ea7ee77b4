//! Responder hostname resolution.

pub mod rdns;

pub use rdns::DnsLookup;

use async_trait::async_trait;
use std::net::Ipv4Addr;

/// Resolves a responder address to a display name
#[async_trait]
pub trait ReverseLookup: Send + Sync {
    async fn reverse_lookup(&self, ip: Ipv4Addr) -> Option<String>;
}

/// Sanitize a string for safe terminal display by removing control characters.
///
/// PTR records are attacker-controlled; this keeps escape sequences out of
/// reports and logs.
pub(crate) fn sanitize_display(s: &str) -> String {
    s.chars().filter(|c| !c.is_control()).collect()
}
