use anyhow::Result;
use async_trait::async_trait;
use hickory_resolver::TokioAsyncResolver;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::time::{Duration, Instant};

use super::{ReverseLookup, sanitize_display};

/// How long a resolved (or failed) name stays cached
const CACHE_TTL: Duration = Duration::from_secs(3600);

/// DNS cache entry
struct CacheEntry {
    hostname: Option<String>,
    cached_at: Instant,
}

/// Reverse DNS resolver with a shared cache.
///
/// Responders repeat heavily across destinations, so most lookups after the
/// first few traces are cache hits.
pub struct DnsLookup {
    resolver: TokioAsyncResolver,
    cache: RwLock<HashMap<Ipv4Addr, CacheEntry>>,
    cache_ttl: Duration,
}

impl DnsLookup {
    pub fn new() -> Result<Self> {
        let resolver = TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default());

        Ok(Self {
            resolver,
            cache: RwLock::new(HashMap::new()),
            cache_ttl: CACHE_TTL,
        })
    }

    fn cached(&self, ip: Ipv4Addr) -> Option<Option<String>> {
        let cache = self.cache.read();
        cache
            .get(&ip)
            .filter(|entry| entry.cached_at.elapsed() < self.cache_ttl)
            .map(|entry| entry.hostname.clone())
    }
}

#[async_trait]
impl ReverseLookup for DnsLookup {
    async fn reverse_lookup(&self, ip: Ipv4Addr) -> Option<String> {
        if let Some(hit) = self.cached(ip) {
            return hit;
        }

        let hostname = match self.resolver.reverse_lookup(IpAddr::V4(ip)).await {
            Ok(lookup) => lookup.iter().next().map(|name| {
                let s = name.to_string();
                sanitize_display(s.trim_end_matches('.'))
            }),
            Err(e) => {
                tracing::trace!(%ip, error = %e, "reverse lookup failed");
                None
            }
        };

        self.cache.write().insert(
            ip,
            CacheEntry {
                hostname: hostname.clone(),
                cached_at: Instant::now(),
            },
        );

        hostname
    }
}
