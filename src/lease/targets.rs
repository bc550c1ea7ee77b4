use anyhow::{Context, Result, bail};
use ipnetwork::Ipv4Network;
use std::collections::HashSet;
use std::net::Ipv4Addr;

/// Refuse target lists larger than a /8
pub const MAX_TARGETS: u64 = 1 << 24;

/// Expand addresses and CIDR blocks into a de-duplicated address list,
/// keeping first-seen order.
pub fn expand_targets(targets: &[String]) -> Result<Vec<Ipv4Addr>> {
    let mut seen = HashSet::new();
    let mut addresses = Vec::new();
    let mut total: u64 = 0;

    for target in targets {
        let target = target.trim();
        if target.is_empty() {
            continue;
        }
        let network: Ipv4Network = target
            .parse()
            .with_context(|| format!("Invalid target address or CIDR block: {}", target))?;

        total += 1u64 << (32 - network.prefix() as u32);
        if total > MAX_TARGETS {
            bail!("Target list expands to more than {} addresses", MAX_TARGETS);
        }

        for addr in network.iter() {
            if seen.insert(addr) {
                addresses.push(addr);
            }
        }
    }

    Ok(addresses)
}

/// Split `addresses` into `n` contiguous chunks whose sizes differ by at
/// most one. Empty chunks are dropped.
pub fn partition(addresses: &[Ipv4Addr], n: usize) -> Vec<Vec<Ipv4Addr>> {
    let n = n.max(1).min(addresses.len().max(1));
    let base = addresses.len() / n;
    let extra = addresses.len() % n;

    let mut chunks = Vec::with_capacity(n);
    let mut start = 0;
    for i in 0..n {
        let len = base + usize::from(i < extra);
        if len == 0 {
            continue;
        }
        chunks.push(addresses[start..start + len].to_vec());
        start += len;
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_expand_mixed_targets() {
        let addrs = expand_targets(&strings(&["10.0.0.0/30", "8.8.8.8", "10.0.0.1"])).unwrap();
        assert_eq!(
            addrs,
            vec![
                Ipv4Addr::new(10, 0, 0, 0),
                Ipv4Addr::new(10, 0, 0, 1),
                Ipv4Addr::new(10, 0, 0, 2),
                Ipv4Addr::new(10, 0, 0, 3),
                Ipv4Addr::new(8, 8, 8, 8),
            ]
        );
    }

    #[test]
    fn test_expand_rejects_garbage() {
        let err = expand_targets(&strings(&["not-an-ip"])).unwrap_err();
        assert!(err.to_string().contains("not-an-ip"));
    }

    #[test]
    fn test_expand_rejects_huge_blocks() {
        assert!(expand_targets(&strings(&["0.0.0.0/0"])).is_err());
    }

    #[test]
    fn test_partition_balanced() {
        let addrs: Vec<Ipv4Addr> = (0..10).map(|i| Ipv4Addr::new(10, 0, 0, i)).collect();
        let chunks = partition(&addrs, 3);
        let sizes: Vec<usize> = chunks.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![4, 3, 3]);
        let flat: Vec<Ipv4Addr> = chunks.concat();
        assert_eq!(flat, addrs);
    }

    #[test]
    fn test_partition_fewer_addresses_than_ranges() {
        let addrs = vec![Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2)];
        assert_eq!(partition(&addrs, 10).len(), 2);
        assert!(partition(&[], 4).is_empty());
    }
}
