//! Interface selection and source address resolution for probe sockets.
//!
//! - Linux: binds with SO_BINDTODEVICE via socket2::bind_device()
//! - macOS: binds with IP_BOUND_IF via socket2::bind_device_by_index_v4()

use anyhow::{Result, anyhow};
use pnet::datalink;
use socket2::Socket;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};

use crate::config::ProbeConfig;

/// Validated interface information
#[derive(Debug, Clone)]
pub struct InterfaceInfo {
    /// Interface name (e.g., "eth0", "wlan0")
    pub name: String,
    /// Interface index (used for macOS binding)
    pub index: u32,
    /// First usable IPv4 address on the interface
    pub ipv4: Ipv4Addr,
}

/// Validate that an interface exists and carries an IPv4 address
pub fn validate_interface(name: &str) -> Result<InterfaceInfo> {
    let interfaces = datalink::interfaces();
    let Some(iface) = interfaces.iter().find(|i| i.name == name) else {
        let available: Vec<_> = interfaces
            .iter()
            .filter(|i| i.ips.iter().any(|a| a.is_ipv4()))
            .map(|i| i.name.clone())
            .collect();
        return Err(anyhow!(
            "Interface '{}' not found. Available interfaces: {}",
            name,
            if available.is_empty() {
                "(none with IPv4 addresses)".to_string()
            } else {
                available.join(", ")
            }
        ));
    };

    // Loopback is only acceptable on the loopback interface itself
    let ipv4 = iface
        .ips
        .iter()
        .filter_map(|a| match a.ip() {
            IpAddr::V4(v4) => Some(v4),
            IpAddr::V6(_) => None,
        })
        .find(|v4| iface.is_loopback() || !v4.is_loopback())
        .ok_or_else(|| anyhow!("Interface '{}' has no IPv4 address", name))?;

    Ok(InterfaceInfo {
        name: name.to_string(),
        index: iface.index,
        ipv4,
    })
}

/// Bind a socket to a specific network interface
///
/// On Linux, uses SO_BINDTODEVICE which requires CAP_NET_RAW or root.
/// On macOS, uses IP_BOUND_IF with the interface index.
pub fn bind_socket_to_interface(socket: &Socket, info: &InterfaceInfo) -> Result<()> {
    #[cfg(target_os = "linux")]
    {
        socket.bind_device(Some(info.name.as_bytes())).map_err(|e| {
            anyhow!(
                "Failed to bind socket to interface '{}': {}. \
                 This requires CAP_NET_RAW capability or root privileges.",
                info.name,
                e
            )
        })
    }

    #[cfg(target_os = "macos")]
    {
        use std::num::NonZeroU32;
        socket
            .bind_device_by_index_v4(NonZeroU32::new(info.index))
            .map_err(|e| {
                anyhow!(
                    "Failed to bind socket to interface '{}' (index {}): {}",
                    info.name,
                    info.index,
                    e
                )
            })
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        let _ = (socket, info);
        Err(anyhow!(
            "Interface binding is only available on Linux and macOS."
        ))
    }
}

/// Local address the kernel would route `target` from.
///
/// Connects (but never sends on) a UDP socket and reads back its local address.
pub fn route_source_for(target: Ipv4Addr) -> Option<Ipv4Addr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect(SocketAddr::from((target, 80))).ok()?;
    match socket.local_addr().ok()?.ip() {
        IpAddr::V4(v4) if !v4.is_unspecified() => Some(v4),
        _ => None,
    }
}

/// First non-loopback IPv4 address on any interface that is up
pub fn first_usable_ipv4() -> Option<Ipv4Addr> {
    datalink::interfaces()
        .into_iter()
        .filter(|i| i.is_up() && !i.is_loopback())
        .flat_map(|i| i.ips)
        .find_map(|a| match a.ip() {
            IpAddr::V4(v4) if !v4.is_loopback() && !v4.is_link_local() => Some(v4),
            _ => None,
        })
}

/// Pick the source address for probes: explicit source, then interface,
/// then the routing table, then any usable interface address.
pub fn resolve_source(
    config: &ProbeConfig,
    interface: Option<&InterfaceInfo>,
    sample_target: Option<Ipv4Addr>,
) -> Result<Ipv4Addr> {
    if let Some(ip) = config.source_ip {
        return Ok(ip);
    }
    if let Some(info) = interface {
        return Ok(info.ipv4);
    }
    if let Some(target) = sample_target
        && let Some(ip) = route_source_for(target)
    {
        return Ok(ip);
    }
    first_usable_ipv4().ok_or_else(|| {
        anyhow!("No usable IPv4 interface found. Use --source-ip or --interface to pick one.")
    })
}
