use anyhow::{Context, Result, anyhow};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use crate::probe::interface::{InterfaceInfo, bind_socket_to_interface};

/// Poll interval for the blocking ICMP receive loop
pub const RECV_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Receive buffer for the raw ICMP socket
const RECV_BUFFER_SIZE: usize = 256 * 1024;

/// Verify the process can open a raw ICMP socket.
///
/// UDP probes go out unprivileged, but the Time Exceeded replies from routers
/// are only visible on a raw socket.
pub fn check_permissions() -> Result<()> {
    if create_raw_icmp_socket(None).is_ok() {
        return Ok(());
    }

    let binary_path = std::env::current_exe()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|_| "doubletree".to_string());

    Err(anyhow!(
        "Insufficient permissions for raw ICMP sockets.\n\n\
         Fix options:\n\
         \u{2022} Run with sudo: sudo doubletree monitor\n\
         \u{2022} Add capability: sudo setcap cap_net_raw+ep {}",
        binary_path
    ))
}

/// Create a raw IPv4 ICMP socket for reading router replies
pub fn create_raw_icmp_socket(interface: Option<&InterfaceInfo>) -> Result<Socket> {
    let socket = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4))?;
    socket.set_nonblocking(false)?;
    socket.set_read_timeout(Some(RECV_POLL_INTERVAL))?;
    if let Err(e) = socket.set_recv_buffer_size(RECV_BUFFER_SIZE) {
        tracing::debug!(error = %e, "could not enlarge ICMP receive buffer");
    }
    if let Some(info) = interface {
        bind_socket_to_interface(&socket, info)?;
    }
    Ok(socket)
}

/// Create the UDP socket a single probe is sent from.
///
/// Bound to `source` with an ephemeral port; the kernel-assigned port is what
/// identifies this probe's replies.
pub fn create_udp_send_socket(source: Ipv4Addr, interface: Option<&InterfaceInfo>) -> Result<Socket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    if let Some(info) = interface {
        bind_socket_to_interface(&socket, info)?;
    }
    bind_to_source_ip(&socket, source)?;
    Ok(socket)
}

/// Set TTL on a socket
pub fn set_ttl(socket: &Socket, ttl: u8) -> Result<()> {
    socket.set_ttl(ttl as u32)?;
    Ok(())
}

/// Bind socket to a specific source IP address
/// Call this after interface binding (if any) to force a specific source address
pub fn bind_to_source_ip(socket: &Socket, ip: Ipv4Addr) -> Result<()> {
    let addr = SocketAddr::V4(SocketAddrV4::new(ip, 0));
    socket
        .bind(&SockAddr::from(addr))
        .with_context(|| format!("Failed to bind probe socket to {}", ip))?;
    Ok(())
}

/// Local UDP port the kernel assigned to a bound socket
pub fn local_port(socket: &Socket) -> Result<u16> {
    let addr = socket.local_addr()?;
    addr.as_socket()
        .map(|a| a.port())
        .ok_or_else(|| anyhow!("Probe socket has no IP address"))
}

/// Send a UDP datagram to `dest:port`
pub fn send_udp(socket: &Socket, payload: &[u8], dest: Ipv4Addr, port: u16) -> Result<usize> {
    let addr = SocketAddr::V4(SocketAddrV4::new(dest, port));
    let sent = socket.send_to(payload, &SockAddr::from(addr))?;
    Ok(sent)
}
