use anyhow::{Context, Result};
use async_trait::async_trait;
use socket2::Socket;
use std::io::Read;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use crate::probe::correlate::parse_icmp_reply;
use crate::probe::interface::InterfaceInfo;
use crate::probe::socket::{create_raw_icmp_socket, create_udp_send_socket, local_port, send_udp, set_ttl};
use crate::probe::{ProbeReply, ProbeTransport};

/// Conventional traceroute base port
pub const DEFAULT_UDP_PORT: u16 = 33434;

/// Single-byte probe payload
const PROBE_PAYLOAD: [u8; 1] = [0];

/// Classic UDP traceroute probe: one datagram out, ICMP error back.
///
/// Each probe gets its own send socket, so the kernel-assigned source port
/// tells concurrent probes' replies apart on the shared raw socket.
#[derive(Debug, Clone)]
pub struct UdpProbe {
    port: u16,
    interface: Option<InterfaceInfo>,
}

impl UdpProbe {
    pub fn new(port: u16, interface: Option<InterfaceInfo>) -> Self {
        Self { port, interface }
    }

    fn probe_blocking(
        &self,
        source: Ipv4Addr,
        dest: Ipv4Addr,
        ttl: u8,
        timeout: Duration,
    ) -> Result<ProbeReply> {
        // Open the listener before sending so a fast reply is not missed
        let recv = create_raw_icmp_socket(self.interface.as_ref())
            .context("Failed to open ICMP receive socket")?;
        let send = create_udp_send_socket(source, self.interface.as_ref())?;
        set_ttl(&send, ttl)?;
        let src_port = local_port(&send)?;

        let started = Instant::now();
        send_udp(&send, &PROBE_PAYLOAD, dest, self.port)
            .with_context(|| format!("Failed to send probe to {} (ttl {})", dest, ttl))?;

        let deadline = started + timeout;
        let mut buffer = [0u8; 1500];
        while Instant::now() < deadline {
            match read_packet(&recv, &mut buffer) {
                Ok(len) => {
                    if let Some(reply) = parse_icmp_reply(&buffer[..len], dest, src_port) {
                        tracing::trace!(%dest, ttl, responder = %reply.responder, kind = ?reply.kind, "probe answered");
                        return Ok(ProbeReply::answered(reply.responder, ttl, started.elapsed()));
                    }
                }
                Err(e) if is_timeout(&e) => {}
                Err(e) => return Err(e).context("ICMP receive failed"),
            }
        }

        Ok(ProbeReply::timed_out(ttl, started.elapsed()))
    }
}

impl Default for UdpProbe {
    fn default() -> Self {
        Self::new(DEFAULT_UDP_PORT, None)
    }
}

fn read_packet(socket: &Socket, buffer: &mut [u8]) -> std::io::Result<usize> {
    let mut socket = socket;
    socket.read(buffer)
}

fn is_timeout(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut | std::io::ErrorKind::Interrupted
    )
}

#[async_trait]
impl ProbeTransport for UdpProbe {
    async fn send_probe(
        &self,
        source: Ipv4Addr,
        dest: Ipv4Addr,
        ttl: u8,
        timeout: Duration,
    ) -> Result<ProbeReply> {
        let probe = self.clone();
        // Raw socket reads block; keep them off the async workers
        tokio::task::spawn_blocking(move || probe.probe_blocking(source, dest, ttl, timeout))
            .await
            .context("Probe task panicked")?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_kinds() {
        assert!(is_timeout(&std::io::Error::from(std::io::ErrorKind::WouldBlock)));
        assert!(is_timeout(&std::io::Error::from(std::io::ErrorKind::TimedOut)));
        assert!(!is_timeout(&std::io::Error::from(std::io::ErrorKind::PermissionDenied)));
    }

    #[test]
    fn test_default_port() {
        let probe = UdpProbe::default();
        assert_eq!(probe.port, DEFAULT_UDP_PORT);
        assert!(probe.interface.is_none());
    }
}
