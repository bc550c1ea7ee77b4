use pnet::packet::icmp::{IcmpPacket, IcmpTypes};
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::Ipv4Packet;
use std::net::Ipv4Addr;

/// ICMP header size (type, code, checksum, 4 unused bytes)
const ICMP_HEADER_SIZE: usize = 8;
/// Quoted transport bytes guaranteed by RFC 792 (enough for the UDP header)
const QUOTED_TRANSPORT_SIZE: usize = 8;

/// What kind of ICMP error answered the probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    /// An intermediate router dropped the probe at TTL 0
    TimeExceeded,
    /// The destination (or a filter) rejected it; carries the ICMP code
    DestUnreachable(u8),
}

/// A reply matched to an outstanding probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedReply {
    pub responder: Ipv4Addr,
    pub kind: ReplyKind,
}

/// Match a raw IPv4/ICMP packet against a UDP probe.
///
/// The packet must be an ICMP Time Exceeded or Destination Unreachable whose
/// quoted datagram is UDP, addressed to `probe_dest`, from `probe_src_port`.
/// Anything else (other probes' replies, echo traffic, truncated packets)
/// returns `None`.
pub fn parse_icmp_reply(packet: &[u8], probe_dest: Ipv4Addr, probe_src_port: u16) -> Option<ParsedReply> {
    let ip = Ipv4Packet::new(packet)?;
    if ip.get_next_level_protocol() != IpNextHeaderProtocols::Icmp {
        return None;
    }
    let ip_header_len = ip.get_header_length() as usize * 4;
    if ip_header_len < 20 || packet.len() < ip_header_len + ICMP_HEADER_SIZE {
        return None;
    }

    let icmp = IcmpPacket::new(&packet[ip_header_len..])?;
    let kind = match icmp.get_icmp_type() {
        IcmpTypes::TimeExceeded => ReplyKind::TimeExceeded,
        IcmpTypes::DestinationUnreachable => ReplyKind::DestUnreachable(icmp.get_icmp_code().0),
        _ => return None,
    };

    // Original datagram follows the 4 unused bytes after type/code/checksum
    let quoted = &packet[ip_header_len + ICMP_HEADER_SIZE..];
    let inner = Ipv4Packet::new(quoted)?;
    if inner.get_next_level_protocol() != IpNextHeaderProtocols::Udp {
        return None;
    }
    if inner.get_destination() != probe_dest {
        return None;
    }
    let inner_header_len = inner.get_header_length() as usize * 4;
    if inner_header_len < 20 || quoted.len() < inner_header_len + QUOTED_TRANSPORT_SIZE {
        return None;
    }
    let udp = &quoted[inner_header_len..];
    let src_port = u16::from_be_bytes([udp[0], udp[1]]);
    if src_port != probe_src_port {
        return None;
    }

    Some(ParsedReply {
        responder: ip.get_source(),
        kind,
    })
}
