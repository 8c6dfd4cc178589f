//! Frame classification
//!
//! Maps a raw frame to the semantic category the filter masks are expressed
//! in. Only fixed-offset header fields are inspected; anything truncated or
//! unrecognised lands in `Category::Other`.

use serde::{Deserialize, Serialize};
use std::fmt;

use radio802::frame::{
    ctrl_subtype, data_subtype, ethertype, llc_snap_ethertype, mgmt_subtype, EthernetHeader,
    Ieee80211Header, FrameType, LLC_SNAP_LEN,
};
use radio802::FrameFormat;

const IPPROTO_HOPOPTS: u8 = 0;
const IPPROTO_ICMP: u8 = 1;
const IPPROTO_TCP: u8 = 6;
const IPPROTO_UDP: u8 = 17;
const IPPROTO_ICMPV6: u8 = 58;

const DNS_PORT: u16 = 53;
const DHCP_SERVER_PORT: u16 = 67;
const DHCP_CLIENT_PORT: u16 = 68;
const DHCPV6_CLIENT_PORT: u16 = 546;
const DHCPV6_SERVER_PORT: u16 = 547;

/// TCP header flag bits
mod tcp_flags {
    pub const FIN: u8 = 0x01;
    pub const SYN: u8 = 0x02;
    pub const RST: u8 = 0x04;
    pub const ACK: u8 = 0x10;
}

/// Which way the frame travels relative to this interface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Transmitted by us
    Outbound,
    /// Received by us
    Inbound,
}

impl Direction {
    pub fn is_tx(&self) -> bool {
        *self == Direction::Outbound
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(if self.is_tx() { "tx" } else { "rx" })
    }
}

/// Coarse axis of the filter configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MacroCategory {
    Data,
    Management,
    Control,
}

/// Semantic category of a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Category {
    Arp,
    DhcpV4,
    DhcpV6,
    Eapol,
    DnsQueryV4,
    DnsResponseV4,
    DnsQueryV6,
    DnsResponseV6,
    TcpSyn,
    TcpSynAck,
    TcpFin,
    TcpFinAck,
    TcpAck,
    TcpRst,
    IcmpV4,
    IcmpV6,
    QosNull,
    Beacon,
    /// Any management frame other than a beacon
    Management,
    /// HE trigger frame
    Trigger,
    /// Any control frame other than a trigger
    Control,
    Other,
}

impl Category {
    pub fn macro_category(&self) -> MacroCategory {
        match self {
            Category::Beacon | Category::Management => MacroCategory::Management,
            Category::Trigger | Category::Control => MacroCategory::Control,
            _ => MacroCategory::Data,
        }
    }

    pub fn is_tcp(&self) -> bool {
        matches!(
            self,
            Category::TcpSyn
                | Category::TcpSynAck
                | Category::TcpFin
                | Category::TcpFinAck
                | Category::TcpAck
                | Category::TcpRst
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IpVersion {
    V4,
    V6,
}

/// Classify a frame given its link-layer encoding
pub fn classify(frame: &[u8], format: FrameFormat) -> Category {
    match format {
        FrameFormat::Ethernet => match EthernetHeader::parse(frame) {
            Ok(eth) => classify_ethertype(eth.ethertype(), eth.payload()),
            Err(_) => Category::Other,
        },
        FrameFormat::Ieee80211 => classify_80211(frame),
    }
}

fn classify_80211(frame: &[u8]) -> Category {
    if frame.len() < 2 {
        return Category::Other;
    }
    let frame_control = u16::from_le_bytes([frame[0], frame[1]]);
    let subtype = ((frame_control >> 4) & 0xf) as u8;

    match FrameType::from(frame_control) {
        FrameType::Management if subtype == mgmt_subtype::BEACON => Category::Beacon,
        FrameType::Management => Category::Management,
        FrameType::Control if subtype == ctrl_subtype::TRIGGER => Category::Trigger,
        FrameType::Control => Category::Control,
        FrameType::Extension => Category::Other,
        FrameType::Data => {
            if subtype == data_subtype::QOS_NULL {
                return Category::QosNull;
            }
            // Null-function subtypes carry no body
            if subtype & 0x4 != 0 {
                return Category::Other;
            }
            let hdr = match Ieee80211Header::parse(frame) {
                Ok(hdr) => hdr,
                Err(_) => return Category::Other,
            };
            if hdr.is_protected() {
                return Category::Other;
            }
            let body = hdr.body();
            match llc_snap_ethertype(body) {
                Some(ether_type) => classify_ethertype(ether_type, &body[LLC_SNAP_LEN..]),
                None => Category::Other,
            }
        }
    }
}

fn classify_ethertype(ether_type: u16, payload: &[u8]) -> Category {
    match ether_type {
        ethertype::ARP => Category::Arp,
        ethertype::EAPOL => Category::Eapol,
        ethertype::IPV4 => classify_ipv4(payload),
        ethertype::IPV6 => classify_ipv6(payload),
        _ => Category::Other,
    }
}

fn classify_ipv4(packet: &[u8]) -> Category {
    if packet.len() < 20 || packet[0] >> 4 != 4 {
        return Category::Other;
    }
    let ihl = usize::from(packet[0] & 0x0f) * 4;
    if ihl < 20 || packet.len() < ihl {
        return Category::Other;
    }
    // Only the first fragment carries the transport header
    let frag_offset = u16::from_be_bytes([packet[6], packet[7]]) & 0x1fff;
    if frag_offset != 0 {
        return Category::Other;
    }
    classify_transport(packet[9], &packet[ihl..], IpVersion::V4)
}

fn classify_ipv6(packet: &[u8]) -> Category {
    if packet.len() < 40 || packet[0] >> 4 != 6 {
        return Category::Other;
    }
    let mut next_header = packet[6];
    let mut transport = &packet[40..];

    // MLD and friends ride behind a hop-by-hop header; skip exactly one
    if next_header == IPPROTO_HOPOPTS {
        if transport.len() < 8 {
            return Category::Other;
        }
        let ext_len = (usize::from(transport[1]) + 1) * 8;
        if transport.len() < ext_len {
            return Category::Other;
        }
        next_header = transport[0];
        transport = &transport[ext_len..];
    }
    classify_transport(next_header, transport, IpVersion::V6)
}

fn classify_transport(protocol: u8, segment: &[u8], version: IpVersion) -> Category {
    match (protocol, version) {
        (IPPROTO_ICMP, IpVersion::V4) => Category::IcmpV4,
        (IPPROTO_ICMPV6, IpVersion::V6) => Category::IcmpV6,
        (IPPROTO_UDP, _) => classify_udp(segment, version),
        (IPPROTO_TCP, _) => classify_tcp(segment),
        _ => Category::Other,
    }
}

fn classify_udp(segment: &[u8], version: IpVersion) -> Category {
    if segment.len() < 8 {
        return Category::Other;
    }
    let src_port = u16::from_be_bytes([segment[0], segment[1]]);
    let dst_port = u16::from_be_bytes([segment[2], segment[3]]);
    let either = |port: u16| src_port == port || dst_port == port;

    match version {
        IpVersion::V4 if either(DHCP_SERVER_PORT) || either(DHCP_CLIENT_PORT) => Category::DhcpV4,
        IpVersion::V6 if either(DHCPV6_CLIENT_PORT) || either(DHCPV6_SERVER_PORT) => {
            Category::DhcpV6
        }
        IpVersion::V4 if dst_port == DNS_PORT => Category::DnsQueryV4,
        IpVersion::V4 if src_port == DNS_PORT => Category::DnsResponseV4,
        IpVersion::V6 if dst_port == DNS_PORT => Category::DnsQueryV6,
        IpVersion::V6 if src_port == DNS_PORT => Category::DnsResponseV6,
        _ => Category::Other,
    }
}

fn classify_tcp(segment: &[u8]) -> Category {
    if segment.len() < 20 {
        return Category::Other;
    }
    let flags = segment[13];
    let has = |bit: u8| flags & bit != 0;

    if has(tcp_flags::RST) {
        Category::TcpRst
    } else if has(tcp_flags::SYN) && has(tcp_flags::ACK) {
        Category::TcpSynAck
    } else if has(tcp_flags::SYN) {
        Category::TcpSyn
    } else if has(tcp_flags::FIN) && has(tcp_flags::ACK) {
        Category::TcpFinAck
    } else if has(tcp_flags::FIN) {
        Category::TcpFin
    } else if has(tcp_flags::ACK) {
        Category::TcpAck
    } else {
        Category::Other
    }
}

/// Frame builders shared by the unit tests of this crate
#[cfg(test)]
pub(crate) mod frames {
    use radio802::frame::{ethertype, MacAddr};

    pub const AP: MacAddr = [0x02, 0x11, 0x22, 0x33, 0x44, 0x55];
    pub const STA: MacAddr = [0x02, 0xaa, 0xbb, 0xcc, 0xdd, 0xee];
    pub const OTHER_AP: MacAddr = [0x06, 0x01, 0x02, 0x03, 0x04, 0x05];

    pub fn ethernet(ether_type: u16, payload: &[u8]) -> Vec<u8> {
        let mut frame = Vec::with_capacity(14 + payload.len());
        frame.extend_from_slice(&AP);
        frame.extend_from_slice(&STA);
        frame.extend_from_slice(&ether_type.to_be_bytes());
        frame.extend_from_slice(payload);
        frame
    }

    pub fn ipv4(protocol: u8, transport: &[u8]) -> Vec<u8> {
        let total = (20 + transport.len()) as u16;
        let mut packet = vec![0x45, 0x00];
        packet.extend_from_slice(&total.to_be_bytes());
        packet.extend_from_slice(&[0x00, 0x01, 0x40, 0x00, 64, protocol, 0, 0]);
        packet.extend_from_slice(&[192, 168, 1, 10]);
        packet.extend_from_slice(&[192, 168, 1, 1]);
        packet.extend_from_slice(transport);
        packet
    }

    pub fn ipv6(next_header: u8, transport: &[u8]) -> Vec<u8> {
        let mut packet = vec![0x60, 0, 0, 0];
        packet.extend_from_slice(&(transport.len() as u16).to_be_bytes());
        packet.push(next_header);
        packet.push(64);
        packet.extend_from_slice(&[0xfe; 16]);
        packet.extend_from_slice(&[0xfd; 16]);
        packet.extend_from_slice(transport);
        packet
    }

    pub fn udp(src_port: u16, dst_port: u16) -> Vec<u8> {
        let mut segment = Vec::new();
        segment.extend_from_slice(&src_port.to_be_bytes());
        segment.extend_from_slice(&dst_port.to_be_bytes());
        segment.extend_from_slice(&[0, 12, 0, 0, 0xde, 0xad, 0xbe, 0xef]);
        segment
    }

    pub fn tcp(flags: u8) -> Vec<u8> {
        let mut segment = vec![0xc0, 0x00, 0x01, 0xbb];
        segment.extend_from_slice(&[0; 8]); // seq, ack
        segment.push(0x50);
        segment.push(flags);
        segment.extend_from_slice(&[0xff, 0xff, 0, 0, 0, 0]);
        segment
    }

    pub fn arp() -> Vec<u8> {
        ethernet(ethertype::ARP, &[0u8; 28])
    }

    pub fn dhcp() -> Vec<u8> {
        ethernet(ethertype::IPV4, &ipv4(17, &udp(68, 67)))
    }

    pub fn eapol() -> Vec<u8> {
        ethernet(ethertype::EAPOL, &[0x02, 0x03, 0x00, 0x5f])
    }

    pub fn tcp_syn() -> Vec<u8> {
        ethernet(ethertype::IPV4, &ipv4(6, &tcp(0x02)))
    }

    pub fn icmp() -> Vec<u8> {
        ethernet(ethertype::IPV4, &ipv4(1, &[8, 0, 0, 0, 0, 1, 0, 1]))
    }

    /// 802.11 QoS data frame (ToDS) carrying an LLC/SNAP encapsulated payload
    pub fn wlan_data(ether_type: u16, payload: &[u8]) -> Vec<u8> {
        let mut frame = vec![0x88, 0x01, 0x00, 0x00];
        frame.extend_from_slice(&AP);
        frame.extend_from_slice(&STA);
        frame.extend_from_slice(&AP);
        frame.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]); // seq, qos
        frame.extend_from_slice(&[0xaa, 0xaa, 0x03, 0x00, 0x00, 0x00]);
        frame.extend_from_slice(&ether_type.to_be_bytes());
        frame.extend_from_slice(payload);
        frame
    }

    pub fn beacon(bssid: MacAddr) -> Vec<u8> {
        let mut frame = vec![0x80, 0x00, 0x00, 0x00];
        frame.extend_from_slice(&[0xff; 6]);
        frame.extend_from_slice(&bssid);
        frame.extend_from_slice(&bssid);
        frame.extend_from_slice(&[0x00, 0x00]);
        frame.extend_from_slice(&[0u8; 12]);
        frame
    }

    pub fn probe_request() -> Vec<u8> {
        let mut frame = vec![0x40, 0x00, 0x00, 0x00];
        frame.extend_from_slice(&[0xff; 6]);
        frame.extend_from_slice(&STA);
        frame.extend_from_slice(&[0xff; 6]);
        frame.extend_from_slice(&[0x00, 0x00]);
        frame
    }

    pub fn trigger() -> Vec<u8> {
        let mut frame = vec![0x24, 0x00, 0x00, 0x00];
        frame.extend_from_slice(&[0xff; 6]);
        frame.extend_from_slice(&AP);
        frame.extend_from_slice(&[0u8; 8]);
        frame
    }

    pub fn qos_null() -> Vec<u8> {
        let mut frame = vec![0xc8, 0x01, 0x00, 0x00];
        frame.extend_from_slice(&AP);
        frame.extend_from_slice(&STA);
        frame.extend_from_slice(&AP);
        frame.extend_from_slice(&[0u8; 4]);
        frame
    }
}
