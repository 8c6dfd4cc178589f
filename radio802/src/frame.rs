//! IEEE 802.11 and Ethernet frame inspection
//!
//! Zero-copy views over producer-owned buffers. Nothing in here mutates the
//! input; conversions write into a caller supplied `BytesMut`.

use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{Radio802Error, Result};

/// 48-bit IEEE MAC address
pub type MacAddr = [u8; 6];

/// Broadcast address
pub const BROADCAST_ADDR: MacAddr = [0xff; 6];

/// Minimum 802.11 header carrying three addresses and sequence control
pub const IEEE80211_HDR_LEN: usize = 24;

/// Ethernet II header without VLAN tag
pub const ETH_HDR_LEN: usize = 14;

/// LLC/SNAP header length (DSAP, SSAP, control, OUI, ethertype)
pub const LLC_SNAP_LEN: usize = 8;

const LLC_SNAP_PREFIX: [u8; 6] = [0xaa, 0xaa, 0x03, 0x00, 0x00, 0x00];

/// Ethertypes the capture path cares about
pub mod ethertype {
    pub const IPV4: u16 = 0x0800;
    pub const ARP: u16 = 0x0806;
    pub const VLAN: u16 = 0x8100;
    pub const IPV6: u16 = 0x86dd;
    pub const EAPOL: u16 = 0x888e;
}

/// Frame control flag bits (frame control read as little-endian u16)
pub mod fc_flags {
    pub const TO_DS: u16 = 0x0100;
    pub const FROM_DS: u16 = 0x0200;
    pub const MORE_FRAGMENTS: u16 = 0x0400;
    pub const RETRY: u16 = 0x0800;
    pub const POWER_MGMT: u16 = 0x1000;
    pub const MORE_DATA: u16 = 0x2000;
    pub const PROTECTED: u16 = 0x4000;
    pub const ORDER: u16 = 0x8000;
}

/// Management subtypes
pub mod mgmt_subtype {
    pub const ASSOC_REQ: u8 = 0;
    pub const ASSOC_RESP: u8 = 1;
    pub const PROBE_REQ: u8 = 4;
    pub const PROBE_RESP: u8 = 5;
    pub const BEACON: u8 = 8;
    pub const DISASSOC: u8 = 10;
    pub const AUTH: u8 = 11;
    pub const DEAUTH: u8 = 12;
    pub const ACTION: u8 = 13;
}

/// Control subtypes
pub mod ctrl_subtype {
    pub const TRIGGER: u8 = 2;
    pub const BLOCK_ACK_REQ: u8 = 8;
    pub const BLOCK_ACK: u8 = 9;
    pub const PS_POLL: u8 = 10;
    pub const RTS: u8 = 11;
    pub const CTS: u8 = 12;
    pub const ACK: u8 = 13;
}

/// Data subtypes
pub mod data_subtype {
    pub const DATA: u8 = 0;
    pub const NULL: u8 = 4;
    pub const QOS_DATA: u8 = 8;
    pub const QOS_NULL: u8 = 12;
}

/// IEEE 802.11 frame types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameType {
    /// Management frames (beacon, probe, auth, etc.)
    Management = 0,
    /// Control frames (RTS, CTS, ACK, trigger, etc.)
    Control = 1,
    /// Data frames
    Data = 2,
    /// Extension frames
    Extension = 3,
}

impl From<u16> for FrameType {
    fn from(frame_control: u16) -> Self {
        match (frame_control >> 2) & 0x3 {
            0 => FrameType::Management,
            1 => FrameType::Control,
            2 => FrameType::Data,
            _ => FrameType::Extension,
        }
    }
}

/// Link-layer encoding of a captured frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FrameFormat {
    /// Native Ethernet II (802.3) framing, two addresses
    Ethernet,
    /// 802.11 framing, three (or four) addresses
    Ieee80211,
}

/// Distribution-system direction used when building an 802.11 data header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DsDirection {
    /// Station to AP (ToDS)
    ToDs,
    /// AP to station (FromDS)
    FromDs,
}

/// Borrowed view of an 802.11 MAC header
#[derive(Debug, Clone, Copy)]
pub struct Ieee80211Header<'a> {
    data: &'a [u8],
    frame_control: u16,
    header_len: usize,
}

impl<'a> Ieee80211Header<'a> {
    /// Parse the MAC header at the start of `data`
    pub fn parse(data: &'a [u8]) -> Result<Self> {
        if data.len() < 2 {
            return Err(Radio802Error::Truncated { needed: 2, actual: data.len() });
        }
        let frame_control = u16::from_le_bytes([data[0], data[1]]);
        let header_len = header_length(frame_control);
        if data.len() < header_len {
            return Err(Radio802Error::Truncated {
                needed: header_len,
                actual: data.len(),
            });
        }

        Ok(Self {
            data,
            frame_control,
            header_len,
        })
    }

    pub fn frame_control(&self) -> u16 {
        self.frame_control
    }

    pub fn frame_type(&self) -> FrameType {
        FrameType::from(self.frame_control)
    }

    pub fn subtype(&self) -> u8 {
        ((self.frame_control >> 4) & 0xf) as u8
    }

    /// Length of the MAC header including QoS/HT control and addr4
    pub fn header_len(&self) -> usize {
        self.header_len
    }

    pub fn has_flag(&self, flag: u16) -> bool {
        self.frame_control & flag != 0
    }

    pub fn is_protected(&self) -> bool {
        self.has_flag(fc_flags::PROTECTED)
    }

    pub fn is_retry(&self) -> bool {
        self.has_flag(fc_flags::RETRY)
    }

    pub fn is_beacon(&self) -> bool {
        self.frame_type() == FrameType::Management && self.subtype() == mgmt_subtype::BEACON
    }

    pub fn is_qos_null(&self) -> bool {
        self.frame_type() == FrameType::Data && self.subtype() == data_subtype::QOS_NULL
    }

    /// Receiver address
    pub fn addr1(&self) -> Option<MacAddr> {
        mac_at(self.data, 4)
    }

    /// Transmitter address (absent on CTS/ACK)
    pub fn addr2(&self) -> Option<MacAddr> {
        if self.header_len < 16 {
            return None;
        }
        mac_at(self.data, 10)
    }

    pub fn addr3(&self) -> Option<MacAddr> {
        if self.header_len < IEEE80211_HDR_LEN {
            return None;
        }
        mac_at(self.data, 16)
    }

    /// BSSID according to the ToDS/FromDS bits
    pub fn bssid(&self) -> Option<MacAddr> {
        match self.frame_type() {
            FrameType::Management => self.addr3(),
            FrameType::Data => {
                let to_ds = self.has_flag(fc_flags::TO_DS);
                let from_ds = self.has_flag(fc_flags::FROM_DS);
                match (to_ds, from_ds) {
                    (false, false) => self.addr3(),
                    (true, false) => self.addr1(),
                    (false, true) => self.addr2(),
                    (true, true) => None,
                }
            }
            _ => None,
        }
    }

    /// Source address of the MSDU
    pub fn source(&self) -> Option<MacAddr> {
        if self.frame_type() == FrameType::Data && self.has_flag(fc_flags::FROM_DS) {
            if self.has_flag(fc_flags::TO_DS) {
                return mac_at(self.data, 24);
            }
            return self.addr3();
        }
        self.addr2()
    }

    pub fn sequence(&self) -> Option<u16> {
        if self.header_len < IEEE80211_HDR_LEN {
            return None;
        }
        let seq_ctrl = u16::from_le_bytes([self.data[22], self.data[23]]);
        Some(seq_ctrl >> 4)
    }

    /// Traffic identifier of a QoS data frame
    pub fn tid(&self) -> Option<u8> {
        if self.frame_type() != FrameType::Data || self.subtype() & 0x8 == 0 {
            return None;
        }
        let qos_offset = if self.has_flag(fc_flags::TO_DS) && self.has_flag(fc_flags::FROM_DS) {
            30
        } else {
            24
        };
        self.data.get(qos_offset).map(|b| b & 0x0f)
    }

    /// Frame body following the MAC header
    pub fn body(&self) -> &'a [u8] {
        &self.data[self.header_len..]
    }
}

/// Compute the 802.11 MAC header length from the frame control field
pub fn header_length(frame_control: u16) -> usize {
    let subtype = ((frame_control >> 4) & 0xf) as u8;
    match FrameType::from(frame_control) {
        FrameType::Management => {
            if frame_control & fc_flags::ORDER != 0 {
                IEEE80211_HDR_LEN + 4
            } else {
                IEEE80211_HDR_LEN
            }
        }
        FrameType::Control => match subtype {
            ctrl_subtype::CTS | ctrl_subtype::ACK => 10,
            _ => 16,
        },
        FrameType::Data => {
            let mut len = IEEE80211_HDR_LEN;
            if frame_control & fc_flags::TO_DS != 0 && frame_control & fc_flags::FROM_DS != 0 {
                len += 6;
            }
            if subtype & 0x8 != 0 {
                len += 2;
                // HT control is only present on QoS frames with the order bit
                if frame_control & fc_flags::ORDER != 0 {
                    len += 4;
                }
            }
            len
        }
        FrameType::Extension => IEEE80211_HDR_LEN,
    }
}

/// Ethertype carried by an LLC/SNAP encapsulated payload
pub fn llc_snap_ethertype(payload: &[u8]) -> Option<u16> {
    if payload.len() < LLC_SNAP_LEN || payload[..6] != LLC_SNAP_PREFIX {
        return None;
    }
    Some(u16::from_be_bytes([payload[6], payload[7]]))
}

/// Borrowed view of an Ethernet II header (one 802.1Q tag tolerated)
#[derive(Debug, Clone, Copy)]
pub struct EthernetHeader<'a> {
    data: &'a [u8],
    ethertype: u16,
    header_len: usize,
}

impl<'a> EthernetHeader<'a> {
    pub fn parse(data: &'a [u8]) -> Result<Self> {
        if data.len() < ETH_HDR_LEN {
            return Err(Radio802Error::Truncated {
                needed: ETH_HDR_LEN,
                actual: data.len(),
            });
        }
        let mut ethertype = u16::from_be_bytes([data[12], data[13]]);
        let mut header_len = ETH_HDR_LEN;
        if ethertype == ethertype::VLAN {
            if data.len() < ETH_HDR_LEN + 4 {
                return Err(Radio802Error::Truncated {
                    needed: ETH_HDR_LEN + 4,
                    actual: data.len(),
                });
            }
            ethertype = u16::from_be_bytes([data[16], data[17]]);
            header_len += 4;
        }

        Ok(Self {
            data,
            ethertype,
            header_len,
        })
    }

    pub fn destination(&self) -> MacAddr {
        let mut addr = [0u8; 6];
        addr.copy_from_slice(&self.data[0..6]);
        addr
    }

    pub fn source(&self) -> MacAddr {
        let mut addr = [0u8; 6];
        addr.copy_from_slice(&self.data[6..12]);
        addr
    }

    pub fn ethertype(&self) -> u16 {
        self.ethertype
    }

    pub fn header_len(&self) -> usize {
        self.header_len
    }

    pub fn payload(&self) -> &'a [u8] {
        &self.data[self.header_len..]
    }
}

/// Re-encapsulate an Ethernet II frame as a three-address 802.11 data frame
///
/// The output is appended to `out`: MAC header, LLC/SNAP, then the original
/// payload. VLAN tags are stripped.
pub fn ethernet_to_80211(
    eth_frame: &[u8],
    direction: DsDirection,
    bssid: MacAddr,
    out: &mut BytesMut,
) -> Result<()> {
    let eth = EthernetHeader::parse(eth_frame)?;
    let payload = eth.payload();

    out.reserve(IEEE80211_HDR_LEN + LLC_SNAP_LEN + payload.len());

    // Data frame, subtype 0
    let (frame_control, addr1, addr2, addr3) = match direction {
        DsDirection::ToDs => (0x0008 | fc_flags::TO_DS, bssid, eth.source(), eth.destination()),
        DsDirection::FromDs => (0x0008 | fc_flags::FROM_DS, eth.destination(), bssid, eth.source()),
    };
    out.put_u16_le(frame_control);
    out.put_u16_le(0); // duration
    out.put_slice(&addr1);
    out.put_slice(&addr2);
    out.put_slice(&addr3);
    out.put_u16_le(0); // sequence control

    out.put_slice(&LLC_SNAP_PREFIX);
    out.put_u16(eth.ethertype());
    out.put_slice(payload);

    Ok(())
}

/// Display adapter for MAC addresses
pub struct MacDisplay<'a>(pub &'a MacAddr);

impl fmt::Display for MacDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let a = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            a[0], a[1], a[2], a[3], a[4], a[5]
        )
    }
}

fn mac_at(data: &[u8], offset: usize) -> Option<MacAddr> {
    let bytes = data.get(offset..offset + 6)?;
    let mut addr = [0u8; 6];
    addr.copy_from_slice(bytes);
    Some(addr)
}
