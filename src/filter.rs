//! Per-interface frame filters and the capture decision

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};

use crate::classify::{Category, Direction, MacroCategory};
use crate::{PktCaptureError, Result};

/// Data filter bits (`data_tx`, `data_rx`)
pub mod data_bits {
    pub const ALL: u32 = 1 << 0;
    pub const ARP: u32 = 1 << 1;
    pub const DHCPV4: u32 = 1 << 2;
    pub const DHCPV6: u32 = 1 << 3;
    pub const EAPOL: u32 = 1 << 4;
    pub const DNSV4: u32 = 1 << 5;
    pub const DNSV6: u32 = 1 << 6;
    pub const TCP_SYN: u32 = 1 << 7;
    pub const TCP_SYNACK: u32 = 1 << 8;
    pub const TCP_FIN: u32 = 1 << 9;
    pub const TCP_FINACK: u32 = 1 << 10;
    pub const TCP_ACK: u32 = 1 << 11;
    pub const TCP_RST: u32 = 1 << 12;
    pub const ICMPV4: u32 = 1 << 13;
    pub const ICMPV6: u32 = 1 << 14;
    pub const QOS_NULL: u32 = 1 << 15;
}

/// Management filter bits (`mgmt_tx`, `mgmt_rx`)
pub mod mgmt_bits {
    pub const ALL: u32 = 1 << 0;
    /// Management frames other than beacons
    pub const CONNECT_NO_BEACON: u32 = 1 << 1;
    /// Beacons from the associated BSS, subject to sampling
    pub const CONNECT_BEACON: u32 = 1 << 2;
    /// Beacons from any other BSS
    pub const SCAN_BEACON: u32 = 1 << 3;
}

/// Control filter bits (`ctrl_tx`, `ctrl_rx`)
pub mod ctrl_bits {
    pub const ALL: u32 = 1 << 0;
    pub const TRIGGER: u32 = 1 << 1;
}

/// Which fields of a `FilterUpdate` are applied
pub mod update_bits {
    pub const DATA_TX: u8 = 1 << 0;
    pub const DATA_RX: u8 = 1 << 1;
    pub const MGMT_TX: u8 = 1 << 2;
    pub const MGMT_RX: u8 = 1 << 3;
    pub const CTRL_TX: u8 = 1 << 4;
    pub const CTRL_RX: u8 = 1 << 5;
    pub const CONNECTED_BEACON_INTERVAL: u8 = 1 << 6;
    pub const VALID: u8 = 0x7f;
}

/// Filter masks of one monitored interface
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameFilter {
    pub data_tx: u32,
    pub data_rx: u32,
    pub mgmt_tx: u32,
    pub mgmt_rx: u32,
    pub ctrl_tx: u32,
    pub ctrl_rx: u32,
    /// Interval in TU at which associated-BSS beacons are kept, 0 keeps all
    pub connected_beacon_interval: u32,
}

impl FrameFilter {
    /// Filter that captures every frame in both directions
    pub fn capture_all() -> Self {
        Self {
            data_tx: data_bits::ALL,
            data_rx: data_bits::ALL,
            mgmt_tx: mgmt_bits::ALL,
            mgmt_rx: mgmt_bits::ALL,
            ctrl_tx: ctrl_bits::ALL,
            ctrl_rx: ctrl_bits::ALL,
            connected_beacon_interval: 0,
        }
    }

    pub fn mask(&self, macro_category: MacroCategory, direction: Direction) -> u32 {
        match (macro_category, direction) {
            (MacroCategory::Data, Direction::Outbound) => self.data_tx,
            (MacroCategory::Data, Direction::Inbound) => self.data_rx,
            (MacroCategory::Management, Direction::Outbound) => self.mgmt_tx,
            (MacroCategory::Management, Direction::Inbound) => self.mgmt_rx,
            (MacroCategory::Control, Direction::Outbound) => self.ctrl_tx,
            (MacroCategory::Control, Direction::Inbound) => self.ctrl_rx,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data_tx == 0
            && self.data_rx == 0
            && self.mgmt_tx == 0
            && self.mgmt_rx == 0
            && self.ctrl_tx == 0
            && self.ctrl_rx == 0
    }
}

/// Partial filter change; only the fields selected by `apply` are written
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterUpdate {
    pub apply: u8,
    pub values: FrameFilter,
}

impl FilterUpdate {
    /// Update replacing every field
    pub fn all(values: FrameFilter) -> Self {
        Self {
            apply: update_bits::VALID,
            values,
        }
    }

    pub fn data_tx(mut self, mask: u32) -> Self {
        self.apply |= update_bits::DATA_TX;
        self.values.data_tx = mask;
        self
    }

    pub fn data_rx(mut self, mask: u32) -> Self {
        self.apply |= update_bits::DATA_RX;
        self.values.data_rx = mask;
        self
    }

    pub fn mgmt_tx(mut self, mask: u32) -> Self {
        self.apply |= update_bits::MGMT_TX;
        self.values.mgmt_tx = mask;
        self
    }

    pub fn mgmt_rx(mut self, mask: u32) -> Self {
        self.apply |= update_bits::MGMT_RX;
        self.values.mgmt_rx = mask;
        self
    }

    pub fn ctrl_tx(mut self, mask: u32) -> Self {
        self.apply |= update_bits::CTRL_TX;
        self.values.ctrl_tx = mask;
        self
    }

    pub fn ctrl_rx(mut self, mask: u32) -> Self {
        self.apply |= update_bits::CTRL_RX;
        self.values.ctrl_rx = mask;
        self
    }

    pub fn connected_beacon_interval(mut self, interval_tu: u32) -> Self {
        self.apply |= update_bits::CONNECTED_BEACON_INTERVAL;
        self.values.connected_beacon_interval = interval_tu;
        self
    }

    /// Merge the selected fields over `current`
    pub fn apply_to(&self, current: &FrameFilter) -> Result<FrameFilter> {
        if self.apply == 0 || self.apply & !update_bits::VALID != 0 {
            return Err(PktCaptureError::InvalidParameter(format!(
                "filter apply mask {:#04x}",
                self.apply
            )));
        }

        let pick = |bit: u8, new: u32, old: u32| if self.apply & bit != 0 { new } else { old };
        let v = &self.values;
        Ok(FrameFilter {
            data_tx: pick(update_bits::DATA_TX, v.data_tx, current.data_tx),
            data_rx: pick(update_bits::DATA_RX, v.data_rx, current.data_rx),
            mgmt_tx: pick(update_bits::MGMT_TX, v.mgmt_tx, current.mgmt_tx),
            mgmt_rx: pick(update_bits::MGMT_RX, v.mgmt_rx, current.mgmt_rx),
            ctrl_tx: pick(update_bits::CTRL_TX, v.ctrl_tx, current.ctrl_tx),
            ctrl_rx: pick(update_bits::CTRL_RX, v.ctrl_rx, current.ctrl_rx),
            connected_beacon_interval: pick(
                update_bits::CONNECTED_BEACON_INTERVAL,
                v.connected_beacon_interval,
                current.connected_beacon_interval,
            ),
        })
    }
}

fn category_bit(category: Category) -> u32 {
    match category {
        Category::Arp => data_bits::ARP,
        Category::DhcpV4 => data_bits::DHCPV4,
        Category::DhcpV6 => data_bits::DHCPV6,
        Category::Eapol => data_bits::EAPOL,
        Category::DnsQueryV4 | Category::DnsResponseV4 => data_bits::DNSV4,
        Category::DnsQueryV6 | Category::DnsResponseV6 => data_bits::DNSV6,
        Category::TcpSyn => data_bits::TCP_SYN,
        Category::TcpSynAck => data_bits::TCP_SYNACK,
        Category::TcpFin => data_bits::TCP_FIN,
        Category::TcpFinAck => data_bits::TCP_FINACK,
        Category::TcpAck => data_bits::TCP_ACK,
        Category::TcpRst => data_bits::TCP_RST,
        Category::IcmpV4 => data_bits::ICMPV4,
        Category::IcmpV6 => data_bits::ICMPV6,
        Category::QosNull => data_bits::QOS_NULL,
        Category::Beacon => mgmt_bits::CONNECT_BEACON | mgmt_bits::SCAN_BEACON,
        Category::Management => mgmt_bits::CONNECT_NO_BEACON,
        Category::Trigger => ctrl_bits::TRIGGER,
        Category::Control | Category::Other => 0,
    }
}

/// Capture decision for a classified frame
///
/// Beacons only report eligibility here; `BeaconSampler::admit` decides
/// between own-BSS and foreign beacons.
pub fn should_capture(category: Category, direction: Direction, filter: &FrameFilter) -> bool {
    let mask = filter.mask(category.macro_category(), direction);
    // bit 0 is ALL in every mask
    if mask & 1 != 0 {
        return true;
    }
    mask & category_bit(category) != 0
}

/// Number of own-BSS beacons per kept one
pub fn beacon_sampling_period(connected_interval_tu: u32, beacon_interval_tu: u16) -> Result<u32> {
    if connected_interval_tu == 0 {
        return Ok(1);
    }
    if beacon_interval_tu == 0 {
        return Err(PktCaptureError::Config(format!(
            "connected beacon interval {} TU needs a non-zero beacon interval",
            connected_interval_tu
        )));
    }
    Ok((connected_interval_tu / u32::from(beacon_interval_tu)).max(1))
}

/// Keeps every Nth beacon of the associated BSS
#[derive(Debug, Default)]
pub struct BeaconSampler {
    beacon_interval_tu: AtomicU16,
    seen: AtomicU64,
}

impl BeaconSampler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn beacon_interval(&self) -> u16 {
        self.beacon_interval_tu.load(Ordering::Acquire)
    }

    pub fn set_beacon_interval(&self, interval_tu: u16) {
        self.beacon_interval_tu.store(interval_tu, Ordering::Release);
        self.reset();
    }

    pub fn reset(&self) {
        self.seen.store(0, Ordering::Relaxed);
    }

    /// Final decision for a beacon that `should_capture` found eligible
    pub fn admit(&self, own_bss: bool, direction: Direction, filter: &FrameFilter) -> bool {
        let mask = filter.mask(MacroCategory::Management, direction);
        if mask & mgmt_bits::ALL != 0 {
            return true;
        }
        if !own_bss {
            return mask & mgmt_bits::SCAN_BEACON != 0;
        }
        if mask & mgmt_bits::CONNECT_BEACON == 0 {
            return false;
        }
        // Rejected configurations never reach here; keep everything if one does
        let period = beacon_sampling_period(filter.connected_beacon_interval, self.beacon_interval())
            .unwrap_or(1);
        self.seen.fetch_add(1, Ordering::Relaxed) % u64::from(period) == 0
    }
}
