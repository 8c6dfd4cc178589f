//! Capture-time PHY status
//!
//! Values reported by the transmit-completion and receive paths alongside a
//! frame. Raw firmware conventions are kept here (RSSI relative to the noise
//! floor, rates in kbps); `wlan_pktcapture::header` normalizes them.

use serde::{Deserialize, Serialize};

/// Raw RSSI value the firmware reports when no measurement is available
pub const INVALID_RSSI: u8 = 0x80;

/// Preamble / PHY mode used for the PPDU
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Preamble {
    /// DSSS/CCK or OFDM legacy long preamble
    #[default]
    Long,
    /// 802.11b short preamble
    Short,
    /// HT (802.11n)
    Ht,
    /// VHT (802.11ac)
    Vht,
    /// HE (802.11ax)
    He,
}

impl Preamble {
    /// Whether the rate is described by an MCS index instead of a legacy rate
    pub fn uses_mcs(&self) -> bool {
        matches!(self, Preamble::Ht | Preamble::Vht | Preamble::He)
    }
}

/// Channel bandwidth
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Bandwidth {
    #[default]
    Mhz20,
    Mhz40,
    Mhz80,
    Mhz160,
}

/// Frequency band derived from the channel frequency
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Band {
    Ghz2,
    Ghz5,
    Ghz6,
}

impl Band {
    pub fn from_freq(freq_mhz: u16) -> Option<Self> {
        match freq_mhz {
            2412..=2484 => Some(Band::Ghz2),
            5150..=5895 => Some(Band::Ghz5),
            5925..=7125 => Some(Band::Ghz6),
            _ => None,
        }
    }
}

/// Convert a channel frequency to its IEEE channel number
pub fn freq_to_channel(freq_mhz: u16) -> Option<u8> {
    let channel = match Band::from_freq(freq_mhz)? {
        Band::Ghz2 if freq_mhz == 2484 => 14,
        Band::Ghz2 => (freq_mhz - 2407) / 5,
        Band::Ghz5 => (freq_mhz - 5000) / 5,
        Band::Ghz6 if freq_mhz == 5935 => 2,
        Band::Ghz6 => (freq_mhz - 5950) / 5,
    };
    u8::try_from(channel).ok()
}

/// Completion status of a transmitted frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TxCompletion {
    /// Acknowledged by the peer
    #[default]
    Ok,
    /// Retries exhausted without acknowledgement
    NoAck,
    /// Discarded before transmission (flush, peer removed)
    Discarded,
    /// Transmit path still owns the frame (tx capture before completion)
    Pending,
}

impl TxCompletion {
    /// Status code carried in the capture wrapper
    pub fn code(&self) -> u8 {
        match self {
            TxCompletion::Ok => 0,
            TxCompletion::NoAck => 1,
            TxCompletion::Discarded => 2,
            TxCompletion::Pending => 3,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, TxCompletion::NoAck | TxCompletion::Discarded)
    }
}

/// Status reported for a received frame
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RxStatus {
    /// TSF timestamp in microseconds
    pub tsf: u64,
    /// Channel frequency in MHz
    pub chan_freq: u16,
    /// Legacy rate in kbps (ignored when an MCS is reported)
    pub rate_kbps: u32,
    /// HT/VHT/HE MCS index
    pub mcs: Option<u8>,
    /// Combined RSSI relative to the noise floor, `INVALID_RSSI` if unknown
    pub rssi_comb: u8,
    /// Measured channel noise floor in dBm, if the firmware reported one
    pub noise_floor_dbm: Option<i8>,
    pub preamble: Preamble,
    pub bandwidth: Bandwidth,
    pub short_gi: bool,
    pub ldpc: bool,
    /// FCS check failed
    pub fcs_error: bool,
    /// Frame still carries its 4-byte FCS
    pub fcs_present: bool,
    pub antenna: u8,
    /// Traffic identifier
    pub tid: u8,
}

impl Default for RxStatus {
    fn default() -> Self {
        Self {
            tsf: 0,
            chan_freq: 2412,
            rate_kbps: 1000,
            mcs: None,
            rssi_comb: INVALID_RSSI,
            noise_floor_dbm: None,
            preamble: Preamble::default(),
            bandwidth: Bandwidth::default(),
            short_gi: false,
            ldpc: false,
            fcs_error: false,
            fcs_present: false,
            antenna: 0,
            tid: 0,
        }
    }
}

/// Status reported for a transmitted (or about to be transmitted) frame
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxStatus {
    /// TSF timestamp in microseconds
    pub tsf: u64,
    /// Channel frequency in MHz
    pub chan_freq: u16,
    /// Legacy rate in kbps (ignored when an MCS is reported)
    pub rate_kbps: u32,
    pub mcs: Option<u8>,
    /// RSSI of the acknowledgement relative to the noise floor
    pub ack_rssi: u8,
    pub preamble: Preamble,
    pub bandwidth: Bandwidth,
    pub short_gi: bool,
    pub ldpc: bool,
    /// Number of retransmissions
    pub retries: u8,
    pub completion: TxCompletion,
    /// Traffic identifier
    pub tid: u8,
}

impl Default for TxStatus {
    fn default() -> Self {
        Self {
            tsf: 0,
            chan_freq: 2412,
            rate_kbps: 1000,
            mcs: None,
            ack_rssi: INVALID_RSSI,
            preamble: Preamble::default(),
            bandwidth: Bandwidth::default(),
            short_gi: false,
            ldpc: false,
            retries: 0,
            completion: TxCompletion::default(),
            tid: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_freq_to_channel() {
        assert_eq!(freq_to_channel(2412), Some(1));
        assert_eq!(freq_to_channel(2437), Some(6));
        assert_eq!(freq_to_channel(2484), Some(14));
        assert_eq!(freq_to_channel(5180), Some(36));
        assert_eq!(freq_to_channel(5955), Some(1));
        assert_eq!(freq_to_channel(900), None);
    }

    #[test]
    fn test_tx_completion_codes() {
        assert_eq!(TxCompletion::Ok.code(), 0);
        assert!(TxCompletion::NoAck.is_failure());
        assert!(!TxCompletion::Pending.is_failure());
    }

    #[test]
    fn test_preamble_mcs() {
        assert!(Preamble::Ht.uses_mcs());
        assert!(!Preamble::Short.uses_mcs());
    }
}
