//! Radiotap metadata header construction
//!
//! Turns the status reported by the tx/rx paths into a radiotap header and
//! writes it, followed by the frame, into a wrapper buffer. Firmware units
//! are normalized here: RSSI relative to the noise floor becomes dBm and
//! rates in kbps become 500 kbps units.

use bytes::BytesMut;

use radio802::frame::{ethernet_to_80211, DsDirection, MacAddr, ETH_HDR_LEN, IEEE80211_HDR_LEN, LLC_SNAP_LEN};
use radio802::phy::{Band, Bandwidth, Preamble, INVALID_RSSI};
use radio802::radiotap::{channel_flags, flags, mcs, tx_flags, McsInfo};
use radio802::{Radio802Error, RadiotapHeader, RxStatus, TxStatus};

use crate::Result;

/// 802.11b DSSS/CCK rates in kbps; every other 2.4 GHz legacy rate is OFDM
const CCK_RATES_KBPS: [u32; 4] = [1_000, 2_000, 5_500, 11_000];

/// Status reported alongside a captured frame
#[derive(Debug, Clone, Copy)]
pub enum PhyStatus<'a> {
    Rx(&'a RxStatus),
    Tx(&'a TxStatus),
}

/// Convert a raw RSSI relative to the noise floor into dBm
///
/// The firmware reports `INVALID_RSSI` when nothing was measured; that maps
/// to 0 dBm, which radiotap readers treat as "no signal information".
pub fn rssi_to_dbm(raw: u8, noise_floor_dbm: i8) -> i8 {
    if raw == INVALID_RSSI {
        return 0;
    }
    let dbm = i16::from(noise_floor_dbm) + i16::from(raw);
    dbm.clamp(i16::from(i8::MIN), i16::from(i8::MAX)) as i8
}

/// Legacy rate in radiotap's 500 kbps units
pub fn rate_to_radiotap(rate_kbps: u32) -> u8 {
    u8::try_from(rate_kbps / 500).unwrap_or(u8::MAX)
}

fn channel_flags_for(freq_mhz: u16, preamble: Preamble, rate_kbps: u32, has_mcs: bool) -> u16 {
    match Band::from_freq(freq_mhz) {
        Some(Band::Ghz2) => {
            let legacy_dsss = !has_mcs
                && matches!(preamble, Preamble::Long | Preamble::Short)
                && CCK_RATES_KBPS.contains(&rate_kbps);
            let modulation = if legacy_dsss {
                channel_flags::CCK
            } else {
                channel_flags::OFDM
            };
            channel_flags::SPECTRUM_2GHZ | modulation
        }
        Some(Band::Ghz5) | Some(Band::Ghz6) => channel_flags::SPECTRUM_5GHZ | channel_flags::OFDM,
        None => 0,
    }
}

/// HT MCS field; VHT and HE rates have no slot in the fields we emit
fn mcs_for(preamble: Preamble, index: Option<u8>, bandwidth: Bandwidth, short_gi: bool, ldpc: bool) -> Option<McsInfo> {
    if preamble != Preamble::Ht {
        return None;
    }
    let index = index?;
    let mut mcs_flags = match bandwidth {
        Bandwidth::Mhz40 => mcs::BW_40,
        _ => mcs::BW_20,
    };
    if short_gi {
        mcs_flags |= mcs::SGI;
    }
    if ldpc {
        mcs_flags |= mcs::FEC_LDPC;
    }
    Some(McsInfo {
        known: mcs::KNOWN_BW | mcs::KNOWN_MCS | mcs::KNOWN_GI | mcs::KNOWN_FEC,
        flags: mcs_flags,
        index,
    })
}

fn legacy_rate(preamble: Preamble, mcs_index: Option<u8>, rate_kbps: u32) -> Option<u8> {
    if preamble.uses_mcs() && mcs_index.is_some() {
        None
    } else {
        Some(rate_to_radiotap(rate_kbps))
    }
}

/// Builds the radiotap header of captured frames
#[derive(Debug, Clone, Copy)]
pub struct MetadataHeaderBuilder {
    noise_floor_dbm: i8,
    /// Largest header plus frame that fits a wrapper buffer
    max_len: usize,
}

impl MetadataHeaderBuilder {
    pub fn new(noise_floor_dbm: i8) -> Self {
        Self {
            noise_floor_dbm,
            max_len: crate::DEFAULT_BUFFER_SIZE,
        }
    }

    pub fn with_max_len(mut self, max_len: usize) -> Self {
        self.max_len = max_len;
        self
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    pub fn noise_floor_dbm(&self) -> i8 {
        self.noise_floor_dbm
    }

    pub fn rx_header(&self, status: &RxStatus) -> RadiotapHeader {
        let noise_floor = status.noise_floor_dbm.unwrap_or(self.noise_floor_dbm);

        let mut frame_flags = 0u8;
        if status.preamble == Preamble::Short {
            frame_flags |= flags::SHORT_PREAMBLE;
        }
        if status.fcs_present {
            frame_flags |= flags::FCS_AT_END;
        }
        if status.fcs_error {
            frame_flags |= flags::BAD_FCS;
        }
        if status.short_gi {
            frame_flags |= flags::SHORT_GI;
        }

        RadiotapHeader {
            timestamp: Some(status.tsf),
            flags: Some(frame_flags),
            rate: legacy_rate(status.preamble, status.mcs, status.rate_kbps),
            channel_frequency: Some(status.chan_freq),
            channel_flags: Some(channel_flags_for(
                status.chan_freq,
                status.preamble,
                status.rate_kbps,
                status.mcs.is_some(),
            )),
            antenna_signal: Some(rssi_to_dbm(status.rssi_comb, noise_floor)),
            antenna_noise: Some(noise_floor),
            antenna: Some(status.antenna),
            rx_flags: Some(0),
            tx_flags: None,
            data_retries: None,
            mcs: mcs_for(status.preamble, status.mcs, status.bandwidth, status.short_gi, status.ldpc),
        }
    }

    pub fn tx_header(&self, status: &TxStatus) -> RadiotapHeader {
        let mut frame_flags = 0u8;
        if status.preamble == Preamble::Short {
            frame_flags |= flags::SHORT_PREAMBLE;
        }
        if status.short_gi {
            frame_flags |= flags::SHORT_GI;
        }

        let tx = if status.completion.is_failure() {
            tx_flags::FAIL
        } else {
            0
        };

        RadiotapHeader {
            timestamp: Some(status.tsf),
            flags: Some(frame_flags),
            rate: legacy_rate(status.preamble, status.mcs, status.rate_kbps),
            channel_frequency: Some(status.chan_freq),
            channel_flags: Some(channel_flags_for(
                status.chan_freq,
                status.preamble,
                status.rate_kbps,
                status.mcs.is_some(),
            )),
            antenna_signal: Some(rssi_to_dbm(status.ack_rssi, self.noise_floor_dbm)),
            antenna_noise: None,
            antenna: None,
            rx_flags: None,
            tx_flags: Some(tx),
            data_retries: Some(status.retries),
            mcs: mcs_for(status.preamble, status.mcs, status.bandwidth, status.short_gi, status.ldpc),
        }
    }

    pub fn header(&self, status: PhyStatus<'_>) -> RadiotapHeader {
        match status {
            PhyStatus::Rx(rx) => self.rx_header(rx),
            PhyStatus::Tx(tx) => self.tx_header(tx),
        }
    }

    /// Write the radiotap header and a copy of `frame` into `buf`
    ///
    /// Returns the radiotap header length. `buf` is left untouched on error.
    pub fn build_into(&self, buf: &mut BytesMut, status: PhyStatus<'_>, frame: &[u8]) -> Result<usize> {
        let header = self.header(status);
        let header_len = header.encoded_len();
        self.check_size(header_len + frame.len())?;

        header.write_to(buf);
        buf.extend_from_slice(frame);
        Ok(header_len)
    }

    /// Like `build_into`, re-encapsulating an Ethernet frame as 802.11 on the way
    pub fn build_converted_into(
        &self,
        buf: &mut BytesMut,
        status: PhyStatus<'_>,
        eth_frame: &[u8],
        direction: DsDirection,
        bssid: MacAddr,
    ) -> Result<usize> {
        let header = self.header(status);
        let header_len = header.encoded_len();
        let converted_len = (eth_frame.len() + IEEE80211_HDR_LEN + LLC_SNAP_LEN).saturating_sub(ETH_HDR_LEN);
        self.check_size(header_len + converted_len)?;

        let start = buf.len();
        header.write_to(buf);
        if let Err(err) = ethernet_to_80211(eth_frame, direction, bssid, buf) {
            buf.truncate(start);
            return Err(err.into());
        }
        Ok(header_len)
    }

    fn check_size(&self, size: usize) -> Result<()> {
        if size > self.max_len {
            return Err(Radio802Error::FrameTooLarge {
                size,
                max: self.max_len,
            }
            .into());
        }
        Ok(())
    }
}

impl Default for MetadataHeaderBuilder {
    fn default() -> Self {
        Self::new(crate::DEFAULT_NOISE_FLOOR_DBM)
    }
}
