//! Radiotap header generation and parsing
//!
//! Based on the radiotap specification (<https://www.radiotap.org>). Every
//! field is naturally aligned relative to the start of the header, fields are
//! emitted in ascending presence-bit order and all multi-byte values are
//! little-endian.

use bytes::{Buf, BufMut, BytesMut};

use crate::{Radio802Error, Result};

/// Length of the fixed part: version, pad, length, first present word
pub const RADIOTAP_FIXED_LEN: usize = 8;

/// Radiotap header present flags
pub mod present_flags {
    pub const TSFT: u32 = 1 << 0;
    pub const FLAGS: u32 = 1 << 1;
    pub const RATE: u32 = 1 << 2;
    pub const CHANNEL: u32 = 1 << 3;
    pub const FHSS: u32 = 1 << 4;
    pub const DBM_ANTSIGNAL: u32 = 1 << 5;
    pub const DBM_ANTNOISE: u32 = 1 << 6;
    pub const LOCK_QUALITY: u32 = 1 << 7;
    pub const TX_ATTENUATION: u32 = 1 << 8;
    pub const DB_TX_ATTENUATION: u32 = 1 << 9;
    pub const DBM_TX_POWER: u32 = 1 << 10;
    pub const ANTENNA: u32 = 1 << 11;
    pub const DB_ANTSIGNAL: u32 = 1 << 12;
    pub const DB_ANTNOISE: u32 = 1 << 13;
    pub const RX_FLAGS: u32 = 1 << 14;
    pub const TX_FLAGS: u32 = 1 << 15;
    pub const RTS_RETRIES: u32 = 1 << 16;
    pub const DATA_RETRIES: u32 = 1 << 17;
    pub const XCHANNEL: u32 = 1 << 18;
    pub const MCS: u32 = 1 << 19;
    pub const AMPDU_STATUS: u32 = 1 << 20;
    pub const VHT: u32 = 1 << 21;
    pub const EXT: u32 = 1 << 31;
}

/// FLAGS field bits
pub mod flags {
    pub const CFP: u8 = 0x01;
    pub const SHORT_PREAMBLE: u8 = 0x02;
    pub const WEP: u8 = 0x04;
    pub const FRAG: u8 = 0x08;
    pub const FCS_AT_END: u8 = 0x10;
    pub const DATA_PAD: u8 = 0x20;
    pub const BAD_FCS: u8 = 0x40;
    pub const SHORT_GI: u8 = 0x80;
}

/// Channel flags
pub mod channel_flags {
    pub const TURBO: u16 = 0x0010;
    pub const CCK: u16 = 0x0020;
    pub const OFDM: u16 = 0x0040;
    pub const SPECTRUM_2GHZ: u16 = 0x0080;
    pub const SPECTRUM_5GHZ: u16 = 0x0100;
    pub const PASSIVE: u16 = 0x0200;
    pub const DYN: u16 = 0x0400;
    pub const GFSK: u16 = 0x0800;
    pub const HALF_RATE: u16 = 0x4000;
    pub const QUARTER_RATE: u16 = 0x8000;
}

/// RX flags
pub mod rx_flags {
    pub const BAD_PLCP: u16 = 0x0002;
}

/// TX flags
pub mod tx_flags {
    pub const FAIL: u16 = 0x0001;
    pub const CTS: u16 = 0x0002;
    pub const RTS: u16 = 0x0004;
    pub const NO_ACK: u16 = 0x0008;
}

/// MCS field: `known` byte and `flags` byte
pub mod mcs {
    pub const KNOWN_BW: u8 = 0x01;
    pub const KNOWN_MCS: u8 = 0x02;
    pub const KNOWN_GI: u8 = 0x04;
    pub const KNOWN_FMT: u8 = 0x08;
    pub const KNOWN_FEC: u8 = 0x10;

    pub const BW_20: u8 = 0x00;
    pub const BW_40: u8 = 0x01;
    pub const SGI: u8 = 0x04;
    pub const FEC_LDPC: u8 = 0x10;
}

/// (alignment, size) of each standard field, indexed by presence bit
const FIELD_LAYOUT: [(usize, usize); 22] = [
    (8, 8),  // TSFT
    (1, 1),  // FLAGS
    (1, 1),  // RATE
    (2, 4),  // CHANNEL
    (1, 2),  // FHSS
    (1, 1),  // DBM_ANTSIGNAL
    (1, 1),  // DBM_ANTNOISE
    (2, 2),  // LOCK_QUALITY
    (2, 2),  // TX_ATTENUATION
    (2, 2),  // DB_TX_ATTENUATION
    (1, 1),  // DBM_TX_POWER
    (1, 1),  // ANTENNA
    (1, 1),  // DB_ANTSIGNAL
    (1, 1),  // DB_ANTNOISE
    (2, 2),  // RX_FLAGS
    (2, 2),  // TX_FLAGS
    (1, 1),  // RTS_RETRIES
    (1, 1),  // DATA_RETRIES
    (4, 8),  // XCHANNEL
    (1, 3),  // MCS
    (4, 8),  // AMPDU_STATUS
    (2, 12), // VHT
];

/// HT MCS information
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct McsInfo {
    pub known: u8,
    pub flags: u8,
    pub index: u8,
}

/// Radiotap header with the subset of fields the capture path produces
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RadiotapHeader {
    pub timestamp: Option<u64>,
    pub flags: Option<u8>,
    /// Legacy rate in 500 kbps units
    pub rate: Option<u8>,
    pub channel_frequency: Option<u16>,
    pub channel_flags: Option<u16>,
    pub antenna_signal: Option<i8>,
    pub antenna_noise: Option<i8>,
    pub antenna: Option<u8>,
    pub rx_flags: Option<u16>,
    pub tx_flags: Option<u16>,
    pub data_retries: Option<u8>,
    pub mcs: Option<McsInfo>,
}

impl RadiotapHeader {
    /// Present bitmap for the populated fields
    pub fn present(&self) -> u32 {
        let mut present = 0u32;

        if self.timestamp.is_some() {
            present |= present_flags::TSFT;
        }
        if self.flags.is_some() {
            present |= present_flags::FLAGS;
        }
        if self.rate.is_some() {
            present |= present_flags::RATE;
        }
        if self.channel_frequency.is_some() {
            present |= present_flags::CHANNEL;
        }
        if self.antenna_signal.is_some() {
            present |= present_flags::DBM_ANTSIGNAL;
        }
        if self.antenna_noise.is_some() {
            present |= present_flags::DBM_ANTNOISE;
        }
        if self.antenna.is_some() {
            present |= present_flags::ANTENNA;
        }
        if self.rx_flags.is_some() {
            present |= present_flags::RX_FLAGS;
        }
        if self.tx_flags.is_some() {
            present |= present_flags::TX_FLAGS;
        }
        if self.data_retries.is_some() {
            present |= present_flags::DATA_RETRIES;
        }
        if self.mcs.is_some() {
            present |= present_flags::MCS;
        }

        present
    }

    /// Encoded header length, alignment padding included
    pub fn encoded_len(&self) -> usize {
        let present = self.present();
        let mut len = RADIOTAP_FIXED_LEN;
        for (bit, (align, size)) in FIELD_LAYOUT.iter().enumerate() {
            if present & (1 << bit) != 0 {
                len = align_up(len, *align) + size;
            }
        }
        len
    }

    /// Append the encoded header to `buf`
    pub fn write_to(&self, buf: &mut BytesMut) {
        let length = self.encoded_len();
        buf.reserve(length);

        let start = buf.len();
        buf.put_u8(0); // version
        buf.put_u8(0); // padding
        buf.put_u16_le(length as u16);
        buf.put_u32_le(self.present());

        if let Some(timestamp) = self.timestamp {
            pad_to(buf, start, 8);
            buf.put_u64_le(timestamp);
        }
        if let Some(flags) = self.flags {
            buf.put_u8(flags);
        }
        if let Some(rate) = self.rate {
            buf.put_u8(rate);
        }
        if let Some(freq) = self.channel_frequency {
            pad_to(buf, start, 2);
            buf.put_u16_le(freq);
            buf.put_u16_le(self.channel_flags.unwrap_or(0));
        }
        if let Some(signal) = self.antenna_signal {
            buf.put_i8(signal);
        }
        if let Some(noise) = self.antenna_noise {
            buf.put_i8(noise);
        }
        if let Some(antenna) = self.antenna {
            buf.put_u8(antenna);
        }
        if let Some(rx_flags) = self.rx_flags {
            pad_to(buf, start, 2);
            buf.put_u16_le(rx_flags);
        }
        if let Some(tx_flags) = self.tx_flags {
            pad_to(buf, start, 2);
            buf.put_u16_le(tx_flags);
        }
        if let Some(retries) = self.data_retries {
            buf.put_u8(retries);
        }
        if let Some(mcs) = self.mcs {
            buf.put_u8(mcs.known);
            buf.put_u8(mcs.flags);
            buf.put_u8(mcs.index);
        }

        debug_assert_eq!(buf.len() - start, length);
    }

    /// Serialize radiotap header to bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.write_to(&mut buf);
        buf.to_vec()
    }

    /// Parse a radiotap header, returning it with its encoded length
    ///
    /// Standard fields this type does not model are skipped. Extended
    /// presence words are rejected.
    pub fn parse(data: &[u8]) -> Result<(Self, usize)> {
        if data.len() < RADIOTAP_FIXED_LEN {
            return Err(Radio802Error::Truncated {
                needed: RADIOTAP_FIXED_LEN,
                actual: data.len(),
            });
        }

        let mut fixed = &data[..RADIOTAP_FIXED_LEN];
        let version = fixed.get_u8();
        let _pad = fixed.get_u8();
        let length = fixed.get_u16_le() as usize;
        let present = fixed.get_u32_le();

        if version != 0 {
            return Err(radiotap_error(format!("unsupported version {}", version)));
        }
        if length < RADIOTAP_FIXED_LEN || data.len() < length {
            return Err(radiotap_error(format!("invalid header length {}", length)));
        }
        if present & present_flags::EXT != 0 {
            return Err(radiotap_error("extended present words are not supported".to_string()));
        }
        if present >> FIELD_LAYOUT.len() != 0 {
            return Err(radiotap_error(format!("unknown present bits {:#010x}", present)));
        }

        let mut header = Self::default();
        let mut offset = RADIOTAP_FIXED_LEN;

        for (bit, (align, size)) in FIELD_LAYOUT.iter().enumerate() {
            let flag = 1u32 << bit;
            if present & flag == 0 {
                continue;
            }
            offset = align_up(offset, *align);
            if offset + size > length {
                return Err(radiotap_error(format!("field {} exceeds header", bit)));
            }
            let mut field = &data[offset..offset + size];
            match flag {
                present_flags::TSFT => header.timestamp = Some(field.get_u64_le()),
                present_flags::FLAGS => header.flags = Some(field.get_u8()),
                present_flags::RATE => header.rate = Some(field.get_u8()),
                present_flags::CHANNEL => {
                    header.channel_frequency = Some(field.get_u16_le());
                    header.channel_flags = Some(field.get_u16_le());
                }
                present_flags::DBM_ANTSIGNAL => header.antenna_signal = Some(field.get_i8()),
                present_flags::DBM_ANTNOISE => header.antenna_noise = Some(field.get_i8()),
                present_flags::ANTENNA => header.antenna = Some(field.get_u8()),
                present_flags::RX_FLAGS => header.rx_flags = Some(field.get_u16_le()),
                present_flags::TX_FLAGS => header.tx_flags = Some(field.get_u16_le()),
                present_flags::DATA_RETRIES => header.data_retries = Some(field.get_u8()),
                present_flags::MCS => {
                    header.mcs = Some(McsInfo {
                        known: field.get_u8(),
                        flags: field.get_u8(),
                        index: field.get_u8(),
                    })
                }
                _ => {}
            }
            offset += size;
        }

        Ok((header, length))
    }
}

fn align_up(offset: usize, align: usize) -> usize {
    (offset + align - 1) & !(align - 1)
}

fn pad_to(buf: &mut BytesMut, start: usize, align: usize) {
    while (buf.len() - start) % align != 0 {
        buf.put_u8(0);
    }
}

fn radiotap_error(message: String) -> Radio802Error {
    Radio802Error::Radiotap { message }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rx_header() -> RadiotapHeader {
        RadiotapHeader {
            timestamp: Some(0x0102_0304_0506_0708),
            flags: Some(flags::FCS_AT_END),
            rate: Some(12),
            channel_frequency: Some(2437),
            channel_flags: Some(channel_flags::SPECTRUM_2GHZ | channel_flags::OFDM),
            antenna_signal: Some(-42),
            antenna_noise: Some(-96),
            antenna: Some(1),
            rx_flags: Some(0),
            ..Default::default()
        }
    }

    #[test]
    fn test_present_flags() {
        let header = rx_header();
        let present = header.present();
        assert_ne!(present & present_flags::TSFT, 0);
        assert_ne!(present & present_flags::RX_FLAGS, 0);
        assert_eq!(present & present_flags::TX_FLAGS, 0);
        assert_eq!(present & present_flags::MCS, 0);
    }

    #[test]
    fn test_field_alignment() {
        // flags only (1 byte at offset 8), then channel must start at 10
        let header = RadiotapHeader {
            flags: Some(0),
            channel_frequency: Some(5180),
            ..Default::default()
        };
        let bytes = header.to_bytes();
        assert_eq!(bytes.len(), 14);
        assert_eq!(u16::from_le_bytes([bytes[10], bytes[11]]), 5180);

        // TSFT starts right after the 8-byte fixed part
        let bytes = rx_header().to_bytes();
        assert_eq!(&bytes[8..16], &0x0102_0304_0506_0708u64.to_le_bytes());
    }

    #[test]
    fn test_length_field_matches() {
        let header = rx_header();
        let bytes = header.to_bytes();
        assert_eq!(u16::from_le_bytes([bytes[2], bytes[3]]) as usize, bytes.len());
        assert_eq!(header.encoded_len(), bytes.len());
    }

    #[test]
    fn test_parse_built_header() {
        let header = RadiotapHeader {
            timestamp: Some(99),
            flags: Some(flags::SHORT_PREAMBLE),
            channel_frequency: Some(2412),
            channel_flags: Some(channel_flags::CCK | channel_flags::SPECTRUM_2GHZ),
            antenna_signal: Some(-60),
            tx_flags: Some(tx_flags::FAIL),
            data_retries: Some(3),
            mcs: Some(McsInfo {
                known: mcs::KNOWN_MCS | mcs::KNOWN_BW,
                flags: mcs::BW_40,
                index: 7,
            }),
            ..Default::default()
        };
        let mut bytes = header.to_bytes();
        bytes.extend_from_slice(&[0xaa, 0xbb]);

        let (parsed, len) = RadiotapHeader::parse(&bytes).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(&bytes[len..], &[0xaa, 0xbb]);
    }

    #[test]
    fn test_parse_skips_unmodelled_fields() {
        // present: FLAGS | FHSS | ANTENNA
        let mut bytes = vec![0, 0, 12, 0];
        bytes.extend_from_slice(&(present_flags::FLAGS | present_flags::FHSS | present_flags::ANTENNA).to_le_bytes());
        bytes.extend_from_slice(&[0x10, 0x01, 0x02, 0x03]);

        let (parsed, len) = RadiotapHeader::parse(&bytes).unwrap();
        assert_eq!(len, 12);
        assert_eq!(parsed.flags, Some(0x10));
        assert_eq!(parsed.antenna, Some(0x03));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(RadiotapHeader::parse(&[0, 0, 4]).is_err());
        // length shorter than the fixed part
        assert!(RadiotapHeader::parse(&[0, 0, 4, 0, 0, 0, 0, 0]).is_err());
        // extended bitmap
        let mut bytes = vec![0, 0, 12, 0];
        bytes.extend_from_slice(&present_flags::EXT.to_le_bytes());
        bytes.extend_from_slice(&[0; 4]);
        assert!(RadiotapHeader::parse(&bytes).is_err());
    }
}
