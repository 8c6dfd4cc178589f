//! # Radio802 - IEEE 802.11 frame helpers for monitor capture
//!
//! Wire-level building blocks used by the capture pipeline:
//!
//! - `frame`: 802.11 / Ethernet header inspection and 802.3 to 802.11 re-encapsulation
//! - `radiotap`: radiotap header construction and parsing
//! - `phy`: capture-time status reported by the tx/rx paths

pub mod error;
pub mod frame;
pub mod phy;
pub mod radiotap;

pub use error::{Radio802Error, Result};
pub use frame::{FrameFormat, FrameType, MacAddr};
pub use phy::{Bandwidth, Preamble, RxStatus, TxStatus};
pub use radiotap::RadiotapHeader;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Largest 802.11 MPDU (VHT, IEEE 802.11-2020 Table 9-34)
pub const MAX_MPDU_SIZE: usize = 11_454;

/// Largest A-MSDU carried in a non-VHT MPDU
pub const MAX_AMSDU_SIZE: usize = 7_935;
