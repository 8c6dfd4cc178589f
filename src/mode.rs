//! Capture mode and the firmware-facing controller seam

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::filter::FrameFilter;
use crate::{PktCaptureError, Result};

/// Which frame families are captured on an interface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum CaptureMode {
    #[default]
    Disabled = 0,
    ManagementOnly = 1,
    DataOnly = 2,
    Both = 3,
}

impl CaptureMode {
    const MGMT_BIT: u8 = 0x1;
    const DATA_BIT: u8 = 0x2;

    pub fn from_bits(bits: u8) -> Result<Self> {
        match bits {
            0 => Ok(Self::Disabled),
            1 => Ok(Self::ManagementOnly),
            2 => Ok(Self::DataOnly),
            3 => Ok(Self::Both),
            other => Err(PktCaptureError::InvalidParameter(format!(
                "capture mode bits {:#x}",
                other
            ))),
        }
    }

    pub fn bits(&self) -> u8 {
        *self as u8
    }

    /// Management and control frames are captured
    pub fn includes_mgmt(&self) -> bool {
        self.bits() & Self::MGMT_BIT != 0
    }

    pub fn includes_data(&self) -> bool {
        self.bits() & Self::DATA_BIT != 0
    }

    pub fn is_enabled(&self) -> bool {
        *self != Self::Disabled
    }
}

impl fmt::Display for CaptureMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CaptureMode::Disabled => "disabled",
            CaptureMode::ManagementOnly => "mgmt",
            CaptureMode::DataOnly => "data",
            CaptureMode::Both => "both",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for CaptureMode {
    type Err = PktCaptureError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "disabled" | "off" => Ok(Self::Disabled),
            "mgmt" | "management" => Ok(Self::ManagementOnly),
            "data" => Ok(Self::DataOnly),
            "both" | "all" => Ok(Self::Both),
            other => Err(PktCaptureError::InvalidParameter(format!(
                "unknown capture mode '{}'",
                other
            ))),
        }
    }
}

/// Firmware/register command layer that actually turns capture on and off
pub trait ModeController: Send + Sync {
    /// Push the capture mode for an interface downstream
    fn set_capture_mode(&self, vdev_id: u8, mode: CaptureMode) -> Result<()>;

    /// Push the frame filter downstream. Firmware without filter offload
    /// ignores it; host-side filtering still applies.
    fn set_frame_filter(&self, _vdev_id: u8, _filter: &FrameFilter) -> Result<()> {
        Ok(())
    }
}

/// Controller for hosts without a firmware command path; records the request in the log
#[derive(Debug, Default)]
pub struct LoggingController;

impl ModeController for LoggingController {
    fn set_capture_mode(&self, vdev_id: u8, mode: CaptureMode) -> Result<()> {
        log::info!("vdev {}: capture mode -> {}", vdev_id, mode);
        Ok(())
    }

    fn set_frame_filter(&self, vdev_id: u8, filter: &FrameFilter) -> Result<()> {
        log::debug!("vdev {}: frame filter -> {:?}", vdev_id, filter);
        Ok(())
    }
}

/// Per-interface capture mode; lock-free reads from producers
#[derive(Debug)]
pub struct ModeState {
    mode: AtomicU8,
    activated_at: Mutex<Option<Instant>>,
}

impl Default for ModeState {
    fn default() -> Self {
        Self {
            mode: AtomicU8::new(CaptureMode::Disabled.bits()),
            activated_at: Mutex::new(None),
        }
    }
}

impl ModeState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> CaptureMode {
        // Only valid bit patterns are ever stored
        CaptureMode::from_bits(self.mode.load(Ordering::Acquire)).unwrap_or_default()
    }

    /// Store a new mode; returns the previous one
    pub fn set(&self, mode: CaptureMode) -> CaptureMode {
        let previous = self.mode.swap(mode.bits(), Ordering::AcqRel);
        let mut activated_at = self.activated_at.lock().unwrap_or_else(PoisonError::into_inner);
        match (previous != CaptureMode::Disabled.bits(), mode.is_enabled()) {
            (false, true) => *activated_at = Some(Instant::now()),
            (_, false) => *activated_at = None,
            _ => {}
        }
        CaptureMode::from_bits(previous).unwrap_or_default()
    }

    /// How long capture has been enabled without interruption
    pub fn active_duration(&self) -> Option<Duration> {
        self.activated_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .map(|start| start.elapsed())
    }

    pub fn is_mode(&self, mode: CaptureMode) -> bool {
        self.get() == mode
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_bits() {
        assert!(CaptureMode::Both.includes_mgmt());
        assert!(CaptureMode::Both.includes_data());
        assert!(CaptureMode::ManagementOnly.includes_mgmt());
        assert!(!CaptureMode::ManagementOnly.includes_data());
        assert!(!CaptureMode::Disabled.is_enabled());
        assert_eq!(CaptureMode::from_bits(2).unwrap(), CaptureMode::DataOnly);
        assert!(CaptureMode::from_bits(4).is_err());
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!("mgmt".parse::<CaptureMode>().unwrap(), CaptureMode::ManagementOnly);
        assert_eq!("BOTH".parse::<CaptureMode>().unwrap(), CaptureMode::Both);
        assert!("sniff".parse::<CaptureMode>().is_err());
        assert_eq!(CaptureMode::DataOnly.to_string(), "data");
    }

    #[test]
    fn test_mode_state_transitions() {
        let state = ModeState::new();
        assert!(state.is_mode(CaptureMode::Disabled));
        assert!(state.active_duration().is_none());

        assert_eq!(state.set(CaptureMode::Both), CaptureMode::Disabled);
        assert!(state.active_duration().is_some());

        assert_eq!(state.set(CaptureMode::DataOnly), CaptureMode::Both);
        assert!(state.active_duration().is_some());

        state.set(CaptureMode::Disabled);
        assert!(state.active_duration().is_none());
    }
}
