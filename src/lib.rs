//! # WLAN monitor-capture pipeline
//!
//! Intercepts management, control, data and firmware-offloaded frames on a
//! WLAN interface, filters them per category, prepends a radiotap header and
//! hands them to a registered consumer from a single ordered worker thread.
//!
//! ## Architecture
//!
//! - `classify`: maps a raw frame to a semantic category
//! - `filter`: per-interface filter masks and the capture decision
//! - `header`: radiotap metadata header construction
//! - `pool`: fixed-capacity wrapper pool
//! - `queue`: ordered producer/worker hand-off
//! - `worker`: delivery thread and its suspend/resume/shutdown state machine
//! - `mode`: capture mode and the firmware-facing controller seam
//! - `vdev`: per-interface capture state and the producer entry points
//! - `context`: the single monitored interface
//! - `stats`: drop and delivery counters
//! - `config`: file-backed configuration

pub mod classify;
pub mod config;
pub mod context;
pub mod filter;
pub mod header;
pub mod mode;
pub mod pool;
pub mod queue;
pub mod stats;
pub mod vdev;
pub mod worker;

// Re-export commonly used types
pub use crate::{
    classify::{classify, Category, Direction, MacroCategory},
    config::{CaptureConfig, ConfigManager},
    context::MonitorContext,
    filter::{should_capture, FilterUpdate, FrameFilter},
    mode::{CaptureMode, ModeController},
    stats::{CaptureStats, StatsSnapshot},
    vdev::{CapturedFrame, FrameSink, PktCaptureVdev, SubmitOutcome},
    worker::WorkerState,
};
pub use radio802::{FrameFormat, RxStatus, TxStatus};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PktCaptureError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Frame error: {0}")]
    Frame(#[from] radio802::Radio802Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Mode controller error: {0}")]
    Controller(String),

    #[error("Interface {0} is already monitored")]
    AlreadyMonitoring(u8),

    #[error("No interface is monitored")]
    NotMonitoring,

    #[error("A frame sink is already registered")]
    AlreadyRegistered,

    #[error("Suspend rejected: {0}")]
    SuspendRejected(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Capture worker has stopped")]
    WorkerStopped,

    #[error("Delivery error: {0}")]
    Delivery(String),

    #[error("System error: {0}")]
    System(String),
}

pub type Result<T> = std::result::Result<T, PktCaptureError>;

// Constants
pub const DEFAULT_POOL_CAPACITY: usize = 4096;
pub const DEFAULT_QUEUE_CAPACITY: usize = 4096;
/// Wrapper buffer size: the largest MPDU plus radiotap and re-encapsulation headroom
pub const DEFAULT_BUFFER_SIZE: usize = 12 * 1024;
/// Noise floor used to turn relative RSSI into dBm
pub const DEFAULT_NOISE_FLOOR_DBM: i8 = -96;
pub const DEFAULT_WORKER_NAME: &str = "pkt_capture";
pub const DEFAULT_SUSPEND_TIMEOUT_MS: u64 = 1000;
pub const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 2000;

// Utility functions
pub fn init_logging() {
    let _ = env_logger::try_init();
}
