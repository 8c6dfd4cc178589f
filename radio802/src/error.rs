//! Error types for Radio802

use thiserror::Error;

/// Errors raised while parsing or building frames
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Radio802Error {
    #[error("Frame too short: need {needed} bytes, have {actual}")]
    Truncated { needed: usize, actual: usize },

    #[error("Radiotap error: {message}")]
    Radiotap { message: String },

    #[error("Unsupported frame: {message}")]
    Unsupported { message: String },

    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },
}

/// Result type alias for Radio802 operations
pub type Result<T> = std::result::Result<T, Radio802Error>;
