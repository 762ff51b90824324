//! Engine error types

use thiserror::Error;

/// Errors that can occur during engine operations
#[derive(Error, Debug)]
pub enum EngineError {
    /// An argument was out of range or inconsistent with engine state
    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),

    /// A required pre-allocation failed
    #[error("out of memory: {0}")]
    OutOfMemory(&'static str),

    /// The operation is not supported by this source or filter
    #[error("not implemented: {0}")]
    NotImplemented(&'static str),

    /// A streaming reader reported a failure
    #[error("audio stream error: {0}")]
    StreamError(String),

    /// No audio devices available
    #[error("no audio output devices found")]
    NoDevices,

    /// Failed to get device configuration
    #[error("failed to get device config: {0}")]
    ConfigError(String),

    /// Failed to build audio stream
    #[error("failed to build audio stream: {0}")]
    StreamBuildError(String),

    /// Failed to start/play stream
    #[error("failed to start audio stream: {0}")]
    StreamPlayError(String),

    /// Unsupported device sample format
    #[error("unsupported sample format: {0}")]
    UnsupportedFormat(String),
}

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;
