//! Error types for the intercom application

use thiserror::Error;

/// Main error type for the application
#[derive(Error, Debug)]
pub enum Error {
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Link error: {0}")]
    Link(#[from] LinkError),

    #[error("Clip error: {0}")]
    Clip(#[from] ClipError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Audio device errors
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("Device init failed: {0}")]
    InitFailed(String),

    #[error("Capture permission denied")]
    PermissionDenied,

    #[error("Device state failure: {0}")]
    StateFailure(String),

    #[error("Device not found: {0}")]
    NotFound(String),
}

/// Network link errors
#[derive(Error, Debug)]
pub enum LinkError {
    #[error("Connect timed out after {timeout_ms} ms: {addr}")]
    ConnectTimeout { addr: String, timeout_ms: u64 },

    #[error("Connect failed: {addr}: {reason}")]
    ConnectFailed { addr: String, reason: String },

    #[error("Invalid endpoint address: {0}")]
    InvalidAddress(String),

    #[error("Stream IO failed: {0}")]
    Stream(#[from] std::io::Error),
}

/// Clip playback errors
#[derive(Error, Debug)]
pub enum ClipError {
    #[error("Clip resource missing: {0}")]
    ResourceMissing(String),

    #[error("Clip stream IO failed: {0}")]
    Stream(#[from] std::io::Error),
}

/// Result type alias for the application
pub type Result<T> = std::result::Result<T, Error>;
