//! Error types for the gemsched library

use std::io;
use thiserror::Error;

/// Main error type for gemsched operations
#[derive(Error, Debug)]
pub enum GemError {
    /// Object handle is unknown, stale, or listed twice in one batch
    #[error("Invalid object handle: {0}")]
    InvalidHandle(u32),

    /// Client id does not name an open session
    #[error("Unknown or closed client: {0}")]
    UnknownClient(u32),

    /// Conflicting or illegal GPU memory-domain request
    #[error("Invalid domain: {0}")]
    InvalidDomain(String),

    /// Malformed argument (alignment, bounds, flags)
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Address space or fence registers exhausted after eviction
    #[error("No space left in address space")]
    NoSpace,

    /// Admission denied or operation would block; retry later
    #[error("Operation would block")]
    WouldBlock,

    /// Binding is still referenced by an unretired request
    #[error("Binding is still active")]
    StillActive,

    /// Wait deadline expired; the request is still in flight
    #[error("Timed out waiting for GPU")]
    Timeout,

    /// Device requires a reset; in-flight work did not happen
    #[error("GPU is wedged")]
    Wedged,

    /// Reset failed; device is permanently disabled
    #[error("GPU reset failed, device disabled")]
    ResetFailed,

    /// Invalid configuration value or control key
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error while loading or storing configuration
    #[error("I/O error: {0}")]
    Io(io::Error),
}

impl From<io::Error> for GemError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut => GemError::Timeout,
            io::ErrorKind::WouldBlock => GemError::WouldBlock,
            _ => GemError::Io(err),
        }
    }
}

impl GemError {
    /// Whether the caller may legitimately retry the same operation later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GemError::WouldBlock | GemError::NoSpace | GemError::Wedged | GemError::Timeout
        )
    }

    /// Whether this error stems from bad caller input
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            GemError::InvalidHandle(_)
                | GemError::UnknownClient(_)
                | GemError::InvalidDomain(_)
                | GemError::InvalidArgument(_)
        )
    }
}

/// Result type for gemsched operations
pub type GemResult<T> = std::result::Result<T, GemError>;
