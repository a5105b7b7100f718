//! Error types for robolink-core

use thiserror::Error;

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types
#[derive(Error, Debug)]
pub enum Error {
    /// Inbound frame could not be parsed, authenticated or decrypted.
    /// Such frames are dropped by the caller and never surface as a command failure.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// Frame payload too large
    #[error("payload too large: {0} bytes (max 65535)")]
    PayloadTooLarge(usize),

    /// Unknown protocol version tag
    #[error("unknown protocol version: {0:?}")]
    UnknownVersion(String),

    /// Payload sealing failed
    #[error("encryption failed: {0}")]
    Encryption(String),

    /// JSON encoding error
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        Error::MalformedFrame(reason.into())
    }

    /// True for decode-side failures that should be dropped and logged
    pub fn is_malformed(&self) -> bool {
        matches!(self, Error::MalformedFrame(_) | Error::UnknownVersion(_))
    }
}
