//! Transport error types

use thiserror::Error;

pub type Result<T> = std::result::Result<T, TransportError>;

#[derive(Error, Debug)]
pub enum TransportError {
    /// Bounded local connect policy exhausted
    #[error("connection to {duid} failed after {attempts} attempts")]
    ConnectionFailed { duid: String, attempts: u32 },

    #[error("connection closed")]
    ConnectionClosed,

    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("timeout")]
    Timeout,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("mqtt error: {0}")]
    Mqtt(String),

    #[error("not connected")]
    NotConnected,

    #[error("frame for {requested} sent on transport of {owner}")]
    WrongDevice { requested: String, owner: String },

    #[error("protocol error: {0}")]
    Protocol(#[from] robolink_core::Error),
}

impl From<rumqttc::ClientError> for TransportError {
    fn from(e: rumqttc::ClientError) -> Self {
        TransportError::Mqtt(e.to_string())
    }
}
