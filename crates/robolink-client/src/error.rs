//! Client error types

use robolink_core::DeviceError;
use robolink_transport::TransportError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ClientError>;

#[derive(Error, Debug)]
pub enum ClientError {
    /// Local connect retries exhausted; the cloud path may still be usable
    #[error("connection to {duid} failed after {attempts} attempts")]
    ConnectionFailed { duid: String, attempts: u32 },

    #[error("no connected transport for {0}")]
    NotConnected(String),

    /// No matching response within the request window
    #[error("request {id} to {duid} timed out")]
    RequestTimeout { duid: String, id: u32 },

    /// Operation on a device the router does not know
    #[error("device {0} is not initialized")]
    NotInitialized(String),

    #[error("{0}")]
    Device(#[from] DeviceError),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error("too many pending requests for {0}")]
    TooManyPending(String),

    /// Router shut down while the request was in flight
    #[error("request cancelled")]
    Cancelled,

    #[error("protocol error: {0}")]
    Protocol(#[from] robolink_core::Error),

    #[error("transport error: {0}")]
    Transport(TransportError),
}

impl From<TransportError> for ClientError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::ConnectionFailed { duid, attempts } => {
                ClientError::ConnectionFailed { duid, attempts }
            }
            other => ClientError::Transport(other),
        }
    }
}

impl ClientError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ClientError::RequestTimeout { .. })
    }
}
