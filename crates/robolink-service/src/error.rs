//! Service error types

use robolink_client::ClientError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ServiceError>;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("config error: {0}")]
    Config(String),

    #[error("failed to parse config: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("scene invocation failed: {0}")]
    Scene(String),

    #[error(transparent)]
    Client(#[from] ClientError),
}
