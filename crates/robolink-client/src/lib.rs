//! Robolink Client Library
//!
//! Transport-agnostic request API for robot vacuum devices.
//!
//! # Example
//!
//! ```ignore
//! use robolink_client::{ClientRouter, ClientTarget, MessageProcessor};
//! use robolink_core::{DeviceIdentity, ProtocolVersion};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let router = Arc::new(ClientRouter::builder().build());
//!
//!     let identity = DeviceIdentity::new("1UCy3RAdDGNLFs", b"qWKYcdQWrbm9hPqe", ProtocolVersion::V1);
//!     router.register_device(identity, false);
//!     router.register_client("1UCy3RAdDGNLFs", ClientTarget::Local { ip: "192.168.1.40".into() })?;
//!     router.connect().await?;
//!
//!     let vacuum = MessageProcessor::new(router.clone(), "1UCy3RAdDGNLFs")?;
//!     vacuum.on_battery(|duid, level| println!("{} battery {}%", duid, level));
//!     vacuum.start_room_clean(&[16, 17], 1).await?;
//!
//!     Ok(())
//! }
//! ```

pub mod builder;
pub mod error;
pub mod listener;
pub mod pending;
pub mod processor;
pub mod router;
pub mod security;
pub mod status;

pub use builder::RouterBuilder;
pub use error::{ClientError, Result};
pub use listener::{ListenerHandle, MessageListener};
pub use processor::MessageProcessor;
pub use router::{ClientRouter, ClientTarget, RouterConfig};
pub use status::{CleanMode, DeviceStatus, NetworkInfo, RoomMapping};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::error::{ClientError, Result};
    pub use crate::processor::MessageProcessor;
    pub use crate::router::{ClientRouter, ClientTarget};
    pub use robolink_core::{DeviceIdentity, ProtocolVersion, RequestMessage};
}
