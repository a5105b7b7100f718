//! Robolink Transport Layer
//!
//! Two interchangeable ways of reaching a device:
//! - [`LocalClient`]: direct TCP connection on the local network, one per device
//! - [`CloudClient`]: MQTT relay session shared by every device on the account
//!
//! Both implement [`DeviceTransport`] and push raw inbound frames into the
//! [`FrameSink`] they were created with.

pub mod cloud;
pub mod error;
pub mod local;
pub mod state;
pub mod traits;

pub use cloud::{CloudClient, CloudConfig};
pub use error::{Result, TransportError};
pub use local::{LocalClient, LocalConfig};
pub use state::StateWatch;
pub use traits::{
    ConnectionState, DeviceTransport, FrameSink, HandshakeHook, InboundFrame, TransportKind,
};
