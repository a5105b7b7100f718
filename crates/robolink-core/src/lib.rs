//! Robolink Core
//!
//! Wire-level building blocks shared by every robolink crate:
//! - Frame layout and integrity tag ([`Frame`])
//! - Data-point codes and protocol version tags ([`Protocol`], [`ProtocolVersion`])
//! - Request / response messages ([`RequestMessage`], [`ResponseMessage`])
//! - Payload encoding for both directions ([`codec`])
//! - Session encryption bound to the handshake nonce ([`crypto`])
//!
//! Nothing in this crate performs I/O.

pub mod codec;
pub mod crypto;
pub mod device;
pub mod error;
pub mod frame;
pub mod message;
pub mod protocol;

pub use device::{DeviceIdentity, DeviceRecord};
pub use error::{Error, Result};
pub use frame::{Frame, FrameHeader};
pub use message::{DeviceError, RequestMessage, ResponseMessage};
pub use protocol::{Protocol, ProtocolVersion};

/// TCP port devices listen on for local connections
pub const DEFAULT_LOCAL_PORT: u16 = 58867;

/// Lowest correlation id handed out for RPC requests
pub const MIN_REQUEST_ID: u32 = 10_000;

/// Highest correlation id handed out for RPC requests
pub const MAX_REQUEST_ID: u32 = 32_767;
