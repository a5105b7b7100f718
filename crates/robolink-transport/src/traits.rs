//! Transport trait definitions

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

use crate::error::Result;

/// Which channel a transport talks over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Local,
    Cloud,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Local => f.write_str("local"),
            TransportKind::Cloud => f.write_str("cloud"),
        }
    }
}

/// Connection lifecycle: `Disconnected → Connecting → Connected → Disconnected`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// A raw frame received from a device
#[derive(Debug, Clone)]
pub struct InboundFrame {
    pub duid: String,
    pub kind: TransportKind,
    pub data: Bytes,
}

/// Observer every transport forwards its inbound frames to
pub type FrameSink = mpsc::Sender<InboundFrame>;

/// Called with `(duid, nonce)` for every authentic handshake answer, before the
/// transport reports itself connected
pub type HandshakeHook = Arc<dyn Fn(&str, u64) + Send + Sync>;

/// Capability set shared by the local and cloud clients
#[async_trait]
pub trait DeviceTransport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Establish the connection
    async fn connect(&self) -> Result<()>;

    /// Tear the connection down; no automatic reconnect follows
    async fn disconnect(&self) -> Result<()>;

    fn state(&self) -> ConnectionState;

    fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Watch connection state changes
    fn subscribe_state(&self) -> watch::Receiver<ConnectionState>;

    /// Write one encoded frame addressed to `duid`
    async fn send(&self, duid: &str, frame: Bytes) -> Result<()>;
}
