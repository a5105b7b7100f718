//! Client router
//!
//! Owns the transports for every registered device, the pending request table and the
//! per-device session nonces. All inbound frames funnel through one dispatch task:
//! frames carrying the correlation id of a pending request resolve that request,
//! everything else goes to the registered [`MessageListener`]s.

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use robolink_core::codec::{self, FrameContext};
use robolink_core::{DeviceIdentity, RequestMessage, ResponseMessage};
use robolink_transport::{
    CloudClient, CloudConfig, ConnectionState, DeviceTransport, FrameSink, HandshakeHook,
    InboundFrame, LocalClient, LocalConfig, TransportKind,
};
use serde::de::DeserializeOwned;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::builder::RouterBuilder;
use crate::error::{ClientError, Result};
use crate::listener::{ListenerHandle, ListenerRegistry, MessageListener};
use crate::pending::PendingTable;
use crate::security::{NonceListener, NonceStore};

/// Inbound frame queue depth
const DEFAULT_FRAME_BUFFER: usize = 256;

/// Router configuration
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// How long a request waits for its response
    pub request_timeout: Duration,
    /// Settings for every local client the router creates
    pub local: LocalConfig,
    /// Cloud relay session, if the account has one
    pub cloud: Option<CloudConfig>,
    pub frame_buffer: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            local: LocalConfig::default(),
            cloud: None,
            frame_buffer: DEFAULT_FRAME_BUFFER,
        }
    }
}

/// Channel a client is registered for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientTarget {
    /// Direct connection to the device at `ip`
    Local { ip: String },
    /// The account's shared cloud relay session
    Cloud,
}

struct DeviceEntry {
    identity: DeviceIdentity,
    /// Every request goes through the cloud relay
    cloud_only: bool,
    local: Option<Arc<dyn DeviceTransport>>,
}

struct RouterInner {
    config: RouterConfig,
    devices: DashMap<String, DeviceEntry>,
    cloud: RwLock<Option<Arc<dyn DeviceTransport>>>,
    sink: FrameSink,
    pending: PendingTable,
    nonces: Arc<NonceStore>,
    listeners: ListenerRegistry,
    seq: AtomicU32,
}

/// Transport-agnostic request API over all registered devices
pub struct ClientRouter {
    inner: Arc<RouterInner>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    _nonce_listener: ListenerHandle,
}

impl ClientRouter {
    /// Create a router and start its dispatch task. Must be called inside a tokio runtime.
    pub fn new(config: RouterConfig) -> Self {
        let (sink, frames) = mpsc::channel(config.frame_buffer.max(1));

        let inner = Arc::new(RouterInner {
            config,
            devices: DashMap::new(),
            cloud: RwLock::new(None),
            sink,
            pending: PendingTable::new(),
            nonces: Arc::new(NonceStore::new()),
            listeners: ListenerRegistry::new(),
            seq: AtomicU32::new(1),
        });

        let nonce_listener = inner
            .listeners
            .register(Arc::new(NonceListener::new(inner.nonces.clone())));

        let dispatcher = tokio::spawn(run_dispatcher(Arc::downgrade(&inner), frames));

        Self {
            inner,
            dispatcher: Mutex::new(Some(dispatcher)),
            _nonce_listener: nonce_listener,
        }
    }

    /// Create a builder
    pub fn builder() -> RouterBuilder {
        RouterBuilder::new()
    }

    pub fn config(&self) -> &RouterConfig {
        &self.inner.config
    }

    // ========================================================================
    // Registration
    // ========================================================================

    /// Register a device. Returns false (and changes nothing) when already registered.
    pub fn register_device(&self, identity: DeviceIdentity, cloud_only: bool) -> bool {
        use dashmap::mapref::entry::Entry;

        match self.inner.devices.entry(identity.duid.clone()) {
            Entry::Occupied(_) => {
                debug!(duid = %identity.duid, "Device already registered");
                false
            }
            Entry::Vacant(slot) => {
                info!(duid = %identity.duid, version = %identity.version, cloud_only, "Device registered");
                slot.insert(DeviceEntry {
                    identity,
                    cloud_only,
                    local: None,
                });
                true
            }
        }
    }

    pub fn is_registered(&self, duid: &str) -> bool {
        self.inner.devices.contains_key(duid)
    }

    pub fn devices(&self) -> Vec<String> {
        self.inner.devices.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn is_cloud_only(&self, duid: &str) -> bool {
        self.inner
            .devices
            .get(duid)
            .map_or(false, |entry| entry.cloud_only)
    }

    /// Create the transport for `duid` on the given channel.
    ///
    /// A new local client replaces any previous one. The cloud session is shared by
    /// all devices and created on first use. The caller drives the returned client's
    /// connection.
    pub fn register_client(&self, duid: &str, target: ClientTarget) -> Result<Arc<dyn DeviceTransport>> {
        match target {
            ClientTarget::Local { ip } => {
                let mut entry = self
                    .inner
                    .devices
                    .get_mut(duid)
                    .ok_or_else(|| ClientError::NotInitialized(duid.to_string()))?;

                // The nonce is on record before connect() can report success
                let nonces = self.inner.nonces.clone();
                let hook: HandshakeHook = Arc::new(move |duid: &str, nonce: u64| {
                    nonces.update(duid, nonce);
                });

                let client = Arc::new(LocalClient::with_handshake_hook(
                    entry.identity.clone(),
                    &ip,
                    self.inner.config.local.clone(),
                    self.inner.sink.clone(),
                    hook,
                ));
                info!(duid, addr = %client.addr(), "Local client registered");

                let client: Arc<dyn DeviceTransport> = client;
                if entry.local.replace(client.clone()).is_some() {
                    debug!(duid, "Replacing local client");
                }
                Ok(client)
            }
            ClientTarget::Cloud => {
                if !self.is_registered(duid) {
                    return Err(ClientError::NotInitialized(duid.to_string()));
                }
                self.inner.cloud_client()
            }
        }
    }

    /// Install a transport built outside the router.
    ///
    /// A local transport replaces the device's local client; a cloud transport
    /// becomes the relay session shared by every device. Inbound frames must be
    /// delivered to [`ClientRouter::frame_sink`].
    pub fn attach_transport(&self, duid: &str, transport: Arc<dyn DeviceTransport>) -> Result<()> {
        let mut entry = self
            .inner
            .devices
            .get_mut(duid)
            .ok_or_else(|| ClientError::NotInitialized(duid.to_string()))?;

        let kind = transport.kind();
        match kind {
            TransportKind::Local => {
                entry.local = Some(transport);
            }
            TransportKind::Cloud => {
                drop(entry);
                *self.inner.cloud.write() = Some(transport);
            }
        }
        info!(duid, transport = %kind, "Transport attached");
        Ok(())
    }

    /// Where transports deliver inbound frames
    pub fn frame_sink(&self) -> FrameSink {
        self.inner.sink.clone()
    }

    // ========================================================================
    // Listeners / Security
    // ========================================================================

    /// Receive every frame not claimed by a pending request
    pub fn register_message_listener(&self, listener: Arc<dyn MessageListener>) -> ListenerHandle {
        self.inner.listeners.register(listener)
    }

    pub fn unregister_message_listener(&self, handle: ListenerHandle) {
        drop(handle);
    }

    /// Replace the session nonce for `duid`; requests already encoded are unaffected
    pub fn update_nonce(&self, duid: &str, nonce: u64) {
        self.inner.nonces.update(duid, nonce);
    }

    pub fn nonce(&self, duid: &str) -> Option<u64> {
        self.inner.nonces.get(duid)
    }

    /// Requests currently waiting for a response
    pub fn pending_requests(&self) -> usize {
        self.inner.pending.len()
    }

    // ========================================================================
    // Requests
    // ========================================================================

    /// Send a request and wait for the matching response.
    ///
    /// Fails with [`ClientError::RequestTimeout`] when nothing arrives in time; the
    /// correlation id is freed either way.
    pub async fn request(&self, duid: &str, request: RequestMessage) -> Result<ResponseMessage> {
        let (identity, cloud_only) = self.inner.device(duid)?;
        let nonce = if request.secure {
            self.inner.nonces.get(duid)
        } else {
            None
        };

        let mut reservation = self
            .inner
            .pending
            .reserve(duid)
            .ok_or_else(|| ClientError::TooManyPending(duid.to_string()))?;
        let id = reservation.id();

        let frame = codec::encode_request(&identity, nonce, self.inner.next_context(), id, &request)?;
        let via = self
            .inner
            .send_frame(duid, cloud_only || request.cloud_only, frame)
            .await?;
        debug!(duid, id, method = %request.method, transport = %via, "Request sent");

        match tokio::time::timeout(self.inner.config.request_timeout, reservation.wait()).await {
            Ok(Ok(message)) => Ok(message),
            Ok(Err(_)) => Err(ClientError::Cancelled),
            Err(_) => {
                // Free the id now so a late response reaches the listeners
                if let Some(message) = reservation.cancel() {
                    debug!(duid, id, "Response arrived as the request timed out");
                    self.inner.listeners.dispatch(&message);
                }
                warn!(duid, id, method = %request.method, "Request timed out");
                Err(ClientError::RequestTimeout {
                    duid: duid.to_string(),
                    id,
                })
            }
        }
    }

    /// Send a request and decode its result.
    ///
    /// A timeout yields `Ok(None)`; a device-reported error yields [`ClientError::Device`].
    pub async fn get<T: DeserializeOwned>(&self, duid: &str, request: RequestMessage) -> Result<Option<T>> {
        let message = match self.request(duid, request).await {
            Ok(message) => message,
            Err(e) if e.is_timeout() => return Ok(None),
            Err(e) => return Err(e),
        };

        match message.rpc_result() {
            Some(Ok(value)) => serde_json::from_value(value)
                .map(Some)
                .map_err(|e| ClientError::UnexpectedResponse(e.to_string())),
            Some(Err(device_error)) => Err(ClientError::Device(device_error)),
            None => Ok(None),
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Connect the cloud session and every local client.
    ///
    /// Local failures are logged and leave the device on the cloud path. Waits for the
    /// cloud session without an upper bound.
    pub async fn connect(&self) -> Result<()> {
        let cloud = self.inner.cloud.read().clone();
        if let Some(cloud) = &cloud {
            cloud.connect().await?;
        }

        let locals = self.inner.local_clients();
        let results = futures::future::join_all(
            locals
                .iter()
                .map(|(duid, client)| async move { (duid, client.connect().await) }),
        )
        .await;

        for (duid, result) in results {
            if let Err(e) = result {
                warn!(duid = %duid, "Local connection unavailable: {}", e);
            }
        }

        if let Some(cloud) = cloud {
            let mut state = cloud.subscribe_state();
            let _ = state
                .wait_for(|current| *current == ConnectionState::Connected)
                .await;
        }

        info!(devices = self.inner.devices.len(), "Router connected");
        Ok(())
    }

    /// Connect one device's local client, surfacing [`ClientError::ConnectionFailed`]
    pub async fn connect_device(&self, duid: &str) -> Result<()> {
        let local = self
            .inner
            .local_client(duid)
            .ok_or_else(|| ClientError::NotConnected(duid.to_string()))?;
        local.connect().await?;
        Ok(())
    }

    pub async fn disconnect(&self) -> Result<()> {
        for (duid, client) in self.inner.local_clients() {
            if let Err(e) = client.disconnect().await {
                warn!(duid = %duid, "Local disconnect failed: {}", e);
            }
        }

        let cloud = self.inner.cloud.read().clone();
        if let Some(cloud) = cloud {
            cloud.disconnect().await?;
        }

        info!("Router disconnected");
        Ok(())
    }

    /// Any managed transport is connected
    pub fn is_connected(&self) -> bool {
        self.inner
            .local_clients()
            .iter()
            .any(|(_, client)| client.is_connected())
            || self.inner.cloud_connected()
    }

    /// Some transport can currently carry requests for `duid`
    pub fn is_reachable(&self, duid: &str) -> bool {
        let Some(entry) = self.inner.devices.get(duid) else {
            return false;
        };
        let local = !entry.cloud_only
            && entry
                .local
                .as_ref()
                .map_or(false, |client| client.is_connected());
        drop(entry);

        local || self.inner.cloud_connected()
    }

    pub fn is_local_connected(&self, duid: &str) -> bool {
        self.inner
            .local_client(duid)
            .map_or(false, |client| client.is_connected())
    }

    pub fn is_cloud_connected(&self) -> bool {
        self.inner.cloud_connected()
    }

    /// Which transport a request for `duid` would currently use
    pub fn active_transport(&self, duid: &str) -> Option<TransportKind> {
        let entry = self.inner.devices.get(duid)?;
        if !entry.cloud_only
            && entry
                .local
                .as_ref()
                .map_or(false, |client| client.is_connected())
        {
            return Some(TransportKind::Local);
        }
        drop(entry);

        self.inner.cloud_connected().then_some(TransportKind::Cloud)
    }

    /// Disconnect everything, cancel pending requests and stop dispatching
    pub async fn shutdown(&self) {
        if let Err(e) = self.disconnect().await {
            warn!("Error during shutdown: {}", e);
        }
        self.inner.pending.clear();
        if let Some(task) = self.dispatcher.lock().take() {
            task.abort();
        }
        info!("Router shut down");
    }
}

impl Drop for ClientRouter {
    fn drop(&mut self) {
        if let Some(task) = self.dispatcher.lock().take() {
            task.abort();
        }
    }
}

impl RouterInner {
    fn device(&self, duid: &str) -> Result<(DeviceIdentity, bool)> {
        self.devices
            .get(duid)
            .map(|entry| (entry.identity.clone(), entry.cloud_only))
            .ok_or_else(|| ClientError::NotInitialized(duid.to_string()))
    }

    fn local_client(&self, duid: &str) -> Option<Arc<dyn DeviceTransport>> {
        self.devices.get(duid).and_then(|entry| entry.local.clone())
    }

    fn local_clients(&self) -> Vec<(String, Arc<dyn DeviceTransport>)> {
        self.devices
            .iter()
            .filter_map(|entry| {
                entry
                    .local
                    .clone()
                    .map(|client| (entry.key().clone(), client))
            })
            .collect()
    }

    fn cloud_client(&self) -> Result<Arc<dyn DeviceTransport>> {
        let mut cloud = self.cloud.write();
        if let Some(client) = cloud.as_ref() {
            return Ok(client.clone());
        }

        let config = self
            .config
            .cloud
            .clone()
            .ok_or_else(|| ClientError::InvalidArgument("cloud relay is not configured".into()))?;
        let client: Arc<dyn DeviceTransport> = Arc::new(CloudClient::new(config, self.sink.clone()));
        *cloud = Some(client.clone());
        info!("Cloud relay client created");
        Ok(client)
    }

    fn cloud_connected(&self) -> bool {
        self.cloud
            .read()
            .as_ref()
            .map_or(false, |cloud| cloud.is_connected())
    }

    fn next_context(&self) -> FrameContext {
        FrameContext::now(self.seq.fetch_add(1, Ordering::Relaxed), rand::random::<u32>())
    }

    /// Pick a transport and write the frame: the connected local client unless the
    /// cloud is required, falling back to the cloud when the local send fails.
    async fn send_frame(&self, duid: &str, cloud_required: bool, frame: Bytes) -> Result<TransportKind> {
        if !cloud_required {
            if let Some(local) = self.local_client(duid).filter(|client| client.is_connected()) {
                match local.send(duid, frame.clone()).await {
                    Ok(()) => return Ok(TransportKind::Local),
                    Err(e) => warn!(duid, "Local send failed, trying cloud: {}", e),
                }
            }
        }

        let cloud = self.cloud.read().clone();
        match cloud {
            Some(cloud) if cloud.is_connected() => {
                cloud.send(duid, frame).await?;
                Ok(TransportKind::Cloud)
            }
            _ => Err(ClientError::NotConnected(duid.to_string())),
        }
    }

    fn handle_frame(&self, frame: InboundFrame) {
        let Some(identity) = self.devices.get(&frame.duid).map(|entry| entry.identity.clone()) else {
            debug!(duid = %frame.duid, "Frame for unregistered device");
            return;
        };

        let nonce = self.nonces.get(&frame.duid);
        let message = match codec::decode(&identity, nonce, &frame.data) {
            Ok(message) => message,
            Err(e) => {
                warn!(duid = %frame.duid, transport = %frame.kind, "Dropping malformed frame: {}", e);
                return;
            }
        };

        let message = match message.correlation_id() {
            Some(id) if message.is_handshake() => {
                // The nonce listener needs the handshake even when a request claims it
                if self.pending.resolve(&frame.duid, id, message.clone()).is_none() {
                    debug!(duid = %frame.duid, id, "Response matched");
                }
                message
            }
            Some(id) => match self.pending.resolve(&frame.duid, id, message) {
                None => {
                    debug!(duid = %frame.duid, id, "Response matched");
                    return;
                }
                Some(unclaimed) => {
                    debug!(duid = %frame.duid, id, "No pending request, forwarding to listeners");
                    unclaimed
                }
            },
            None => message,
        };

        self.listeners.dispatch(&message);
    }
}

async fn run_dispatcher(inner: Weak<RouterInner>, mut frames: mpsc::Receiver<InboundFrame>) {
    while let Some(frame) = frames.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.handle_frame(frame);
    }
    debug!("Router dispatcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use robolink_core::{Protocol, ProtocolVersion};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn identity(duid: &str) -> DeviceIdentity {
        DeviceIdentity::new(duid, b"0123456789abcdef", ProtocolVersion::V1)
    }

    #[tokio::test]
    async fn test_register_device_is_idempotent() {
        let router = ClientRouter::new(RouterConfig::default());
        assert!(router.register_device(identity("d1"), false));
        assert!(!router.register_device(identity("d1"), true));
        assert!(!router.is_cloud_only("d1"));
        assert_eq!(router.devices(), vec!["d1".to_string()]);
    }

    #[tokio::test]
    async fn test_unknown_device_is_not_initialized() {
        let router = ClientRouter::new(RouterConfig::default());
        assert!(matches!(
            router.request("nope", RequestMessage::new("app_start")).await,
            Err(ClientError::NotInitialized(_))
        ));
        assert!(matches!(
            router.register_client("nope", ClientTarget::Local { ip: "127.0.0.1".into() }),
            Err(ClientError::NotInitialized(_))
        ));
    }

    #[tokio::test]
    async fn test_cloud_client_requires_config() {
        let router = ClientRouter::new(RouterConfig::default());
        router.register_device(identity("d1"), true);
        assert!(matches!(
            router.register_client("d1", ClientTarget::Cloud),
            Err(ClientError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_request_without_transport_frees_id() {
        let router = ClientRouter::new(RouterConfig::default());
        router.register_device(identity("d1"), false);

        assert!(matches!(
            router.request("d1", RequestMessage::new("app_start")).await,
            Err(ClientError::NotConnected(_))
        ));
        assert_eq!(router.pending_requests(), 0);
        assert!(!router.is_reachable("d1"));
    }

    #[tokio::test]
    async fn test_shared_cloud_client() {
        let config = RouterConfig {
            cloud: Some(CloudConfig::new("localhost", "u", "m", "p")),
            ..Default::default()
        };
        let router = ClientRouter::new(config);
        router.register_device(identity("d1"), true);
        router.register_device(identity("d2"), true);

        let a = router.register_client("d1", ClientTarget::Cloud).unwrap();
        let b = router.register_client("d2", ClientTarget::Cloud).unwrap();
        assert_eq!(a.kind(), TransportKind::Cloud);
        assert_eq!(Arc::as_ptr(&a) as *const (), Arc::as_ptr(&b) as *const ());
    }

    #[tokio::test]
    async fn test_matched_handshake_still_updates_nonce() {
        let router = ClientRouter::new(RouterConfig::default());
        router.register_device(identity("d1"), false);

        let mut reservation = router.inner.pending.reserve("d1").unwrap();
        let id = reservation.id();

        let mut dps = BTreeMap::new();
        dps.insert(Protocol::HelloResponse.key(), json!({"result": {"nonce": 7}}));
        dps.insert(Protocol::RpcResponse.key(), json!({"id": id, "result": ["ok"]}));
        let data = codec::encode_notification(
            &identity("d1"),
            FrameContext::now(1, 2),
            Protocol::HelloResponse,
            &dps,
        )
        .unwrap();

        router.inner.handle_frame(InboundFrame {
            duid: "d1".into(),
            kind: TransportKind::Local,
            data,
        });

        assert_eq!(router.nonce("d1"), Some(7));
        let message = reservation.wait().await.unwrap();
        assert_eq!(message.correlation_id(), Some(id));
        assert!(router.inner.pending.is_empty());
    }

    #[tokio::test]
    async fn test_attached_cloud_replaces_configured_session() {
        let config = RouterConfig {
            cloud: Some(CloudConfig::new("localhost", "u", "m", "p")),
            ..Default::default()
        };
        let router = ClientRouter::new(config);
        router.register_device(identity("d1"), true);

        let (sink, _rx) = mpsc::channel(1);
        let custom: Arc<dyn DeviceTransport> =
            Arc::new(CloudClient::new(CloudConfig::new("relay.local", "u", "m", "p"), sink));
        router.attach_transport("d1", custom.clone()).unwrap();

        let registered = router.register_client("d1", ClientTarget::Cloud).unwrap();
        assert_eq!(Arc::as_ptr(&registered) as *const (), Arc::as_ptr(&custom) as *const ());
    }
}
