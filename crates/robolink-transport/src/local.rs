//! Local TCP transport
//!
//! Direct connection to a device on the local network. Frames are length-prefixed:
//! each frame is preceded by a 4-byte big-endian length.
//!
//! A connection counts as established once the device has answered the hello
//! handshake. `connect()` retries a bounded number of times and then gives up with
//! [`TransportError::ConnectionFailed`].

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use robolink_core::codec::{self, FrameContext};
use robolink_core::frame::MAX_FRAME_SIZE;
use robolink_core::{DeviceIdentity, Frame, Protocol, DEFAULT_LOCAL_PORT};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{Result, TransportError};
use crate::state::StateWatch;
use crate::traits::{
    ConnectionState, DeviceTransport, FrameSink, HandshakeHook, InboundFrame, TransportKind,
};

/// Largest frame a device can legally send
const MAX_MESSAGE_SIZE: usize = MAX_FRAME_SIZE;

/// Outgoing queue depth per connection
const DEFAULT_CHANNEL_BUFFER_SIZE: usize = 100;

/// Local connection configuration
#[derive(Debug, Clone)]
pub struct LocalConfig {
    /// Device TCP port
    pub port: u16,
    /// Handshake attempts before giving up
    pub connect_attempts: u32,
    /// Spacing between attempts, also the per-attempt handshake wait
    pub retry_interval: Duration,
    /// Ping interval while connected (zero disables)
    pub keepalive: Duration,
    /// Delay before reconnecting after an unexpected drop
    pub reconnect_delay: Duration,
    /// Reconnect after unexpected drops
    pub auto_reconnect: bool,
    /// Maximum frame size in bytes
    pub max_message_size: usize,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_LOCAL_PORT,
            connect_attempts: 20,
            retry_interval: Duration::from_millis(500),
            keepalive: Duration::from_secs(10),
            reconnect_delay: Duration::from_secs(5),
            auto_reconnect: true,
            max_message_size: MAX_MESSAGE_SIZE,
        }
    }
}

/// Local client for one device
pub struct LocalClient {
    inner: Arc<LocalInner>,
}

struct LocalInner {
    identity: DeviceIdentity,
    addr: String,
    config: LocalConfig,
    sink: FrameSink,
    handshake: Option<HandshakeHook>,
    state: Arc<StateWatch>,
    seq: Arc<AtomicU32>,
    /// Cleared by an explicit disconnect; stops the reconnect supervisor
    wanted: AtomicBool,
    link: Mutex<Option<Link>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

/// One open socket and its io task
struct Link {
    tx: mpsc::Sender<Bytes>,
    task: JoinHandle<()>,
}

impl Link {
    fn is_open(&self) -> bool {
        !self.task.is_finished() && !self.tx.is_closed()
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl LocalClient {
    pub fn new(identity: DeviceIdentity, ip: &str, config: LocalConfig, sink: FrameSink) -> Self {
        Self::build(identity, ip, config, sink, None)
    }

    /// Like [`LocalClient::new`], reporting each handshake nonce to `hook` before
    /// the client counts as connected
    pub fn with_handshake_hook(
        identity: DeviceIdentity,
        ip: &str,
        config: LocalConfig,
        sink: FrameSink,
        hook: HandshakeHook,
    ) -> Self {
        Self::build(identity, ip, config, sink, Some(hook))
    }

    fn build(
        identity: DeviceIdentity,
        ip: &str,
        config: LocalConfig,
        sink: FrameSink,
        handshake: Option<HandshakeHook>,
    ) -> Self {
        let addr = format!("{}:{}", ip, config.port);
        Self {
            inner: Arc::new(LocalInner {
                identity,
                addr,
                config,
                sink,
                handshake,
                state: Arc::new(StateWatch::new()),
                seq: Arc::new(AtomicU32::new(1)),
                wanted: AtomicBool::new(false),
                link: Mutex::new(None),
                supervisor: Mutex::new(None),
            }),
        }
    }

    pub fn duid(&self) -> &str {
        &self.inner.identity.duid
    }

    pub fn addr(&self) -> &str {
        &self.inner.addr
    }
}

impl LocalInner {
    fn next_context(&self) -> FrameContext {
        FrameContext::now(self.seq.fetch_add(1, Ordering::Relaxed), rand::random::<u32>())
    }

    fn open_sender(&self) -> Option<mpsc::Sender<Bytes>> {
        self.link
            .lock()
            .as_ref()
            .filter(|link| link.is_open())
            .map(|link| link.tx.clone())
    }

    async fn open_socket(&self) -> Result<()> {
        let stream = tokio::time::timeout(self.config.retry_interval, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| TransportError::Timeout)??;

        let socket = socket2::SockRef::from(&stream);
        let keepalive = socket2::TcpKeepalive::new().with_time(Duration::from_secs(30));
        let _ = socket.set_tcp_keepalive(&keepalive);
        let _ = stream.set_nodelay(true);

        let (outgoing_tx, outgoing_rx) = mpsc::channel::<Bytes>(DEFAULT_CHANNEL_BUFFER_SIZE);
        let io = IoContext {
            identity: self.identity.clone(),
            sink: self.sink.clone(),
            handshake: self.handshake.clone(),
            state: self.state.clone(),
            seq: self.seq.clone(),
            keepalive: self.config.keepalive,
            max_size: self.config.max_message_size,
        };

        let task = tokio::spawn(async move {
            let (reader, writer) = stream.into_split();
            run_local_io_loop(reader, writer, outgoing_rx, io).await;
        });

        debug!(duid = %self.identity.duid, addr = %self.addr, "TCP socket open");
        *self.link.lock() = Some(Link {
            tx: outgoing_tx,
            task,
        });
        Ok(())
    }

    /// Bounded connect: open socket, say hello, wait one interval for the answer
    async fn connect_bounded(&self) -> Result<()> {
        let attempts = self.config.connect_attempts.max(1);
        let interval = self.config.retry_interval;
        let mut state_rx = self.state.subscribe();

        self.state.set(ConnectionState::Connecting);
        info!(duid = %self.identity.duid, addr = %self.addr, "Connecting to device");

        for attempt in 1..=attempts {
            if self.open_sender().is_none() {
                if let Err(e) = self.open_socket().await {
                    debug!(duid = %self.identity.duid, attempt, "Socket open failed: {}", e);
                    tokio::time::sleep(interval).await;
                    continue;
                }
            }

            let hello = codec::encode_hello(&self.identity, self.next_context())?;
            if let Some(tx) = self.open_sender() {
                if tx.send(hello).await.is_err() {
                    debug!(duid = %self.identity.duid, attempt, "Socket closed before hello");
                    tokio::time::sleep(interval).await;
                    continue;
                }
            }

            let answered = matches!(
                tokio::time::timeout(
                    interval,
                    state_rx.wait_for(|state| *state == ConnectionState::Connected),
                )
                .await,
                Ok(Ok(_))
            );

            if answered {
                info!(duid = %self.identity.duid, attempt, "Device connected");
                return Ok(());
            }

            debug!(duid = %self.identity.duid, attempt, "No handshake answer yet");
            if self.state.get() == ConnectionState::Disconnected {
                self.state.set(ConnectionState::Connecting);
            }
        }

        self.link.lock().take();
        self.state.set(ConnectionState::Disconnected);
        warn!(duid = %self.identity.duid, attempts, "Giving up on local connection");

        Err(TransportError::ConnectionFailed {
            duid: self.identity.duid.clone(),
            attempts,
        })
    }
}

/// Reconnect after unexpected drops until an explicit disconnect
async fn supervise(inner: Arc<LocalInner>) {
    let mut state_rx = inner.state.subscribe();

    loop {
        if state_rx
            .wait_for(|state| *state == ConnectionState::Disconnected)
            .await
            .is_err()
        {
            break;
        }

        if !inner.wanted.load(Ordering::SeqCst) {
            break;
        }

        warn!(
            duid = %inner.identity.duid,
            delay_ms = inner.config.reconnect_delay.as_millis() as u64,
            "Local connection lost, reconnecting"
        );
        tokio::time::sleep(inner.config.reconnect_delay).await;

        if !inner.wanted.load(Ordering::SeqCst) {
            break;
        }

        if let Err(e) = inner.connect_bounded().await {
            error!(duid = %inner.identity.duid, "Reconnect failed: {}", e);
        }
    }
}

#[async_trait]
impl DeviceTransport for LocalClient {
    fn kind(&self) -> TransportKind {
        TransportKind::Local
    }

    async fn connect(&self) -> Result<()> {
        if self.inner.state.get() == ConnectionState::Connected {
            return Ok(());
        }

        self.inner.wanted.store(true, Ordering::SeqCst);
        let result = self.inner.connect_bounded().await;

        if result.is_ok() && self.inner.config.auto_reconnect {
            let mut supervisor = self.inner.supervisor.lock();
            if supervisor.as_ref().map_or(true, |task| task.is_finished()) {
                *supervisor = Some(tokio::spawn(supervise(self.inner.clone())));
            }
        }

        result
    }

    async fn disconnect(&self) -> Result<()> {
        self.inner.wanted.store(false, Ordering::SeqCst);
        if let Some(task) = self.inner.supervisor.lock().take() {
            task.abort();
        }
        self.inner.link.lock().take();
        self.inner.state.set(ConnectionState::Disconnected);

        info!(duid = %self.inner.identity.duid, "Local client disconnected");
        Ok(())
    }

    fn state(&self) -> ConnectionState {
        self.inner.state.get()
    }

    fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    async fn send(&self, duid: &str, frame: Bytes) -> Result<()> {
        if duid != self.inner.identity.duid {
            return Err(TransportError::WrongDevice {
                requested: duid.to_string(),
                owner: self.inner.identity.duid.clone(),
            });
        }

        if self.inner.state.get() != ConnectionState::Connected {
            return Err(TransportError::NotConnected);
        }

        let tx = self.inner.open_sender().ok_or(TransportError::NotConnected)?;
        tx.send(frame)
            .await
            .map_err(|_| TransportError::SendFailed("Channel closed".into()))
    }
}

impl Drop for LocalClient {
    fn drop(&mut self) {
        if let Some(task) = self.inner.supervisor.lock().take() {
            task.abort();
        }
        self.inner.link.lock().take();
    }
}

/// Everything the io loop needs besides the socket halves
struct IoContext {
    identity: DeviceIdentity,
    sink: FrameSink,
    handshake: Option<HandshakeHook>,
    state: Arc<StateWatch>,
    seq: Arc<AtomicU32>,
    keepalive: Duration,
    max_size: usize,
}

impl IoContext {
    /// Flip to connected when an authentic hello answer goes by. The nonce reaches
    /// the hook first, so nobody sees `Connected` without it.
    fn observe_handshake(&self, data: &[u8]) {
        if Frame::peek_protocol(data) != Some(Protocol::HelloResponse.code()) {
            return;
        }

        let message = match codec::decode(&self.identity, None, data) {
            Ok(message) => message,
            Err(e) => {
                warn!(duid = %self.identity.duid, "Dropping bad hello answer: {}", e);
                return;
            }
        };

        match (message.handshake_nonce(), &self.handshake) {
            (Some(nonce), Some(hook)) => hook(&self.identity.duid, nonce),
            (None, _) => warn!(duid = %self.identity.duid, "Hello answer without nonce"),
            _ => {}
        }

        if self.state.set(ConnectionState::Connected) != ConnectionState::Connected {
            debug!(duid = %self.identity.duid, "Handshake answered");
        }
    }

    fn ping(&self) -> Option<Bytes> {
        let ctx = FrameContext::now(self.seq.fetch_add(1, Ordering::Relaxed), rand::random::<u32>());
        codec::encode_ping(&self.identity, ctx).ok()
    }
}

async fn write_frame(writer: &mut OwnedWriteHalf, data: &[u8]) -> std::io::Result<()> {
    let mut frame = BytesMut::with_capacity(4 + data.len());
    frame.put_u32(data.len() as u32);
    frame.extend_from_slice(data);
    writer.write_all(&frame).await
}

async fn run_local_io_loop(
    mut reader: OwnedReadHalf,
    mut writer: OwnedWriteHalf,
    mut outgoing_rx: mpsc::Receiver<Bytes>,
    io: IoContext,
) {
    let mut read_buf = BytesMut::with_capacity(8192);
    let keepalive_enabled = !io.keepalive.is_zero();
    let mut keepalive = tokio::time::interval(if keepalive_enabled {
        io.keepalive
    } else {
        Duration::from_secs(3600)
    });
    keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    keepalive.tick().await;

    'io: loop {
        tokio::select! {
            outgoing = outgoing_rx.recv() => {
                let Some(data) = outgoing else {
                    debug!(duid = %io.identity.duid, "Outgoing queue closed");
                    break;
                };
                if let Err(e) = write_frame(&mut writer, &data).await {
                    error!(duid = %io.identity.duid, "TCP write error: {}", e);
                    break;
                }
            }

            _ = keepalive.tick(), if keepalive_enabled => {
                if io.state.get() != ConnectionState::Connected {
                    continue;
                }
                if let Some(ping) = io.ping() {
                    if let Err(e) = write_frame(&mut writer, &ping).await {
                        error!(duid = %io.identity.duid, "TCP keepalive write error: {}", e);
                        break;
                    }
                }
            }

            result = reader.read_buf(&mut read_buf) => {
                match result {
                    Ok(0) => {
                        debug!(duid = %io.identity.duid, "TCP connection closed by device");
                        break;
                    }
                    Ok(_) => {
                        while read_buf.len() >= 4 {
                            let len = (&read_buf[..4]).get_u32() as usize;

                            if len > io.max_size {
                                error!(duid = %io.identity.duid, "Frame too large: {} > {}", len, io.max_size);
                                break 'io;
                            }

                            if read_buf.len() < 4 + len {
                                break;
                            }

                            read_buf.advance(4);
                            let data = read_buf.split_to(len).freeze();
                            io.observe_handshake(&data);

                            let frame = InboundFrame {
                                duid: io.identity.duid.clone(),
                                kind: TransportKind::Local,
                                data,
                            };
                            if io.sink.send(frame).await.is_err() {
                                debug!(duid = %io.identity.duid, "Frame sink closed");
                                break 'io;
                            }
                        }
                    }
                    Err(e) => {
                        error!(duid = %io.identity.duid, "TCP read error: {}", e);
                        break;
                    }
                }
            }
        }
    }

    io.state.set(ConnectionState::Disconnected);
}
