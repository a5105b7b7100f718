//! Scripted device speaking the local wire protocol
//!
//! Listens on an ephemeral loopback port, answers the hello handshake with a fixed
//! nonce, answers pings, and replies to RPC requests from a per-method script.
//! Everything it receives is recorded for assertions.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use robolink_core::codec::{self, FrameContext};
use robolink_core::{DeviceIdentity, Protocol};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::{wait_for_count, DEFAULT_CHECK_INTERVAL};

/// How the device answers a method
#[derive(Debug, Clone)]
pub enum Reply {
    /// `{"result": value}`
    Result(Value),
    /// `{"error": {"code", "message"}}`
    Error { code: i64, message: String },
    /// Never answer
    Silent,
    /// Answer after a delay
    Delayed(Duration, Box<Reply>),
}

impl Reply {
    pub fn ok(value: Value) -> Self {
        Reply::Result(value)
    }

    pub fn after(self, delay: Duration) -> Self {
        Reply::Delayed(delay, Box::new(self))
    }

    fn body(&self) -> Option<Value> {
        match self {
            Reply::Result(value) => Some(json!({"result": value})),
            Reply::Error { code, message } => {
                Some(json!({"error": {"code": code, "message": message}}))
            }
            Reply::Silent => None,
            Reply::Delayed(_, inner) => inner.body(),
        }
    }

    fn delay(&self) -> Duration {
        match self {
            Reply::Delayed(delay, inner) => *delay + inner.delay(),
            _ => Duration::ZERO,
        }
    }
}

/// An RPC request as the device saw it
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedRequest {
    pub id: Option<u32>,
    pub method: String,
    pub params: Value,
    /// Payload arrived sealed with the session key
    pub encrypted: bool,
}

struct Client {
    tx: mpsc::UnboundedSender<Bytes>,
    kill: Arc<Notify>,
}

struct Shared {
    identity: DeviceIdentity,
    nonce: u64,
    hello_enabled: AtomicBool,
    replies: Mutex<HashMap<String, Reply>>,
    requests: Mutex<Vec<ReceivedRequest>>,
    request_count: AtomicU32,
    hello_count: AtomicU32,
    rejected_count: AtomicU32,
    clients: Mutex<Vec<Client>>,
    seq: AtomicU32,
}

impl Shared {
    fn context(&self) -> FrameContext {
        FrameContext::now(self.seq.fetch_add(1, Ordering::Relaxed), rand::random::<u32>())
    }

    fn hello_answer(&self) -> Option<Bytes> {
        let mut dps = BTreeMap::new();
        dps.insert(
            Protocol::HelloResponse.key(),
            json!({"result": {"nonce": self.nonce}}),
        );
        codec::encode_notification(&self.identity, self.context(), Protocol::HelloResponse, &dps).ok()
    }

    fn ping_answer(&self) -> Option<Bytes> {
        let mut dps = BTreeMap::new();
        dps.insert(Protocol::PingResponse.key(), json!({}));
        codec::encode_notification(&self.identity, self.context(), Protocol::PingResponse, &dps).ok()
    }

    fn response(&self, id: u32, sealed: bool, body: Value) -> Option<Bytes> {
        let nonce = sealed.then_some(self.nonce);
        codec::encode_response(&self.identity, nonce, self.context(), id, body).ok()
    }

    fn broadcast(&self, data: Bytes) -> usize {
        let mut clients = self.clients.lock();
        clients.retain(|client| !client.tx.is_closed());
        for client in clients.iter() {
            let _ = client.tx.send(data.clone());
        }
        clients.len()
    }
}

/// A fake device that cleans up on drop
pub struct FakeDevice {
    port: u16,
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl FakeDevice {
    /// Start with a random session nonce
    pub async fn start(identity: DeviceIdentity) -> Self {
        Self::start_with_nonce(identity, rand::random::<u32>() as u64).await
    }

    pub async fn start_with_nonce(identity: DeviceIdentity, nonce: u64) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let shared = Arc::new(Shared {
            identity,
            nonce,
            hello_enabled: AtomicBool::new(true),
            replies: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
            request_count: AtomicU32::new(0),
            hello_count: AtomicU32::new(0),
            rejected_count: AtomicU32::new(0),
            clients: Mutex::new(Vec::new()),
            seq: AtomicU32::new(1),
        });

        let accept_shared = shared.clone();
        let handle = tokio::spawn(async move {
            while let Ok((stream, peer)) = listener.accept().await {
                debug!("Fake device accepted {}", peer);
                let (tx, rx) = mpsc::unbounded_channel();
                let kill = Arc::new(Notify::new());
                accept_shared.clients.lock().push(Client {
                    tx: tx.clone(),
                    kill: kill.clone(),
                });
                tokio::spawn(serve_connection(stream, accept_shared.clone(), tx, rx, kill));
            }
        });

        Self {
            port,
            shared,
            handle: Some(handle),
        }
    }

    pub fn ip(&self) -> &'static str {
        "127.0.0.1"
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.shared.identity
    }

    pub fn nonce(&self) -> u64 {
        self.shared.nonce
    }

    /// Script the answer for `method`. Unscripted methods answer `["ok"]`.
    pub fn on(&self, method: &str, reply: Reply) {
        self.shared.replies.lock().insert(method.to_string(), reply);
    }

    /// Stop (or resume) answering the hello handshake
    pub fn set_hello_enabled(&self, enabled: bool) {
        self.shared.hello_enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn requests(&self) -> Vec<ReceivedRequest> {
        self.shared.requests.lock().clone()
    }

    pub fn requests_for(&self, method: &str) -> Vec<ReceivedRequest> {
        self.shared
            .requests
            .lock()
            .iter()
            .filter(|req| req.method == method)
            .cloned()
            .collect()
    }

    pub fn request_count(&self) -> u32 {
        self.shared.request_count.load(Ordering::SeqCst)
    }

    pub fn hello_count(&self) -> u32 {
        self.shared.hello_count.load(Ordering::SeqCst)
    }

    /// Frames the device could not decode
    pub fn rejected_count(&self) -> u32 {
        self.shared.rejected_count.load(Ordering::SeqCst)
    }

    pub async fn wait_for_requests(&self, n: u32, max_wait: Duration) -> bool {
        wait_for_count(&self.shared.request_count, n, max_wait).await
    }

    pub async fn wait_for_clients(&self, n: usize, max_wait: Duration) -> bool {
        crate::wait_for(
            || async { self.client_count() >= n },
            DEFAULT_CHECK_INTERVAL,
            max_wait,
        )
        .await
    }

    pub fn client_count(&self) -> usize {
        let mut clients = self.shared.clients.lock();
        clients.retain(|client| !client.tx.is_closed());
        clients.len()
    }

    /// Push an unsolicited frame to every connected client
    pub fn push(&self, dps: BTreeMap<u32, Value>) -> usize {
        match codec::encode_notification(
            &self.shared.identity,
            self.shared.context(),
            Protocol::RpcResponse,
            &dps,
        ) {
            Ok(data) => self.shared.broadcast(data),
            Err(e) => {
                warn!("Fake device could not encode push: {}", e);
                0
            }
        }
    }

    /// Send an RPC response nobody asked for (or that arrives too late)
    pub fn respond(&self, id: u32, result: Value) -> usize {
        match self.shared.response(id, false, json!({"result": result})) {
            Some(data) => self.shared.broadcast(data),
            None => 0,
        }
    }

    /// Send raw bytes as one frame
    pub fn push_raw(&self, data: Bytes) -> usize {
        self.shared.broadcast(data)
    }

    /// Close every open connection
    pub fn drop_clients(&self) {
        for client in self.shared.clients.lock().drain(..) {
            client.kill.notify_one();
        }
    }

    /// Stop accepting and close every connection (also happens on drop)
    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
        self.drop_clients();
    }
}

impl Drop for FakeDevice {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn serve_connection(
    stream: TcpStream,
    shared: Arc<Shared>,
    tx: mpsc::UnboundedSender<Bytes>,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    kill: Arc<Notify>,
) {
    let (mut reader, mut writer) = stream.into_split();
    let mut read_buf = BytesMut::with_capacity(4096);

    'conn: loop {
        tokio::select! {
            _ = kill.notified() => break,

            outgoing = rx.recv() => {
                let Some(data) = outgoing else { break };
                let mut frame = BytesMut::with_capacity(4 + data.len());
                frame.put_u32(data.len() as u32);
                frame.extend_from_slice(&data);
                if writer.write_all(&frame).await.is_err() {
                    break;
                }
            }

            result = reader.read_buf(&mut read_buf) => {
                match result {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {
                        while read_buf.len() >= 4 {
                            let len = (&read_buf[..4]).get_u32() as usize;
                            if read_buf.len() < 4 + len {
                                break;
                            }
                            read_buf.advance(4);
                            let data = read_buf.split_to(len).freeze();
                            if !handle_frame(&shared, &tx, &data) {
                                break 'conn;
                            }
                        }
                    }
                }
            }
        }
    }
}

/// Returns false when the connection should close
fn handle_frame(shared: &Arc<Shared>, tx: &mpsc::UnboundedSender<Bytes>, data: &[u8]) -> bool {
    let request = match codec::decode_request(&shared.identity, Some(shared.nonce), data) {
        Ok(request) => request,
        Err(e) => {
            debug!("Fake device rejected frame: {}", e);
            shared.rejected_count.fetch_add(1, Ordering::SeqCst);
            return true;
        }
    };

    match Protocol::from_u16(request.header.protocol) {
        Some(Protocol::HelloRequest) => {
            shared.hello_count.fetch_add(1, Ordering::SeqCst);
            if shared.hello_enabled.load(Ordering::SeqCst) {
                if let Some(answer) = shared.hello_answer() {
                    return tx.send(answer).is_ok();
                }
            }
            true
        }
        Some(Protocol::PingRequest) => match shared.ping_answer() {
            Some(answer) => tx.send(answer).is_ok(),
            None => true,
        },
        Some(Protocol::RpcRequest) => {
            let encrypted = request.header.encrypted;
            shared.requests.lock().push(ReceivedRequest {
                id: request.id,
                method: request.method.clone(),
                params: request.params.clone(),
                encrypted,
            });
            shared.request_count.fetch_add(1, Ordering::SeqCst);

            let Some(id) = request.id else {
                return true;
            };
            let reply = shared
                .replies
                .lock()
                .get(&request.method)
                .cloned()
                .unwrap_or_else(|| Reply::ok(json!(["ok"])));

            let Some(answer) = reply
                .body()
                .and_then(|body| shared.response(id, encrypted, body))
            else {
                return true;
            };

            let delay = reply.delay();
            if delay.is_zero() {
                return tx.send(answer).is_ok();
            }

            let tx = tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = tx.send(answer);
            });
            true
        }
        _ => true,
    }
}
