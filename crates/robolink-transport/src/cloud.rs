//! Cloud relay transport
//!
//! One MQTT session per account carries traffic for every device. Requests are
//! published to `rr/m/i/{rriot_user}/{mqtt_username}/{duid}` and replies arrive on
//! `rr/m/o/{rriot_user}/{mqtt_username}/{duid}`. Payloads are the same frames the
//! local transport carries, without the length prefix.
//!
//! Connecting is asynchronous: `connect()` starts the event loop and returns, and the
//! session becomes usable when the broker acknowledges it. Callers that need the
//! session wait on [`CloudClient::wait_connected`].

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS, Transport};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{Result, TransportError};
use crate::state::StateWatch;
use crate::traits::{ConnectionState, DeviceTransport, FrameSink, InboundFrame, TransportKind};

/// Cloud relay configuration. Credentials come pre-derived from the account login.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudConfig {
    /// MQTT broker host
    pub host: String,
    /// MQTT broker port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Use TLS
    #[serde(default = "default_tls")]
    pub tls: bool,
    /// Account user id from the login response
    pub rriot_user: String,
    pub mqtt_username: String,
    pub mqtt_password: String,
    /// Keep alive interval in seconds
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u16,
    /// Wait after an event-loop error before polling again
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

fn default_port() -> u16 {
    8883
}

fn default_tls() -> bool {
    true
}

fn default_keep_alive() -> u16 {
    60
}

fn default_retry_delay_ms() -> u64 {
    5000
}

impl CloudConfig {
    pub fn new(host: &str, rriot_user: &str, mqtt_username: &str, mqtt_password: &str) -> Self {
        Self {
            host: host.to_string(),
            port: default_port(),
            tls: default_tls(),
            rriot_user: rriot_user.to_string(),
            mqtt_username: mqtt_username.to_string(),
            mqtt_password: mqtt_password.to_string(),
            keep_alive_secs: default_keep_alive(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }

    /// Topic requests for `duid` are published on
    pub fn request_topic(&self, duid: &str) -> String {
        format!("rr/m/i/{}/{}/{}", self.rriot_user, self.mqtt_username, duid)
    }

    /// Filter covering every reply topic of the account
    pub fn response_filter(&self) -> String {
        format!("rr/m/o/{}/{}/#", self.rriot_user, self.mqtt_username)
    }

    /// Extract the device id from a reply topic
    pub fn duid_from_topic<'a>(&self, topic: &'a str) -> Option<&'a str> {
        let prefix = format!("rr/m/o/{}/{}/", self.rriot_user, self.mqtt_username);
        topic
            .strip_prefix(&prefix)
            .filter(|duid| !duid.is_empty() && !duid.contains('/'))
    }
}

/// Cloud relay client
pub struct CloudClient {
    config: Arc<CloudConfig>,
    sink: FrameSink,
    state: Arc<StateWatch>,
    client: Mutex<Option<AsyncClient>>,
    running: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl CloudClient {
    pub fn new(config: CloudConfig, sink: FrameSink) -> Self {
        Self {
            config: Arc::new(config),
            sink,
            state: Arc::new(StateWatch::new()),
            client: Mutex::new(None),
            running: Arc::new(AtomicBool::new(false)),
            task: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &CloudConfig {
        &self.config
    }

    /// Wait, without an upper bound, until the broker session is up
    pub async fn wait_connected(&self) {
        self.state.wait_for(ConnectionState::Connected).await;
    }

    fn mqtt_options(&self) -> MqttOptions {
        let client_id = format!(
            "robolink-{}",
            uuid::Uuid::new_v4().simple().to_string().get(..8).unwrap_or("client")
        );
        let mut options = MqttOptions::new(client_id, &self.config.host, self.config.port);
        options.set_keep_alive(Duration::from_secs(self.config.keep_alive_secs as u64));
        options.set_credentials(&self.config.mqtt_username, &self.config.mqtt_password);
        if self.config.tls {
            options.set_transport(Transport::tls_with_default_config());
        }
        options
    }
}

#[async_trait]
impl DeviceTransport for CloudClient {
    fn kind(&self) -> TransportKind {
        TransportKind::Cloud
    }

    async fn connect(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let (client, mut eventloop) = AsyncClient::new(self.mqtt_options(), 100);
        *self.client.lock() = Some(client.clone());
        self.state.set(ConnectionState::Connecting);

        info!(
            "Cloud relay connecting to {}:{}",
            self.config.host, self.config.port
        );

        let config = self.config.clone();
        let sink = self.sink.clone();
        let state = self.state.clone();
        let running = self.running.clone();
        let retry_delay = Duration::from_millis(config.retry_delay_ms);

        let task = tokio::spawn(async move {
            while running.load(Ordering::SeqCst) {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("Cloud relay connected to broker");
                        let filter = config.response_filter();
                        if let Err(e) = client.try_subscribe(&filter, QoS::AtLeastOnce) {
                            error!("Cloud relay subscribe to {} failed: {}", filter, e);
                        }
                        state.set(ConnectionState::Connected);
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let Some(duid) = config.duid_from_topic(&publish.topic) else {
                            debug!("Ignoring publish on {}", publish.topic);
                            continue;
                        };

                        debug!(duid, "Cloud frame ({} bytes)", publish.payload.len());
                        let frame = InboundFrame {
                            duid: duid.to_string(),
                            kind: TransportKind::Cloud,
                            data: publish.payload.clone(),
                        };
                        if sink.send(frame).await.is_err() {
                            debug!("Frame sink closed, stopping cloud relay loop");
                            running.store(false, Ordering::SeqCst);
                            break;
                        }
                    }
                    Ok(Event::Incoming(Packet::Disconnect)) => {
                        warn!("Cloud relay disconnected by broker");
                        state.set(ConnectionState::Connecting);
                    }
                    Err(e) => {
                        if state.set(ConnectionState::Connecting) == ConnectionState::Connected {
                            warn!("Cloud relay connection lost: {}", e);
                        } else {
                            error!("Cloud relay error: {:?}", e);
                        }
                        tokio::time::sleep(retry_delay).await;
                    }
                    _ => {}
                }
            }

            state.set(ConnectionState::Disconnected);
        });

        *self.task.lock() = Some(task);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);

        let client = self.client.lock().take();
        if let Some(client) = client {
            let _ = client.disconnect().await;
        }
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        self.state.set(ConnectionState::Disconnected);

        info!("Cloud relay stopped");
        Ok(())
    }

    fn state(&self) -> ConnectionState {
        self.state.get()
    }

    fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    async fn send(&self, duid: &str, frame: Bytes) -> Result<()> {
        if self.state.get() != ConnectionState::Connected {
            return Err(TransportError::NotConnected);
        }

        let client = self
            .client
            .lock()
            .clone()
            .ok_or(TransportError::NotConnected)?;

        let topic = self.config.request_topic(duid);
        client
            .publish(&topic, QoS::AtLeastOnce, false, frame.to_vec())
            .await?;

        debug!(duid, "Cloud frame sent to {}", topic);
        Ok(())
    }
}

impl Drop for CloudClient {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use robolink_test_utils::{wait_for, DEFAULT_CHECK_INTERVAL};
    use std::sync::atomic::AtomicUsize;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    fn config() -> CloudConfig {
        CloudConfig::new("mqtt-eu.example.com", "2gCnAu4F", "c4a1d2f3", "pass")
    }

    #[test]
    fn test_config_defaults() {
        let config: CloudConfig = serde_json::from_value(serde_json::json!({
            "host": "mqtt.example.com",
            "rriot_user": "u",
            "mqtt_username": "m",
            "mqtt_password": "p",
        }))
        .unwrap();
        assert_eq!(config.port, 8883);
        assert!(config.tls);
        assert_eq!(config.keep_alive_secs, 60);
    }

    #[test]
    fn test_topics() {
        let config = config();
        assert_eq!(config.request_topic("duid1"), "rr/m/i/2gCnAu4F/c4a1d2f3/duid1");
        assert_eq!(config.response_filter(), "rr/m/o/2gCnAu4F/c4a1d2f3/#");
    }

    #[test]
    fn test_duid_from_topic() {
        let config = config();
        assert_eq!(config.duid_from_topic("rr/m/o/2gCnAu4F/c4a1d2f3/duid1"), Some("duid1"));
        assert_eq!(config.duid_from_topic("rr/m/o/other/c4a1d2f3/duid1"), None);
        assert_eq!(config.duid_from_topic("rr/m/o/2gCnAu4F/c4a1d2f3/"), None);
        assert_eq!(config.duid_from_topic("rr/m/o/2gCnAu4F/c4a1d2f3/a/b"), None);
    }

    /// Minimal broker: acknowledges the session, waits for the subscribe, then
    /// publishes one response frame for `d1`
    async fn spawn_broker(config: &CloudConfig) -> (u16, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accepted = Arc::new(AtomicUsize::new(0));

        let topic = format!("rr/m/o/{}/{}/d1", config.rriot_user, config.mqtt_username);
        let mut publish = vec![0x30, (2 + topic.len() + 1) as u8];
        publish.extend_from_slice(&(topic.len() as u16).to_be_bytes());
        publish.extend_from_slice(topic.as_bytes());
        publish.push(b'x');

        let counter = accepted.clone();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                let publish = publish.clone();
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    if socket.read(&mut buf).await.unwrap_or(0) == 0 {
                        return;
                    }
                    let _ = socket.write_all(&[0x20, 0x02, 0x00, 0x00]).await;
                    if socket.read(&mut buf).await.unwrap_or(0) == 0 {
                        return;
                    }
                    let _ = socket.write_all(&publish).await;
                    while socket.read(&mut buf).await.unwrap_or(0) > 0 {}
                });
            }
        });

        (port, accepted)
    }

    #[tokio::test]
    async fn test_closed_sink_allows_reconnect() {
        let mut config = config();
        config.host = "127.0.0.1".into();
        config.tls = false;
        config.retry_delay_ms = 50;
        let (port, accepted) = spawn_broker(&config).await;
        config.port = port;

        let (sink, rx) = mpsc::channel(8);
        drop(rx);
        let client = CloudClient::new(config, sink);

        client.connect().await.unwrap();
        let stopped = wait_for(
            || async {
                !client.running.load(Ordering::SeqCst)
                    && client.state() == ConnectionState::Disconnected
            },
            DEFAULT_CHECK_INTERVAL,
            Duration::from_secs(5),
        )
        .await;
        assert!(stopped, "poll loop did not stop after the sink closed");

        // A stopped loop must not make connect() a no-op
        client.connect().await.unwrap();
        let reconnected = wait_for(
            || async { accepted.load(Ordering::SeqCst) >= 2 },
            DEFAULT_CHECK_INTERVAL,
            Duration::from_secs(5),
        )
        .await;
        assert!(reconnected);
        client.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_send_requires_session() {
        let (sink, _rx) = mpsc::channel(8);
        let client = CloudClient::new(config(), sink);
        assert!(!client.is_connected());
        assert!(matches!(
            client.send("duid1", Bytes::from_static(b"x")).await,
            Err(TransportError::NotConnected)
        ));
    }
}
