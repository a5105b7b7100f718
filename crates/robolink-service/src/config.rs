//! TOML configuration
//!
//! ```toml
//! request_timeout_secs = 10
//! refresh_interval_secs = 60
//!
//! [local]
//! connect_attempts = 20
//!
//! [cloud]
//! host = "mqtt-eu-3.roborock.com"
//! rriot_user = "..."
//! mqtt_username = "..."
//! mqtt_password = "..."
//!
//! [[devices]]
//! duid = "1UCy3RAdDGNLFs"
//! name = "Living room"
//! local_key = "qWKYcdQWrbm9hPqe"
//! ip = "192.168.1.40"
//! rooms = [16, 17, 18]
//! ```

use robolink_core::{DeviceRecord, ProtocolVersion, DEFAULT_LOCAL_PORT};
use robolink_transport::{CloudConfig, LocalConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use crate::error::{Result, ServiceError};

/// Top-level configuration file schema
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// How long a device request waits for its response
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Local status poll period; the cloud poll runs twice as often
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_secs: u64,

    #[serde(default)]
    pub local: LocalSection,

    /// Cloud relay credentials, if the account has them
    #[serde(default)]
    pub cloud: Option<CloudConfig>,

    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

fn default_request_timeout() -> u64 {
    10
}

fn default_refresh_interval() -> u64 {
    60
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout(),
            refresh_interval_secs: default_refresh_interval(),
            local: LocalSection::default(),
            cloud: None,
            devices: Vec::new(),
        }
    }
}

impl ServiceConfig {
    /// Load and validate a config file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: ServiceConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.refresh_interval_secs == 0 {
            return Err(ServiceError::Config("refresh_interval_secs must be positive".into()));
        }

        let mut seen = HashSet::new();
        for device in &self.devices {
            if device.duid.is_empty() {
                return Err(ServiceError::Config("device with empty duid".into()));
            }
            if device.local_key.is_empty() {
                return Err(ServiceError::Config(format!("device {} has no local_key", device.duid)));
            }
            if !seen.insert(device.duid.as_str()) {
                return Err(ServiceError::Config(format!("device {} listed twice", device.duid)));
            }
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs.max(1))
    }

    pub fn device(&self, duid: &str) -> Option<&DeviceConfig> {
        self.devices.iter().find(|device| device.duid == duid)
    }
}

/// Settings for direct device connections
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalSection {
    pub port: u16,
    pub connect_attempts: u32,
    pub retry_interval_ms: u64,
    /// Zero disables pings
    pub keepalive_secs: u64,
    pub reconnect_delay_ms: u64,
    pub auto_reconnect: bool,
}

impl Default for LocalSection {
    fn default() -> Self {
        Self {
            port: DEFAULT_LOCAL_PORT,
            connect_attempts: 20,
            retry_interval_ms: 500,
            keepalive_secs: 10,
            reconnect_delay_ms: 5000,
            auto_reconnect: true,
        }
    }
}

impl LocalSection {
    pub fn to_local_config(&self) -> LocalConfig {
        LocalConfig {
            port: self.port,
            connect_attempts: self.connect_attempts,
            retry_interval: Duration::from_millis(self.retry_interval_ms),
            keepalive: Duration::from_secs(self.keepalive_secs),
            reconnect_delay: Duration::from_millis(self.reconnect_delay_ms),
            auto_reconnect: self.auto_reconnect,
            ..Default::default()
        }
    }
}

/// A device entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub duid: String,
    #[serde(default)]
    pub name: String,
    pub local_key: String,
    #[serde(default)]
    pub protocol_version: ProtocolVersion,
    /// Local address; devices without one are only reachable through the cloud
    #[serde(default)]
    pub ip: Option<String>,
    /// Room segments the device supports
    #[serde(default)]
    pub rooms: Vec<u32>,
    /// Rooms cleaned by default
    #[serde(default)]
    pub selected_rooms: Vec<u32>,
    /// Routines the account offers for this device
    #[serde(default)]
    pub routines: Vec<Routine>,
    /// Routine ids run instead of a clean; ids not in `routines` are ignored
    #[serde(default)]
    pub selected_routines: Vec<u64>,
}

impl DeviceConfig {
    pub fn record(&self) -> DeviceRecord {
        DeviceRecord {
            duid: self.duid.clone(),
            name: self.name.clone(),
            local_key: self.local_key.clone(),
            protocol_version: self.protocol_version,
            ip: self.ip.clone(),
        }
    }
}

/// A cloud routine (scene)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Routine {
    pub id: u64,
    #[serde(default)]
    pub name: String,
}
