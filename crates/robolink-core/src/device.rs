//! Device identity and inventory records

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::ProtocolVersion;

/// Immutable identity of a registered device
#[derive(Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub duid: String,
    pub local_key: Vec<u8>,
    pub version: ProtocolVersion,
}

impl DeviceIdentity {
    pub fn new(duid: impl Into<String>, local_key: impl AsRef<[u8]>, version: ProtocolVersion) -> Self {
        Self {
            duid: duid.into(),
            local_key: local_key.as_ref().to_vec(),
            version,
        }
    }
}

// Keep the key out of logs
impl fmt::Debug for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceIdentity")
            .field("duid", &self.duid)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

/// A device as supplied by the external device inventory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub duid: String,
    #[serde(default)]
    pub name: String,
    pub local_key: String,
    #[serde(default)]
    pub protocol_version: ProtocolVersion,
    /// Address on the local network, if known
    #[serde(default)]
    pub ip: Option<String>,
}

impl DeviceRecord {
    pub fn identity(&self) -> DeviceIdentity {
        DeviceIdentity::new(&self.duid, self.local_key.as_bytes(), self.protocol_version)
    }

    /// Forces every request for this device through the cloud transport
    pub fn cloud_only(&self) -> bool {
        self.protocol_version.is_cloud_only()
    }

    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.duid
        } else {
            &self.name
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_debug_hides_key() {
        let identity = DeviceIdentity::new("duid-1", b"secret-key", ProtocolVersion::V1);
        let rendered = format!("{:?}", identity);
        assert!(rendered.contains("duid-1"));
        assert!(!rendered.contains("secret-key"));
    }

    #[test]
    fn test_record_cloud_only_follows_version() {
        let record: DeviceRecord = serde_json::from_value(serde_json::json!({
            "duid": "d1",
            "local_key": "k",
            "protocol_version": "A01",
        }))
        .unwrap();
        assert!(record.cloud_only());
        assert_eq!(record.display_name(), "d1");
    }
}
