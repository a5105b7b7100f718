//! Request and response messages

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

use crate::Protocol;

/// An outbound command
#[derive(Debug, Clone, PartialEq)]
pub struct RequestMessage {
    pub method: String,
    pub params: Option<Value>,
    /// Bind the frame to the device's session nonce
    pub secure: bool,
    /// Always route through the cloud relay
    pub cloud_only: bool,
}

impl RequestMessage {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            params: None,
            secure: false,
            cloud_only: false,
        }
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = Some(params);
        self
    }

    pub fn secure(mut self) -> Self {
        self.secure = true;
        self
    }

    pub fn cloud_only(mut self) -> Self {
        self.cloud_only = true;
        self
    }
}

/// Error reported by the device inside an RPC response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceError {
    pub code: i64,
    #[serde(default)]
    pub message: String,
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "device error {}: {}", self.code, self.message)
    }
}

impl std::error::Error for DeviceError {}

/// An inbound frame after decoding: either a response or an unsolicited notification.
///
/// The two are told apart only by whether a pending request claims its correlation id.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseMessage {
    pub duid: String,
    /// Protocol code from the frame header
    pub protocol: u16,
    pub dps: BTreeMap<u32, Value>,
}

impl ResponseMessage {
    pub fn new(duid: impl Into<String>, protocol: u16) -> Self {
        Self {
            duid: duid.into(),
            protocol,
            dps: BTreeMap::new(),
        }
    }

    pub fn with(mut self, code: Protocol, value: Value) -> Self {
        self.dps.insert(code.key(), value);
        self
    }

    pub fn contains(&self, code: Protocol) -> bool {
        self.dps.contains_key(&code.key())
    }

    pub fn get(&self, code: Protocol) -> Option<&Value> {
        self.dps.get(&code.key())
    }

    /// Correlation id of an RPC response, if this frame carries one
    pub fn correlation_id(&self) -> Option<u32> {
        self.get(Protocol::RpcResponse)?
            .get("id")?
            .as_u64()
            .and_then(|id| u32::try_from(id).ok())
    }

    /// Result (or device-reported error) of an RPC response
    pub fn rpc_result(&self) -> Option<Result<Value, DeviceError>> {
        let body = self.get(Protocol::RpcResponse)?;

        if let Some(error) = body.get("error") {
            let parsed = serde_json::from_value::<DeviceError>(error.clone()).unwrap_or_else(|_| {
                DeviceError {
                    code: -1,
                    message: error.to_string(),
                }
            });
            return Some(Err(parsed));
        }

        Some(Ok(body.get("result").cloned().unwrap_or(Value::Null)))
    }

    /// Nonce carried by a handshake response
    pub fn handshake_nonce(&self) -> Option<u64> {
        self.get(Protocol::HelloResponse)?
            .get("result")?
            .get("nonce")?
            .as_u64()
    }

    pub fn is_handshake(&self) -> bool {
        self.contains(Protocol::HelloResponse)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_builder() {
        let req = RequestMessage::new("get_prop")
            .with_params(json!(["get_status"]))
            .secure();
        assert_eq!(req.method, "get_prop");
        assert!(req.secure);
        assert!(!req.cloud_only);
    }

    #[test]
    fn test_correlation_and_result() {
        let msg = ResponseMessage::new("d1", 102)
            .with(Protocol::RpcResponse, json!({"id": 12345, "result": ["ok"]}));

        assert_eq!(msg.correlation_id(), Some(12345));
        assert_eq!(msg.rpc_result(), Some(Ok(json!(["ok"]))));
    }

    #[test]
    fn test_device_error() {
        let msg = ResponseMessage::new("d1", 102).with(
            Protocol::RpcResponse,
            json!({"id": 1, "error": {"code": -10000, "message": "method not found"}}),
        );

        let err = msg.rpc_result().unwrap().unwrap_err();
        assert_eq!(err.code, -10000);
        assert_eq!(err.message, "method not found");
    }

    #[test]
    fn test_notification_has_no_correlation() {
        let msg = ResponseMessage::new("d1", 102).with(Protocol::Battery, json!(80));
        assert!(msg.contains(Protocol::Battery));
        assert!(!msg.contains(Protocol::ErrorCode));
        assert_eq!(msg.correlation_id(), None);
        assert_eq!(msg.rpc_result(), None);
    }

    #[test]
    fn test_handshake_nonce() {
        let msg = ResponseMessage::new("d1", 1)
            .with(Protocol::HelloResponse, json!({"result": {"nonce": 991}}));
        assert!(msg.is_handshake());
        assert_eq!(msg.handshake_nonce(), Some(991));
    }
}
