//! Payload codec
//!
//! Turns requests into frames and frames into data-point maps. The client side uses
//! [`encode_request`], [`encode_hello`], [`encode_ping`] and [`decode`]; the device side
//! (fakes, tests, tooling) uses [`decode_request`], [`encode_response`] and
//! [`encode_notification`].
//!
//! Payloads are JSON of the form `{"t": <ts>, "dps": {"<code>": <value>}}`. RPC bodies
//! under codes 101/102 travel as JSON strings and are parsed back into structured JSON
//! on decode.

use bytes::Bytes;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

use crate::crypto::{self, SessionCipher};
use crate::frame::{Frame, FrameHeader};
use crate::{DeviceIdentity, Error, Protocol, RequestMessage, ResponseMessage, Result};

/// AES-GCM tag length appended to sealed payloads
const SEAL_OVERHEAD: usize = 16;

/// Per-frame header values chosen by the sender
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameContext {
    pub seq: u32,
    pub random: u32,
    pub timestamp: u32,
}

impl FrameContext {
    pub fn new(seq: u32, random: u32, timestamp: u32) -> Self {
        Self {
            seq,
            random,
            timestamp,
        }
    }

    /// Context stamped with the current wall-clock time
    pub fn now(seq: u32, random: u32) -> Self {
        Self::new(seq, random, unix_now())
    }
}

/// A request as seen by the device
#[derive(Debug, Clone, PartialEq)]
pub struct RequestFrame {
    pub header: FrameHeader,
    pub id: Option<u32>,
    pub method: String,
    pub params: Value,
}

// ============================================================================
// CLIENT SIDE
// ============================================================================

/// Encode an RPC request. The payload is sealed when the request is secure and a
/// nonce is on record; otherwise it goes out in the clear.
pub fn encode_request(
    identity: &DeviceIdentity,
    nonce: Option<u64>,
    ctx: FrameContext,
    id: u32,
    request: &RequestMessage,
) -> Result<Bytes> {
    let body = json!({
        "id": id,
        "method": request.method,
        "params": request.params.clone().unwrap_or_else(|| json!([])),
    });

    let mut dps = BTreeMap::new();
    dps.insert(Protocol::RpcRequest.key(), Value::String(body.to_string()));

    let seal_with = match (request.secure, nonce) {
        (true, Some(nonce)) => Some(nonce),
        (true, None) => {
            debug!(duid = %identity.duid, method = %request.method, "no nonce yet, sending unsecured");
            None
        }
        (false, _) => None,
    };

    encode_message(identity, seal_with, ctx, Protocol::RpcRequest, &dps)
}

/// Encode the handshake request sent after a local socket opens
pub fn encode_hello(identity: &DeviceIdentity, ctx: FrameContext) -> Result<Bytes> {
    let mut dps = BTreeMap::new();
    dps.insert(
        Protocol::HelloRequest.key(),
        json!({"method": "hello", "params": {"version": identity.version.as_str()}}),
    );
    encode_message(identity, None, ctx, Protocol::HelloRequest, &dps)
}

/// Encode a keep-alive ping
pub fn encode_ping(identity: &DeviceIdentity, ctx: FrameContext) -> Result<Bytes> {
    let mut dps = BTreeMap::new();
    dps.insert(Protocol::PingRequest.key(), json!({}));
    encode_message(identity, None, ctx, Protocol::PingRequest, &dps)
}

/// Decode any inbound frame into its data-point map.
///
/// `nonce` is only consulted for encrypted frames.
pub fn decode(identity: &DeviceIdentity, nonce: Option<u64>, data: &[u8]) -> Result<ResponseMessage> {
    let (header, payload) = open_frame(identity, nonce, data)?;
    let dps = parse_dps(&payload)?;

    Ok(ResponseMessage {
        duid: identity.duid.clone(),
        protocol: header.protocol,
        dps,
    })
}

// ============================================================================
// DEVICE SIDE
// ============================================================================

/// Decode a frame sent by a client
pub fn decode_request(
    identity: &DeviceIdentity,
    nonce: Option<u64>,
    data: &[u8],
) -> Result<RequestFrame> {
    let (header, payload) = open_frame(identity, nonce, data)?;
    let dps = parse_dps(&payload)?;

    let body = dps
        .get(&u32::from(header.protocol))
        .cloned()
        .unwrap_or(Value::Null);

    let method = body
        .get("method")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| match Protocol::from_u16(header.protocol) {
            Some(Protocol::PingRequest) => "ping".to_string(),
            _ => String::new(),
        });

    Ok(RequestFrame {
        header,
        id: body
            .get("id")
            .and_then(Value::as_u64)
            .and_then(|id| u32::try_from(id).ok()),
        method,
        params: body.get("params").cloned().unwrap_or(Value::Null),
    })
}

/// Encode an RPC response carrying `body` (`{"result": ..}` or `{"error": ..}`)
pub fn encode_response(
    identity: &DeviceIdentity,
    nonce: Option<u64>,
    ctx: FrameContext,
    id: u32,
    body: Value,
) -> Result<Bytes> {
    let mut object = match body {
        Value::Object(map) => map,
        other => {
            let mut map = Map::new();
            map.insert("result".to_string(), other);
            map
        }
    };
    object.insert("id".to_string(), json!(id));

    let mut dps = BTreeMap::new();
    dps.insert(
        Protocol::RpcResponse.key(),
        Value::String(Value::Object(object).to_string()),
    );
    encode_message(identity, nonce, ctx, Protocol::RpcResponse, &dps)
}

/// Encode an unsolicited frame with an arbitrary data-point map
pub fn encode_notification(
    identity: &DeviceIdentity,
    ctx: FrameContext,
    protocol: Protocol,
    dps: &BTreeMap<u32, Value>,
) -> Result<Bytes> {
    encode_message(identity, None, ctx, protocol, dps)
}

// ============================================================================
// SHARED
// ============================================================================

fn encode_message(
    identity: &DeviceIdentity,
    seal_with: Option<u64>,
    ctx: FrameContext,
    protocol: Protocol,
    dps: &BTreeMap<u32, Value>,
) -> Result<Bytes> {
    let dps_object: Map<String, Value> = dps
        .iter()
        .map(|(code, value)| (code.to_string(), value.clone()))
        .collect();
    let plaintext = serde_json::to_vec(&json!({"t": ctx.timestamp, "dps": dps_object}))?;

    let header = FrameHeader {
        version: identity.version,
        encrypted: seal_with.is_some(),
        seq: ctx.seq,
        random: ctx.random,
        timestamp: ctx.timestamp,
        protocol: protocol.code(),
    };

    let payload = match seal_with {
        Some(nonce) => {
            let aad = header.to_bytes(plaintext.len() + SEAL_OVERHEAD)?;
            let iv = crypto::frame_iv(ctx.seq, ctx.random, ctx.timestamp);
            SessionCipher::new(&identity.local_key, nonce)?.seal(&iv, &aad, &plaintext)?
        }
        None => plaintext,
    };

    Frame::new(header, payload).encode(&identity.local_key)
}

fn open_frame(
    identity: &DeviceIdentity,
    nonce: Option<u64>,
    data: &[u8],
) -> Result<(FrameHeader, Vec<u8>)> {
    let frame = Frame::decode(data, &identity.local_key)?;
    let header = frame.header;

    if !header.encrypted {
        return Ok((header, frame.payload.to_vec()));
    }

    let nonce = nonce.ok_or_else(|| Error::malformed("encrypted frame but no nonce on record"))?;
    let aad = header.to_bytes(frame.payload.len())?;
    let iv = crypto::frame_iv(header.seq, header.random, header.timestamp);
    let plaintext = SessionCipher::new(&identity.local_key, nonce)?.open(&iv, &aad, &frame.payload)?;

    Ok((header, plaintext))
}

fn parse_dps(payload: &[u8]) -> Result<BTreeMap<u32, Value>> {
    let root: Value = serde_json::from_slice(payload)
        .map_err(|e| Error::malformed(format!("payload is not json: {}", e)))?;

    let Some(raw) = root.get("dps").and_then(Value::as_object) else {
        return Err(Error::malformed("payload has no dps map"));
    };

    let mut dps = BTreeMap::new();
    for (key, value) in raw {
        let code: u32 = key
            .parse()
            .map_err(|_| Error::malformed(format!("non-numeric dps key {:?}", key)))?;
        dps.insert(code, unwrap_nested(value));
    }
    Ok(dps)
}

fn unwrap_nested(value: &Value) -> Value {
    match value {
        Value::String(s) if s.starts_with('{') || s.starts_with('[') => {
            serde_json::from_str(s).unwrap_or_else(|_| value.clone())
        }
        other => other.clone(),
    }
}

fn unix_now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ProtocolVersion;

    fn identity() -> DeviceIdentity {
        DeviceIdentity::new("duid-1", b"0123456789abcdef", ProtocolVersion::V1)
    }

    fn ctx() -> FrameContext {
        FrameContext::new(1, 99, 1_700_000_000)
    }

    #[test]
    fn test_request_reaches_device_intact() {
        let req = RequestMessage::new("app_segment_clean")
            .with_params(json!([{"segments": [16, 17], "repeat": 1}]));
        let bytes = encode_request(&identity(), None, ctx(), 12001, &req).unwrap();

        let seen = decode_request(&identity(), None, &bytes).unwrap();
        assert_eq!(seen.id, Some(12001));
        assert_eq!(seen.method, "app_segment_clean");
        assert_eq!(seen.params, json!([{"segments": [16, 17], "repeat": 1}]));
        assert!(!seen.header.encrypted);
    }

    #[test]
    fn test_missing_params_default_to_empty_list() {
        let bytes =
            encode_request(&identity(), None, ctx(), 10001, &RequestMessage::new("app_start")).unwrap();
        let seen = decode_request(&identity(), None, &bytes).unwrap();
        assert_eq!(seen.params, json!([]));
    }

    #[test]
    fn test_secure_request_without_nonce_goes_unsecured() {
        let req = RequestMessage::new("get_network_info").secure();
        let bytes = encode_request(&identity(), None, ctx(), 10002, &req).unwrap();
        let seen = decode_request(&identity(), None, &bytes).unwrap();
        assert!(!seen.header.encrypted);
    }

    #[test]
    fn test_secure_request_is_bound_to_nonce() {
        let req = RequestMessage::new("get_network_info").secure();
        let bytes = encode_request(&identity(), Some(555), ctx(), 10003, &req).unwrap();

        let seen = decode_request(&identity(), Some(555), &bytes).unwrap();
        assert!(seen.header.encrypted);
        assert_eq!(seen.method, "get_network_info");

        assert!(decode_request(&identity(), Some(556), &bytes).is_err());
        assert!(decode_request(&identity(), None, &bytes).is_err());
    }

    #[test]
    fn test_response_decodes_with_correlation() {
        let bytes = encode_response(&identity(), None, ctx(), 10004, json!({"result": ["ok"]})).unwrap();
        let msg = decode(&identity(), None, &bytes).unwrap();

        assert_eq!(msg.duid, "duid-1");
        assert_eq!(msg.protocol, Protocol::RpcResponse.code());
        assert_eq!(msg.correlation_id(), Some(10004));
        assert_eq!(msg.rpc_result(), Some(Ok(json!(["ok"]))));
    }

    #[test]
    fn test_bare_result_is_wrapped() {
        let bytes = encode_response(&identity(), None, ctx(), 10005, json!([{"ip": "10.0.0.2"}])).unwrap();
        let msg = decode(&identity(), None, &bytes).unwrap();
        assert_eq!(msg.rpc_result(), Some(Ok(json!([{"ip": "10.0.0.2"}]))));
    }

    #[test]
    fn test_notification_dps() {
        let mut dps = BTreeMap::new();
        dps.insert(Protocol::Battery.key(), json!(64));
        dps.insert(Protocol::StatusUpdate.key(), json!(8));
        let bytes = encode_notification(&identity(), ctx(), Protocol::RpcResponse, &dps).unwrap();

        let msg = decode(&identity(), None, &bytes).unwrap();
        assert_eq!(msg.get(Protocol::Battery), Some(&json!(64)));
        assert_eq!(msg.get(Protocol::StatusUpdate), Some(&json!(8)));
        assert_eq!(msg.correlation_id(), None);
    }

    #[test]
    fn test_wrong_key_is_malformed() {
        let bytes = encode_ping(&identity(), ctx()).unwrap();
        let other = DeviceIdentity::new("duid-1", b"fedcba9876543210", ProtocolVersion::V1);
        let err = decode(&other, None, &bytes).unwrap_err();
        assert!(err.is_malformed());
    }

    #[test]
    fn test_hello_request_method() {
        let bytes = encode_hello(&identity(), ctx()).unwrap();
        let seen = decode_request(&identity(), None, &bytes).unwrap();
        assert_eq!(seen.header.protocol, Protocol::HelloRequest.code());
        assert_eq!(seen.method, "hello");
        assert_eq!(seen.params, json!({"version": "1.0"}));
    }
}
