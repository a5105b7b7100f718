//! Binary frame encoding/decoding
//!
//! Frame format:
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │ Bytes 0-2:   Version tag (ASCII, "1.0" / "A01" / "B01" / "L01") │
//! │ Byte 3:      Flags                                              │
//! │              [0]   Encrypted (payload sealed with session key)  │
//! │              [7:1] Reserved                                     │
//! │ Bytes 4-7:   Sequence number (uint32 big-endian)                │
//! │ Bytes 8-11:  Random (uint32 big-endian)                         │
//! │ Bytes 12-15: Timestamp (uint32 unix seconds)                    │
//! │ Bytes 16-17: Protocol code (uint16)                             │
//! │ Bytes 18-19: Payload length (uint16, max 65535)                 │
//! ├─────────────────────────────────────────────────────────────────┤
//! │ Payload (JSON, or AES-GCM ciphertext when encrypted)            │
//! ├─────────────────────────────────────────────────────────────────┤
//! │ 4 bytes: HMAC-SHA256(local_key, header ‖ payload) truncated     │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::crypto::{self, TAG_SIZE};
use crate::{Error, ProtocolVersion, Result};

/// Header size
pub const HEADER_SIZE: usize = 20;

/// Maximum payload size
pub const MAX_PAYLOAD_SIZE: usize = 65535;

/// Largest encoded frame: header, full payload and integrity tag
pub const MAX_FRAME_SIZE: usize = HEADER_SIZE + MAX_PAYLOAD_SIZE + TAG_SIZE;

const FLAG_ENCRYPTED: u8 = 0x01;

/// Fixed-size frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub version: ProtocolVersion,
    pub encrypted: bool,
    pub seq: u32,
    pub random: u32,
    pub timestamp: u32,
    pub protocol: u16,
}

impl FrameHeader {
    pub fn new(version: ProtocolVersion, protocol: u16) -> Self {
        Self {
            version,
            encrypted: false,
            seq: 0,
            random: 0,
            timestamp: 0,
            protocol,
        }
    }

    /// Serialise the header for a payload of `payload_len` bytes
    pub fn to_bytes(&self, payload_len: usize) -> Result<[u8; HEADER_SIZE]> {
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(Error::PayloadTooLarge(payload_len));
        }

        let mut buf = [0u8; HEADER_SIZE];
        buf[..3].copy_from_slice(&self.version.tag());
        buf[3] = if self.encrypted { FLAG_ENCRYPTED } else { 0 };
        buf[4..8].copy_from_slice(&self.seq.to_be_bytes());
        buf[8..12].copy_from_slice(&self.random.to_be_bytes());
        buf[12..16].copy_from_slice(&self.timestamp.to_be_bytes());
        buf[16..18].copy_from_slice(&self.protocol.to_be_bytes());
        buf[18..20].copy_from_slice(&(payload_len as u16).to_be_bytes());
        Ok(buf)
    }

    fn parse(mut buf: &[u8]) -> Result<(Self, usize)> {
        if buf.len() < HEADER_SIZE {
            return Err(Error::malformed(format!(
                "header needs {} bytes, have {}",
                HEADER_SIZE,
                buf.len()
            )));
        }

        let version = ProtocolVersion::from_tag(&buf[..3]).ok_or_else(|| {
            Error::malformed(format!("unknown version tag {:?}", String::from_utf8_lossy(&buf[..3])))
        })?;
        buf.advance(3);

        let flags = buf.get_u8();
        let seq = buf.get_u32();
        let random = buf.get_u32();
        let timestamp = buf.get_u32();
        let protocol = buf.get_u16();
        let payload_len = buf.get_u16() as usize;

        Ok((
            Self {
                version,
                encrypted: flags & FLAG_ENCRYPTED != 0,
                seq,
                random,
                timestamp,
                protocol,
            },
            payload_len,
        ))
    }
}

/// A device frame: header plus on-wire payload
#[derive(Debug, Clone)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(header: FrameHeader, payload: impl Into<Bytes>) -> Self {
        Self {
            header,
            payload: payload.into(),
        }
    }

    /// Total encoded size
    pub fn size(&self) -> usize {
        HEADER_SIZE + self.payload.len() + TAG_SIZE
    }

    /// Encode frame to bytes, appending the integrity tag
    pub fn encode(&self, local_key: &[u8]) -> Result<Bytes> {
        let header = self.header.to_bytes(self.payload.len())?;

        let mut buf = BytesMut::with_capacity(self.size());
        buf.extend_from_slice(&header);
        buf.extend_from_slice(&self.payload);

        let tag = crypto::integrity_tag(local_key, &buf)?;
        buf.put_slice(&tag);

        Ok(buf.freeze())
    }

    /// Decode and authenticate a frame
    pub fn decode(buf: &[u8], local_key: &[u8]) -> Result<Self> {
        let (header, payload_len) = FrameHeader::parse(buf)?;

        let body_end = HEADER_SIZE + payload_len;
        if buf.len() != body_end + TAG_SIZE {
            return Err(Error::malformed(format!(
                "expected {} bytes, have {}",
                body_end + TAG_SIZE,
                buf.len()
            )));
        }

        if !crypto::verify_integrity(local_key, &buf[..body_end], &buf[body_end..]) {
            return Err(Error::malformed("integrity check failed"));
        }

        Ok(Self {
            header,
            payload: Bytes::copy_from_slice(&buf[HEADER_SIZE..body_end]),
        })
    }

    /// Read the protocol code without authenticating the frame
    pub fn peek_protocol(buf: &[u8]) -> Option<u16> {
        if buf.len() < HEADER_SIZE {
            return None;
        }
        Some(u16::from_be_bytes([buf[16], buf[17]]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &[u8] = b"test-local-key";

    fn header() -> FrameHeader {
        FrameHeader {
            version: ProtocolVersion::V1,
            encrypted: false,
            seq: 7,
            random: 0xdead_beef,
            timestamp: 1_700_000_000,
            protocol: 102,
        }
    }

    #[test]
    fn test_frame_encode_decode() {
        let frame = Frame::new(header(), &b"{\"dps\":{}}"[..]);
        let encoded = frame.encode(KEY).unwrap();
        assert_eq!(encoded.len(), frame.size());
        assert_eq!(&encoded[..3], b"1.0");

        let decoded = Frame::decode(&encoded, KEY).unwrap();
        assert_eq!(decoded.header, header());
        assert_eq!(decoded.payload.as_ref(), b"{\"dps\":{}}");
    }

    #[test]
    fn test_flipped_bit_is_malformed() {
        let encoded = Frame::new(header(), &b"payload"[..]).encode(KEY).unwrap();
        let mut tampered = encoded.to_vec();
        tampered[HEADER_SIZE] ^= 0x01;

        assert!(matches!(
            Frame::decode(&tampered, KEY),
            Err(Error::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_truncated_frame_is_malformed() {
        let encoded = Frame::new(header(), &b"payload"[..]).encode(KEY).unwrap();
        assert!(Frame::decode(&encoded[..10], KEY).is_err());
        assert!(Frame::decode(&encoded[..encoded.len() - 1], KEY).is_err());
    }

    #[test]
    fn test_peek_protocol() {
        let encoded = Frame::new(header(), &b"x"[..]).encode(KEY).unwrap();
        assert_eq!(Frame::peek_protocol(&encoded), Some(102));
        assert_eq!(Frame::peek_protocol(&encoded[..4]), None);
    }
}
