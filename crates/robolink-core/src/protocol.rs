//! Data-point codes and protocol version tags

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::Error;

/// Data-point codes used both as the frame kind and as `dps` map keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Protocol {
    HelloRequest = 0,
    HelloResponse = 1,
    PingRequest = 2,
    PingResponse = 3,
    GeneralRequest = 4,
    GeneralResponse = 5,
    RpcRequest = 101,
    RpcResponse = 102,
    ErrorCode = 120,
    StatusUpdate = 121,
    Battery = 122,
    SuctionPower = 123,
    WaterBoxMode = 124,
    AdditionalProps = 125,
    MapResponse = 301,
}

impl Protocol {
    pub fn from_u16(val: u16) -> Option<Self> {
        match val {
            0 => Some(Protocol::HelloRequest),
            1 => Some(Protocol::HelloResponse),
            2 => Some(Protocol::PingRequest),
            3 => Some(Protocol::PingResponse),
            4 => Some(Protocol::GeneralRequest),
            5 => Some(Protocol::GeneralResponse),
            101 => Some(Protocol::RpcRequest),
            102 => Some(Protocol::RpcResponse),
            120 => Some(Protocol::ErrorCode),
            121 => Some(Protocol::StatusUpdate),
            122 => Some(Protocol::Battery),
            123 => Some(Protocol::SuctionPower),
            124 => Some(Protocol::WaterBoxMode),
            125 => Some(Protocol::AdditionalProps),
            301 => Some(Protocol::MapResponse),
            _ => None,
        }
    }

    pub fn code(self) -> u16 {
        self as u16
    }

    /// The `dps` map key for this code
    pub fn key(self) -> u32 {
        self as u32
    }
}

/// Protocol version tag carried in the first three bytes of every frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ProtocolVersion {
    #[default]
    #[serde(rename = "1.0")]
    V1,
    #[serde(rename = "A01")]
    A01,
    #[serde(rename = "B01")]
    B01,
    #[serde(rename = "L01")]
    L01,
}

impl ProtocolVersion {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolVersion::V1 => "1.0",
            ProtocolVersion::A01 => "A01",
            ProtocolVersion::B01 => "B01",
            ProtocolVersion::L01 => "L01",
        }
    }

    pub fn tag(&self) -> [u8; 3] {
        let mut tag = [0u8; 3];
        tag.copy_from_slice(self.as_str().as_bytes());
        tag
    }

    pub fn from_tag(tag: &[u8]) -> Option<Self> {
        match tag {
            b"1.0" => Some(ProtocolVersion::V1),
            b"A01" => Some(ProtocolVersion::A01),
            b"B01" => Some(ProtocolVersion::B01),
            b"L01" => Some(ProtocolVersion::L01),
            _ => None,
        }
    }

    /// Devices speaking this version are only reachable through the cloud relay.
    ///
    /// This is the only place the cloud-always decision is made.
    pub fn is_cloud_only(&self) -> bool {
        matches!(self, ProtocolVersion::A01 | ProtocolVersion::B01)
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProtocolVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ProtocolVersion::from_tag(s.as_bytes()).ok_or_else(|| Error::UnknownVersion(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_codes() {
        for code in [0u16, 1, 2, 3, 4, 5, 101, 102, 120, 121, 122, 123, 124, 125, 301] {
            let protocol = Protocol::from_u16(code).expect("known code");
            assert_eq!(protocol.code(), code);
        }
        assert!(Protocol::from_u16(999).is_none());
    }

    #[test]
    fn test_version_tags() {
        assert_eq!(ProtocolVersion::from_tag(b"1.0"), Some(ProtocolVersion::V1));
        assert_eq!(ProtocolVersion::L01.tag(), *b"L01");
        assert!(ProtocolVersion::from_tag(b"2.0").is_none());
        assert!("X99".parse::<ProtocolVersion>().is_err());
    }

    #[test]
    fn test_cloud_only_versions() {
        assert!(ProtocolVersion::A01.is_cloud_only());
        assert!(ProtocolVersion::B01.is_cloud_only());
        assert!(!ProtocolVersion::V1.is_cloud_only());
        assert!(!ProtocolVersion::L01.is_cloud_only());
    }
}
