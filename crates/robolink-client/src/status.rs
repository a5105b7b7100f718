//! Domain types decoded from device responses

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Device status as reported by `get_status`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub state: Option<i64>,
    pub battery: Option<u8>,
    pub error_code: Option<i64>,
    pub clean_time: Option<u64>,
    pub clean_area: Option<u64>,
    pub fan_power: Option<i64>,
    pub water_box_mode: Option<i64>,
    pub mop_mode: Option<i64>,
    pub in_cleaning: Option<i64>,
    pub in_returning: Option<i64>,
    /// Fields this crate does not model
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl DeviceStatus {
    /// Decode a status result; devices wrap the object in a one-element list
    pub fn from_result(result: Value) -> Option<Self> {
        serde_json::from_value(first_object(result)?).ok()
    }

    pub fn is_cleaning(&self) -> bool {
        self.in_cleaning.map_or(false, |flag| flag != 0)
    }
}

/// Network details reported by `get_network_info`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkInfo {
    pub ip: String,
    pub ssid: Option<String>,
    pub mac: Option<String>,
    pub bssid: Option<String>,
    pub rssi: Option<i64>,
}

impl NetworkInfo {
    /// `None` when the result carries no `ip`
    pub fn from_result(result: Value) -> Option<Self> {
        let object = first_object(result)?;
        object.get("ip")?.as_str()?;
        serde_json::from_value(object).ok()
    }
}

/// Cleaning parameters; `None` fields are left unchanged on set
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanMode {
    pub suction_power: Option<i64>,
    pub water_flow: Option<i64>,
    pub mop_mode: Option<i64>,
}

/// Map segment to cloud room id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomMapping {
    pub segment_id: u32,
    pub room_id: String,
}

impl RoomMapping {
    /// Decode `[[segment, room_id, ...], ...]`
    pub fn list_from_result(result: Value) -> Vec<Self> {
        let Value::Array(rows) = result else {
            return Vec::new();
        };

        rows.iter()
            .filter_map(|row| {
                let segment_id = u32::try_from(row.get(0)?.as_u64()?).ok()?;
                let room_id = match row.get(1)? {
                    Value::String(id) => id.clone(),
                    Value::Number(id) => id.to_string(),
                    _ => return None,
                };
                Some(RoomMapping {
                    segment_id,
                    room_id,
                })
            })
            .collect()
    }
}

/// Single scalar out of a `[value]` result
pub(crate) fn scalar(result: &Value) -> Option<i64> {
    match result {
        Value::Array(items) => items.first().and_then(Value::as_i64),
        other => other.as_i64(),
    }
}

fn first_object(result: Value) -> Option<Value> {
    match result {
        Value::Array(items) => items.into_iter().next().filter(Value::is_object),
        object @ Value::Object(_) => Some(object),
        _ => None,
    }
}
