//! Message Processor Tests (robolink-client)
//!
//! Tests for:
//! - Command vocabulary (method names and parameters on the wire)
//! - Status queries and change-driven callbacks
//! - Push notifications (battery / error / status)
//! - Network info, clean mode and room mapping decoding
//! - Negative cases

use parking_lot::Mutex;
use robolink_client::{CleanMode, ClientError, ClientRouter, ClientTarget, MessageProcessor};
use robolink_core::{Protocol, RequestMessage};
use robolink_test_utils::{test_identity, wait_for, FakeDevice, Reply, DEFAULT_CHECK_INTERVAL};
use robolink_transport::LocalConfig;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

const DUID: &str = "4P3Jb9GkCxTd";

async fn setup() -> (FakeDevice, MessageProcessor) {
    let device = FakeDevice::start(test_identity(DUID)).await;

    let router = Arc::new(
        ClientRouter::builder()
            .request_timeout(Duration::from_millis(500))
            .local(LocalConfig {
                port: device.port(),
                retry_interval: Duration::from_millis(100),
                keepalive: Duration::ZERO,
                ..Default::default()
            })
            .build(),
    );
    router.register_device(device.identity().clone(), false);
    router
        .register_client(DUID, ClientTarget::Local { ip: device.ip().into() })
        .unwrap();
    router.connect().await.unwrap();
    assert_eq!(router.nonce(DUID), Some(device.nonce()));

    let processor = MessageProcessor::new(router, DUID).unwrap();
    (device, processor)
}

fn status_reply(battery: u8, state: i64, error_code: i64) -> Reply {
    Reply::ok(json!([{
        "state": state,
        "battery": battery,
        "error_code": error_code,
        "in_cleaning": 0,
    }]))
}

// ============================================================================
// Commands
// ============================================================================

#[tokio::test]
async fn test_command_methods() {
    let (device, vacuum) = setup().await;

    vacuum.start_clean().await.unwrap();
    vacuum.pause_clean().await.unwrap();
    vacuum.resume_clean().await.unwrap();
    vacuum.resume_room_clean().await.unwrap();
    vacuum.stop_clean().await.unwrap();
    vacuum.go_home().await.unwrap();
    vacuum.find_me().await.unwrap();

    let methods: Vec<String> = device.requests().into_iter().map(|r| r.method).collect();
    assert_eq!(
        methods,
        vec![
            "app_start",
            "app_pause",
            "app_start",
            "resume_segment_clean",
            "app_stop",
            "app_charge",
            "find_me",
        ]
    );
}

#[tokio::test]
async fn test_room_clean_params() {
    let (device, vacuum) = setup().await;

    vacuum.start_room_clean(&[16, 17], 2).await.unwrap();

    let request = &device.requests_for("app_segment_clean")[0];
    assert_eq!(request.params, json!([{"segments": [16, 17], "repeat": 2}]));
    assert!(!request.encrypted);
}

#[tokio::test]
async fn test_room_clean_requires_rooms() {
    let (device, vacuum) = setup().await;

    assert!(matches!(
        vacuum.start_room_clean(&[], 1).await,
        Err(ClientError::InvalidArgument(_))
    ));
    assert_eq!(device.request_count(), 0);
}

#[tokio::test]
async fn test_rejected_command_is_an_error() {
    let (device, vacuum) = setup().await;
    device.on(
        "app_charge",
        Reply::Error {
            code: -10007,
            message: "busy".into(),
        },
    );

    assert!(matches!(vacuum.go_home().await, Err(ClientError::Device(_))));
}

#[tokio::test]
async fn test_unanswered_command_is_an_error() {
    let (device, vacuum) = setup().await;
    device.on("find_me", Reply::Silent);

    assert!(matches!(
        vacuum.find_me().await,
        Err(ClientError::RequestTimeout { .. })
    ));
}

// ============================================================================
// Status and callbacks
// ============================================================================

#[tokio::test]
async fn test_status_query_fires_callbacks_on_change() {
    let (device, vacuum) = setup().await;
    device.on("get_prop", status_reply(91, 8, 0));

    let batteries = Arc::new(Mutex::new(Vec::new()));
    let errors = Arc::new(Mutex::new(Vec::new()));
    let statuses = Arc::new(Mutex::new(0u32));
    {
        let batteries = batteries.clone();
        vacuum.on_battery(move |_, level| batteries.lock().push(level));
        let errors = errors.clone();
        vacuum.on_error(move |_, code| errors.lock().push(code));
        let statuses = statuses.clone();
        vacuum.on_status(move |_, _| *statuses.lock() += 1);
    }

    let status = vacuum.get_device_status().await.unwrap().unwrap();
    assert_eq!(status.battery, Some(91));
    assert_eq!(status.state, Some(8));
    assert!(device.requests_for("get_prop")[0].encrypted);

    // Same answer again: nothing changed
    vacuum.get_device_status().await.unwrap();
    assert_eq!(*batteries.lock(), vec![91]);
    assert!(errors.lock().is_empty());
    assert_eq!(*statuses.lock(), 1);

    device.on("get_prop", status_reply(90, 12, 3));
    vacuum.get_device_status().await.unwrap();
    assert_eq!(*batteries.lock(), vec![91, 90]);
    assert_eq!(*errors.lock(), vec![3]);
    assert_eq!(*statuses.lock(), 2);
}

#[tokio::test]
async fn test_push_updates_merge_into_status() {
    let (device, vacuum) = setup().await;
    device.on("get_prop", status_reply(80, 8, 0));
    vacuum.get_device_status().await.unwrap();

    let batteries = Arc::new(Mutex::new(Vec::new()));
    {
        let batteries = batteries.clone();
        vacuum.on_battery(move |duid, level| batteries.lock().push((duid.to_string(), level)));
    }

    let mut dps = BTreeMap::new();
    dps.insert(Protocol::Battery.key(), json!(79));
    dps.insert(Protocol::StatusUpdate.key(), json!(5));
    device.push(dps);

    assert!(
        wait_for(
            || async { !batteries.lock().is_empty() },
            DEFAULT_CHECK_INTERVAL,
            Duration::from_secs(2),
        )
        .await
    );
    assert_eq!(*batteries.lock(), vec![(DUID.to_string(), 79)]);

    let merged = vacuum.last_status().unwrap();
    assert_eq!(merged.battery, Some(79));
    assert_eq!(merged.state, Some(5));
    assert_eq!(merged.error_code, Some(0));
}

#[tokio::test]
async fn test_status_timeout_is_absent() {
    let (device, vacuum) = setup().await;
    device.on("get_prop", Reply::Silent);

    assert!(vacuum.get_device_status().await.unwrap().is_none());
    assert!(vacuum.last_status().is_none());
}

#[tokio::test]
async fn test_status_over_mqtt_needs_cloud() {
    let (device, vacuum) = setup().await;

    assert!(matches!(
        vacuum.get_device_status_over_mqtt().await,
        Err(ClientError::NotConnected(_))
    ));
    assert_eq!(device.request_count(), 0);
}

// ============================================================================
// Queries
// ============================================================================

#[tokio::test]
async fn test_network_info() {
    let (device, vacuum) = setup().await;

    device.on(
        "get_network_info",
        Reply::ok(json!({"ip": "192.168.1.40", "ssid": "home", "rssi": -48})),
    );
    let info = vacuum.get_network_info().await.unwrap().unwrap();
    assert_eq!(info.ip, "192.168.1.40");
    assert_eq!(info.ssid.as_deref(), Some("home"));

    device.on("get_network_info", Reply::ok(json!({"ssid": "home"})));
    assert!(vacuum.get_network_info().await.unwrap().is_none());
}

#[tokio::test]
async fn test_clean_mode_round() {
    let (device, vacuum) = setup().await;
    device.on("get_custom_mode", Reply::ok(json!([102])));
    device.on("get_water_box_custom_mode", Reply::ok(json!([201])));
    device.on("get_mop_mode", Reply::ok(json!([300])));

    let mode = vacuum.get_clean_mode().await.unwrap().unwrap();
    assert_eq!(
        mode,
        CleanMode {
            suction_power: Some(102),
            water_flow: Some(201),
            mop_mode: Some(300),
        }
    );

    vacuum
        .set_clean_mode(CleanMode {
            suction_power: Some(104),
            water_flow: None,
            mop_mode: Some(303),
        })
        .await
        .unwrap();

    assert_eq!(device.requests_for("set_custom_mode")[0].params, json!([104]));
    assert!(device.requests_for("set_water_box_custom_mode").is_empty());
    assert_eq!(device.requests_for("set_mop_mode")[0].params, json!([303]));
}

#[tokio::test]
async fn test_room_mapping() {
    let (device, vacuum) = setup().await;
    device.on("get_room_mapping", Reply::ok(json!([[16, "2362048"], [17, "2362044"]])));

    let rooms = vacuum.get_room_mapping().await.unwrap().unwrap();
    assert_eq!(rooms.len(), 2);
    assert_eq!(rooms[0].segment_id, 16);
    assert_eq!(rooms[1].room_id, "2362044");
}

#[tokio::test]
async fn test_custom_messages() {
    let (device, vacuum) = setup().await;
    device.on("get_consumable", Reply::ok(json!([{"main_brush_work_time": 3600}])));

    let result = vacuum
        .get_custom_message(RequestMessage::new("get_consumable"))
        .await
        .unwrap();
    assert_eq!(result, Some(json!([{"main_brush_work_time": 3600}])));

    vacuum
        .send_custom_message(
            RequestMessage::new("reset_consumable")
                .with_params(json!(["main_brush_work_time"]))
                .secure(),
        )
        .await
        .unwrap();
    let sent = &device.requests_for("reset_consumable")[0];
    assert!(sent.encrypted);
    assert_eq!(sent.params, json!(["main_brush_work_time"]));
}

#[tokio::test]
async fn test_processor_for_unknown_device() {
    let router = Arc::new(ClientRouter::builder().build());
    assert!(matches!(
        MessageProcessor::new(router, "missing"),
        Err(ClientError::NotInitialized(_))
    ));
}
