//! Message processor
//!
//! Per-device command façade over the [`ClientRouter`]. Each operation builds a
//! request, sends it through the router and decodes the result into a domain type.
//!
//! Status queries and push notifications feed the optional battery, error and status
//! callbacks. A callback fires only when its datum is present and differs from the
//! last value seen; the first observation counts as a change.

use parking_lot::{Mutex, RwLock};
use robolink_core::{Protocol, RequestMessage, ResponseMessage};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{ClientError, Result};
use crate::listener::{ListenerHandle, MessageListener};
use crate::router::ClientRouter;
use crate::status::{self, CleanMode, DeviceStatus, NetworkInfo, RoomMapping};

/// Battery callback: `(duid, percent)`
pub type BatteryCallback = Arc<dyn Fn(&str, u8) + Send + Sync>;
/// Error callback: `(duid, error code)`
pub type ErrorCallback = Arc<dyn Fn(&str, i64) + Send + Sync>;
/// Status callback: `(duid, merged status)`
pub type StatusCallback = Arc<dyn Fn(&str, &DeviceStatus) + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    battery: Option<BatteryCallback>,
    error: Option<ErrorCallback>,
    status: Option<StatusCallback>,
}

#[derive(Default)]
struct Observed {
    battery: Option<u8>,
    error: Option<i64>,
    status: Option<DeviceStatus>,
}

struct ProcessorState {
    duid: String,
    callbacks: RwLock<Callbacks>,
    observed: Mutex<Observed>,
}

impl ProcessorState {
    /// Record `status` and fire the callbacks whose data changed
    fn observe(&self, status: &DeviceStatus) {
        let (battery, error, changed) = {
            let mut observed = self.observed.lock();

            let battery = status
                .battery
                .filter(|level| observed.battery != Some(*level));
            if battery.is_some() {
                observed.battery = battery;
            }

            let error = status.error_code.filter(|code| observed.error != Some(*code));
            if error.is_some() {
                observed.error = error;
            }

            let changed = observed.status.as_ref() != Some(status);
            if changed {
                observed.status = Some(status.clone());
            }

            (battery, error.filter(|code| *code != 0), changed)
        };

        // Callbacks may re-register, so call them without holding the lock
        let (on_battery, on_error, on_status) = {
            let callbacks = self.callbacks.read();
            (
                callbacks.battery.clone(),
                callbacks.error.clone(),
                callbacks.status.clone(),
            )
        };

        if let (Some(level), Some(callback)) = (battery, on_battery) {
            callback(&self.duid, level);
        }
        if let (Some(code), Some(callback)) = (error, on_error) {
            callback(&self.duid, code);
        }
        if let (true, Some(callback)) = (changed, on_status) {
            callback(&self.duid, status);
        }
    }

    /// Merge pushed data points into the last known status
    fn merge_push(&self, message: &ResponseMessage) -> Option<DeviceStatus> {
        let battery = message
            .get(Protocol::Battery)
            .and_then(Value::as_u64)
            .and_then(|level| u8::try_from(level).ok());
        let error = message.get(Protocol::ErrorCode).and_then(Value::as_i64);
        let state = message.get(Protocol::StatusUpdate).and_then(Value::as_i64);

        if battery.is_none() && error.is_none() && state.is_none() {
            return None;
        }

        let mut merged = self.observed.lock().status.clone().unwrap_or_default();
        if battery.is_some() {
            merged.battery = battery;
        }
        if error.is_some() {
            merged.error_code = error;
        }
        if state.is_some() {
            merged.state = state;
        }
        Some(merged)
    }
}

impl MessageListener for ProcessorState {
    fn on_message(&self, message: &ResponseMessage) {
        if message.duid != self.duid {
            return;
        }
        if let Some(merged) = self.merge_push(message) {
            debug!(duid = %self.duid, "Status push");
            self.observe(&merged);
        }
    }
}

/// Command façade for one device
pub struct MessageProcessor {
    duid: String,
    router: Arc<ClientRouter>,
    state: Arc<ProcessorState>,
    _listener: ListenerHandle,
}

impl MessageProcessor {
    /// Fails with [`ClientError::NotInitialized`] for a device the router does not know
    pub fn new(router: Arc<ClientRouter>, duid: &str) -> Result<Self> {
        if !router.is_registered(duid) {
            return Err(ClientError::NotInitialized(duid.to_string()));
        }

        let state = Arc::new(ProcessorState {
            duid: duid.to_string(),
            callbacks: RwLock::new(Callbacks::default()),
            observed: Mutex::new(Observed::default()),
        });
        let listener = router.register_message_listener(state.clone());

        Ok(Self {
            duid: duid.to_string(),
            router,
            state,
            _listener: listener,
        })
    }

    pub fn duid(&self) -> &str {
        &self.duid
    }

    pub fn router(&self) -> &Arc<ClientRouter> {
        &self.router
    }

    // ========================================================================
    // Callbacks
    // ========================================================================

    pub fn on_battery<F>(&self, callback: F)
    where
        F: Fn(&str, u8) + Send + Sync + 'static,
    {
        self.state.callbacks.write().battery = Some(Arc::new(callback));
    }

    /// Error code 0 (no error) is never reported
    pub fn on_error<F>(&self, callback: F)
    where
        F: Fn(&str, i64) + Send + Sync + 'static,
    {
        self.state.callbacks.write().error = Some(Arc::new(callback));
    }

    pub fn on_status<F>(&self, callback: F)
    where
        F: Fn(&str, &DeviceStatus) + Send + Sync + 'static,
    {
        self.state.callbacks.write().status = Some(Arc::new(callback));
    }

    /// Last status seen through a query or a push
    pub fn last_status(&self) -> Option<DeviceStatus> {
        self.state.observed.lock().status.clone()
    }

    // ========================================================================
    // Cleaning
    // ========================================================================

    pub async fn start_clean(&self) -> Result<()> {
        info!(duid = %self.duid, "Start clean");
        self.command(RequestMessage::new("app_start")).await
    }

    /// Clean only the given room segments, `repeat` passes each
    pub async fn start_room_clean(&self, rooms: &[u32], repeat: u32) -> Result<()> {
        if rooms.is_empty() {
            return Err(ClientError::InvalidArgument(
                "room clean needs at least one room".into(),
            ));
        }

        info!(duid = %self.duid, ?rooms, repeat, "Start room clean");
        self.command(
            RequestMessage::new("app_segment_clean")
                .with_params(json!([{"segments": rooms, "repeat": repeat.max(1)}])),
        )
        .await
    }

    pub async fn pause_clean(&self) -> Result<()> {
        self.command(RequestMessage::new("app_pause")).await
    }

    pub async fn resume_clean(&self) -> Result<()> {
        self.command(RequestMessage::new("app_start")).await
    }

    pub async fn resume_room_clean(&self) -> Result<()> {
        self.command(RequestMessage::new("resume_segment_clean")).await
    }

    pub async fn stop_clean(&self) -> Result<()> {
        self.command(RequestMessage::new("app_stop")).await
    }

    pub async fn go_home(&self) -> Result<()> {
        info!(duid = %self.duid, "Return to dock");
        self.command(RequestMessage::new("app_charge")).await
    }

    pub async fn find_me(&self) -> Result<()> {
        self.command(RequestMessage::new("find_me")).await
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Query status over whichever transport is active; feeds the callbacks
    pub async fn get_device_status(&self) -> Result<Option<DeviceStatus>> {
        let request = RequestMessage::new("get_prop")
            .with_params(json!(["get_status"]))
            .secure();
        self.query_status(request).await
    }

    /// Query status through the cloud relay; feeds the callbacks
    pub async fn get_device_status_over_mqtt(&self) -> Result<Option<DeviceStatus>> {
        self.query_status(RequestMessage::new("get_status").cloud_only())
            .await
    }

    /// `Ok(None)` when the device does not report an address
    pub async fn get_network_info(&self) -> Result<Option<NetworkInfo>> {
        let result = self
            .router
            .get::<Value>(&self.duid, RequestMessage::new("get_network_info").secure())
            .await?;

        let info = result.and_then(NetworkInfo::from_result);
        if info.is_none() {
            debug!(duid = %self.duid, "Network info without ip");
        }
        Ok(info)
    }

    pub async fn get_clean_mode(&self) -> Result<Option<CleanMode>> {
        let suction = self.get_scalar("get_custom_mode").await?;
        let water = self.get_scalar("get_water_box_custom_mode").await?;
        let mop = self.get_scalar("get_mop_mode").await?;

        if suction.is_none() && water.is_none() && mop.is_none() {
            return Ok(None);
        }

        Ok(Some(CleanMode {
            suction_power: suction,
            water_flow: water,
            mop_mode: mop,
        }))
    }

    /// Apply every field that is set
    pub async fn set_clean_mode(&self, mode: CleanMode) -> Result<()> {
        let settings = [
            ("set_custom_mode", mode.suction_power),
            ("set_water_box_custom_mode", mode.water_flow),
            ("set_mop_mode", mode.mop_mode),
        ];

        for (method, value) in settings {
            if let Some(value) = value {
                self.command(RequestMessage::new(method).with_params(json!([value])))
                    .await?;
            }
        }
        Ok(())
    }

    pub async fn get_room_mapping(&self) -> Result<Option<Vec<RoomMapping>>> {
        let result = self
            .router
            .get::<Value>(&self.duid, RequestMessage::new("get_room_mapping"))
            .await?;
        Ok(result.map(RoomMapping::list_from_result))
    }

    // ========================================================================
    // Custom
    // ========================================================================

    /// Send any request and return its raw result (`None` on timeout)
    pub async fn get_custom_message(&self, request: RequestMessage) -> Result<Option<Value>> {
        self.router.get::<Value>(&self.duid, request).await
    }

    /// Send any request, failing unless the device accepts it
    pub async fn send_custom_message(&self, request: RequestMessage) -> Result<()> {
        self.command(request).await
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    async fn command(&self, request: RequestMessage) -> Result<()> {
        let method = request.method.clone();
        let response = self.router.request(&self.duid, request).await?;

        match response.rpc_result() {
            Some(Ok(result)) => {
                debug!(duid = %self.duid, method = %method, ?result, "Command accepted");
                Ok(())
            }
            Some(Err(device_error)) => Err(ClientError::Device(device_error)),
            None => Err(ClientError::UnexpectedResponse(format!(
                "{} answered without a result",
                method
            ))),
        }
    }

    async fn query_status(&self, request: RequestMessage) -> Result<Option<DeviceStatus>> {
        let Some(result) = self.router.get::<Value>(&self.duid, request).await? else {
            return Ok(None);
        };

        let Some(status) = DeviceStatus::from_result(result) else {
            return Err(ClientError::UnexpectedResponse("status is not an object".into()));
        };

        self.state.observe(&status);
        Ok(Some(status))
    }

    async fn get_scalar(&self, method: &str) -> Result<Option<i64>> {
        let result = self
            .router
            .get::<Value>(&self.duid, RequestMessage::new(method))
            .await?;
        Ok(result.as_ref().and_then(status::scalar))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn state() -> ProcessorState {
        ProcessorState {
            duid: "d1".into(),
            callbacks: RwLock::new(Callbacks::default()),
            observed: Mutex::new(Observed::default()),
        }
    }

    fn counting(state: &ProcessorState) -> (Arc<AtomicU32>, Arc<AtomicU32>, Arc<AtomicU32>) {
        let battery = Arc::new(AtomicU32::new(0));
        let error = Arc::new(AtomicU32::new(0));
        let status = Arc::new(AtomicU32::new(0));

        let mut callbacks = state.callbacks.write();
        let b = battery.clone();
        callbacks.battery = Some(Arc::new(move |_: &str, _: u8| {
            b.fetch_add(1, Ordering::SeqCst);
        }));
        let e = error.clone();
        callbacks.error = Some(Arc::new(move |_: &str, _: i64| {
            e.fetch_add(1, Ordering::SeqCst);
        }));
        let s = status.clone();
        callbacks.status = Some(Arc::new(move |_: &str, _: &DeviceStatus| {
            s.fetch_add(1, Ordering::SeqCst);
        }));

        (battery, error, status)
    }

    #[test]
    fn test_callbacks_fire_on_change_only() {
        let state = state();
        let (battery, error, status) = counting(&state);

        let first = DeviceStatus {
            battery: Some(80),
            error_code: Some(0),
            state: Some(8),
            ..Default::default()
        };
        state.observe(&first);
        assert_eq!(battery.load(Ordering::SeqCst), 1);
        assert_eq!(error.load(Ordering::SeqCst), 0, "code 0 is not an error");
        assert_eq!(status.load(Ordering::SeqCst), 1);

        state.observe(&first);
        assert_eq!(battery.load(Ordering::SeqCst), 1);
        assert_eq!(status.load(Ordering::SeqCst), 1);

        let second = DeviceStatus {
            error_code: Some(3),
            ..first.clone()
        };
        state.observe(&second);
        assert_eq!(battery.load(Ordering::SeqCst), 1);
        assert_eq!(error.load(Ordering::SeqCst), 1);
        assert_eq!(status.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_absent_battery_does_not_fire() {
        let state = state();
        let (battery, _, status) = counting(&state);

        state.observe(&DeviceStatus {
            state: Some(3),
            ..Default::default()
        });
        assert_eq!(battery.load(Ordering::SeqCst), 0);
        assert_eq!(status.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_push_merges_into_last_status() {
        let state = state();
        state.observe(&DeviceStatus {
            battery: Some(90),
            state: Some(8),
            ..Default::default()
        });

        let push = ResponseMessage::new("d1", 102).with(Protocol::Battery, json!(42));
        let merged = state.merge_push(&push).unwrap();
        assert_eq!(merged.battery, Some(42));
        assert_eq!(merged.state, Some(8));

        let unrelated = ResponseMessage::new("d1", 102).with(Protocol::MapResponse, json!({}));
        assert!(state.merge_push(&unrelated).is_none());
    }
}
