//! Device service
//!
//! Owns the router, one [`MessageProcessor`] per configured device and the status
//! pollers. Processor callbacks are republished as [`DeviceNotification`]s on a
//! broadcast channel.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use robolink_client::{
    CleanMode, ClientRouter, ClientTarget, DeviceStatus, MessageProcessor, NetworkInfo,
    RoomMapping, RouterBuilder,
};
use robolink_core::RequestMessage;
use robolink_transport::TransportKind;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::clean_plan::{self, CleanPlan};
use crate::config::{DeviceConfig, ServiceConfig};
use crate::error::{Result, ServiceError};
use crate::poller::{PollKind, StatusPoller};

const NOTIFICATION_CAPACITY: usize = 256;

/// Events delivered to service subscribers
#[derive(Debug, Clone)]
pub enum DeviceNotification {
    Battery { duid: String, level: u8 },
    Error { duid: String, code: i64 },
    Status { duid: String, status: DeviceStatus },
}

impl DeviceNotification {
    pub fn duid(&self) -> &str {
        match self {
            DeviceNotification::Battery { duid, .. }
            | DeviceNotification::Error { duid, .. }
            | DeviceNotification::Status { duid, .. } => duid,
        }
    }
}

/// Runs cloud routines; the account API lives outside this crate
#[async_trait]
pub trait SceneInvoker: Send + Sync {
    async fn execute_scene(&self, scene_id: u64) -> Result<()>;
}

/// Rooms and routines to use for a start request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanSelection {
    pub rooms: Vec<u32>,
    pub routines: Vec<u64>,
}

impl CleanSelection {
    fn from_device(device: &DeviceConfig) -> Self {
        Self {
            rooms: device.selected_rooms.clone(),
            routines: device.selected_routines.clone(),
        }
    }
}

/// One line of `devices` output
#[derive(Debug, Clone)]
pub struct DeviceSummary {
    pub duid: String,
    pub name: String,
    pub cloud_only: bool,
    pub transport: Option<TransportKind>,
}

pub struct DeviceService {
    config: ServiceConfig,
    router: Arc<ClientRouter>,
    processors: DashMap<String, Arc<MessageProcessor>>,
    pollers: Mutex<Vec<StatusPoller>>,
    notifications: broadcast::Sender<DeviceNotification>,
    scenes: Option<Arc<dyn SceneInvoker>>,
}

impl DeviceService {
    /// Build the service and its router. Must be called inside a tokio runtime.
    pub fn new(config: ServiceConfig) -> Self {
        let mut builder = RouterBuilder::new()
            .request_timeout(config.request_timeout())
            .local(config.local.to_local_config());
        if let Some(cloud) = &config.cloud {
            builder = builder.cloud(cloud.clone());
        }

        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);

        Self {
            router: Arc::new(builder.build()),
            config,
            processors: DashMap::new(),
            pollers: Mutex::new(Vec::new()),
            notifications,
            scenes: None,
        }
    }

    pub fn with_scene_invoker(mut self, invoker: Arc<dyn SceneInvoker>) -> Self {
        self.scenes = Some(invoker);
        self
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn router(&self) -> &Arc<ClientRouter> {
        &self.router
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeviceNotification> {
        self.notifications.subscribe()
    }

    /// Register and connect every configured device, then start polling.
    ///
    /// Devices that end up with no working transport are logged and skipped by
    /// the pollers; they stay registered.
    pub async fn start(&self) -> Result<()> {
        for device in &self.config.devices {
            self.register(device)?;
        }

        self.router.connect().await?;

        for device in &self.config.devices {
            let processor = Arc::new(MessageProcessor::new(self.router.clone(), &device.duid)?);
            self.attach_callbacks(&processor);
            self.processors.insert(device.duid.clone(), processor.clone());

            let kinds = self.poll_kinds(&device.duid);
            if kinds.is_empty() {
                warn!(duid = %device.duid, name = %device.name, "Device unreachable, not polling");
                continue;
            }

            let poller = StatusPoller::start(processor, self.config.refresh_interval(), &kinds);
            debug!(duid = %device.duid, tasks = poller.task_count(), "Status poller started");
            self.pollers.lock().push(poller);
        }

        info!(
            devices = self.config.devices.len(),
            unreachable = self.unreachable_devices().len(),
            "Device service started"
        );
        Ok(())
    }

    fn register(&self, device: &DeviceConfig) -> Result<()> {
        let record = device.record();
        let cloud_only = record.cloud_only();
        if !self.router.register_device(record.identity(), cloud_only) {
            debug!(duid = %device.duid, "Device already registered");
        }

        match (&device.ip, cloud_only) {
            (Some(ip), false) => {
                self.router
                    .register_client(&device.duid, ClientTarget::Local { ip: ip.clone() })?;
            }
            (None, false) if self.config.cloud.is_none() => {
                warn!(duid = %device.duid, "No ip and no cloud credentials");
            }
            _ => {}
        }

        if self.config.cloud.is_some() {
            self.router.register_client(&device.duid, ClientTarget::Cloud)?;
        } else if cloud_only {
            warn!(duid = %device.duid, "Cloud-only device without cloud credentials");
        }
        Ok(())
    }

    fn attach_callbacks(&self, processor: &MessageProcessor) {
        let tx = self.notifications.clone();
        processor.on_battery(move |duid, level| {
            let _ = tx.send(DeviceNotification::Battery {
                duid: duid.to_string(),
                level,
            });
        });

        let tx = self.notifications.clone();
        processor.on_error(move |duid, code| {
            let _ = tx.send(DeviceNotification::Error {
                duid: duid.to_string(),
                code,
            });
        });

        let tx = self.notifications.clone();
        processor.on_status(move |duid, status| {
            let _ = tx.send(DeviceNotification::Status {
                duid: duid.to_string(),
                status: status.clone(),
            });
        });
    }

    fn poll_kinds(&self, duid: &str) -> Vec<PollKind> {
        let mut kinds = Vec::new();
        if !self.router.is_cloud_only(duid) && self.router.is_local_connected(duid) {
            kinds.push(PollKind::Local);
        }
        if self.router.is_cloud_connected() {
            kinds.push(PollKind::Cloud);
        }
        kinds
    }

    /// Configured devices no transport can currently reach
    pub fn unreachable_devices(&self) -> Vec<String> {
        self.config
            .devices
            .iter()
            .filter(|device| !self.router.is_reachable(&device.duid))
            .map(|device| device.duid.clone())
            .collect()
    }

    pub fn devices(&self) -> Vec<DeviceSummary> {
        self.config
            .devices
            .iter()
            .map(|device| DeviceSummary {
                duid: device.duid.clone(),
                name: device.record().display_name().to_string(),
                cloud_only: self.router.is_cloud_only(&device.duid),
                transport: self.router.active_transport(&device.duid),
            })
            .collect()
    }

    pub fn processor(&self, duid: &str) -> Option<Arc<MessageProcessor>> {
        let processor = self.processors.get(duid).map(|entry| entry.value().clone());
        if processor.is_none() {
            warn!(duid, "Unknown or uninitialized device");
        }
        processor
    }

    // ========================================================================
    // Cleaning
    // ========================================================================

    /// Start cleaning with `selection`, or the device's configured selection.
    ///
    /// Returns the plan that was carried out. A conflicting selection is logged and
    /// returned without touching the device.
    pub async fn start_clean(
        &self,
        duid: &str,
        selection: Option<CleanSelection>,
    ) -> Result<Option<CleanPlan>> {
        let (Some(processor), Some(device)) = (self.processor(duid), self.config.device(duid))
        else {
            return Ok(None);
        };

        let selection = selection.unwrap_or_else(|| CleanSelection::from_device(device));
        let supported_routines: Vec<u64> = device.routines.iter().map(|routine| routine.id).collect();
        let plan = clean_plan::plan(
            &selection.rooms,
            &device.rooms,
            &selection.routines,
            &supported_routines,
        );

        match &plan {
            CleanPlan::Global => processor.start_clean().await?,
            CleanPlan::Rooms(rooms) => processor.start_room_clean(rooms, 1).await?,
            CleanPlan::Scene(id) => {
                let invoker = self
                    .scenes
                    .as_ref()
                    .ok_or_else(|| ServiceError::Scene("no scene invoker configured".into()))?;
                info!(duid, scene = id, "Running routine");
                invoker.execute_scene(*id).await?;
            }
            CleanPlan::Conflict(reason) => {
                warn!(duid, "Clean not started: {}", reason);
            }
        }
        Ok(Some(plan))
    }

    /// Resume with the variant matching the configured selection
    pub async fn resume_clean(&self, duid: &str) -> Result<Option<()>> {
        let (Some(processor), Some(device)) = (self.processor(duid), self.config.device(duid))
        else {
            return Ok(None);
        };

        match clean_plan::plan(&device.selected_rooms, &device.rooms, &[], &[]) {
            CleanPlan::Rooms(_) => processor.resume_room_clean().await?,
            _ => processor.resume_clean().await?,
        }
        Ok(Some(()))
    }

    pub async fn pause_clean(&self, duid: &str) -> Result<Option<()>> {
        let Some(processor) = self.processor(duid) else {
            return Ok(None);
        };
        processor.pause_clean().await?;
        Ok(Some(()))
    }

    pub async fn stop_clean(&self, duid: &str) -> Result<Option<()>> {
        let Some(processor) = self.processor(duid) else {
            return Ok(None);
        };
        processor.stop_clean().await?;
        Ok(Some(()))
    }

    pub async fn go_home(&self, duid: &str) -> Result<Option<()>> {
        let Some(processor) = self.processor(duid) else {
            return Ok(None);
        };
        processor.go_home().await?;
        Ok(Some(()))
    }

    pub async fn find_me(&self, duid: &str) -> Result<Option<()>> {
        let Some(processor) = self.processor(duid) else {
            return Ok(None);
        };
        processor.find_me().await?;
        Ok(Some(()))
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Cloud-only devices use the relay query, everything else the local one
    pub async fn status(&self, duid: &str) -> Result<Option<DeviceStatus>> {
        let Some(processor) = self.processor(duid) else {
            return Ok(None);
        };

        if self.router.is_cloud_only(duid) {
            return Ok(processor.get_device_status_over_mqtt().await?);
        }
        Ok(processor.get_device_status().await?)
    }

    pub async fn network_info(&self, duid: &str) -> Result<Option<NetworkInfo>> {
        let Some(processor) = self.processor(duid) else {
            return Ok(None);
        };
        Ok(processor.get_network_info().await?)
    }

    pub async fn clean_mode(&self, duid: &str) -> Result<Option<CleanMode>> {
        let Some(processor) = self.processor(duid) else {
            return Ok(None);
        };
        Ok(processor.get_clean_mode().await?)
    }

    pub async fn set_clean_mode(&self, duid: &str, mode: CleanMode) -> Result<Option<()>> {
        let Some(processor) = self.processor(duid) else {
            return Ok(None);
        };
        processor.set_clean_mode(mode).await?;
        Ok(Some(()))
    }

    pub async fn room_mapping(&self, duid: &str) -> Result<Option<Vec<RoomMapping>>> {
        let Some(processor) = self.processor(duid) else {
            return Ok(None);
        };
        Ok(processor.get_room_mapping().await?)
    }

    pub async fn custom(&self, duid: &str, request: RequestMessage) -> Result<Option<Value>> {
        let Some(processor) = self.processor(duid) else {
            return Ok(None);
        };
        Ok(processor.get_custom_message(request).await?)
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Stop polling and close every connection
    pub async fn shutdown(&self) {
        let pollers = std::mem::take(&mut *self.pollers.lock());
        for poller in pollers {
            poller.shutdown().await;
        }
        self.processors.clear();
        self.router.shutdown().await;
        info!("Device service stopped");
    }

    pub fn poller_count(&self) -> usize {
        self.pollers.lock().len()
    }
}
