//! Robolink Service
//!
//! Host-facing layer over [`robolink_client`]:
//! - TOML configuration ([`config`])
//! - Room / routine selection policy ([`clean_plan`])
//! - Periodic status polling ([`poller`])
//! - The [`DeviceService`] tying devices, pollers and notifications together

pub mod clean_plan;
pub mod config;
pub mod error;
pub mod poller;
pub mod service;

pub use clean_plan::CleanPlan;
pub use config::{DeviceConfig, LocalSection, Routine, ServiceConfig};
pub use error::{Result, ServiceError};
pub use poller::{PollKind, StatusPoller, StatusSource};
pub use service::{CleanSelection, DeviceNotification, DeviceService, DeviceSummary, SceneInvoker};
