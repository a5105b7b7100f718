//! Router builder pattern

use robolink_transport::{CloudConfig, LocalConfig};
use std::time::Duration;

use crate::router::{ClientRouter, RouterConfig};

/// Builder for [`ClientRouter`]
pub struct RouterBuilder {
    config: RouterConfig,
}

impl RouterBuilder {
    /// Create a new builder
    pub fn new() -> Self {
        Self {
            config: RouterConfig::default(),
        }
    }

    /// Set how long requests wait for a response
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    /// Set the configuration used for local clients
    pub fn local(mut self, local: LocalConfig) -> Self {
        self.config.local = local;
        self
    }

    /// Enable the cloud relay
    pub fn cloud(mut self, cloud: CloudConfig) -> Self {
        self.config.cloud = Some(cloud);
        self
    }

    /// Set the inbound frame queue depth
    pub fn frame_buffer(mut self, size: usize) -> Self {
        self.config.frame_buffer = size;
        self
    }

    /// Build the router (starts its dispatch task)
    pub fn build(self) -> ClientRouter {
        ClientRouter::new(self.config)
    }
}

impl Default for RouterBuilder {
    fn default() -> Self {
        Self::new()
    }
}
