//! Bus configuration

use std::sync::Arc;
use std::time::Duration;

use weft_transport::{Discovery, Transport};

use crate::bus::BusConfig;

/// Options for a bus instance
///
/// Every policy constant of the core is set here rather than hard-coded.
/// The defaults match a small single-process deployment; meshed deployments
/// plug in transports and discovery.
#[derive(Clone)]
pub struct Options {
    /// Group tag for mesh admission; `"*"` matches any group
    pub belongs_to: String,
    /// Capabilities this node advertises to the mesh
    pub capabilities: Vec<String>,
    /// Transport used for peer mesh connections
    pub mesh_transport: Option<Arc<dyn Transport>>,
    /// Transport used for topic bridge connections
    pub bridge_transport: Option<Arc<dyn Transport>>,
    /// Peer discovery plugin
    pub discovery: Option<Arc<dyn Discovery>>,
    /// Port the mesh transport should listen on
    pub port: Option<u16>,
    /// URI the mesh transport should listen on or advertise
    pub uri: Option<String>,
    /// Capacity of the bus inbound queue
    pub bus_queue_size: usize,
    /// Capacity of each pod's inbound and feedback queues
    pub pod_queue_size: usize,
    /// Accumulated failures at which a connection is evicted from the ring
    pub high_water_mark: usize,
    /// How many recent messages are kept for replaying to new consumers
    pub replay_buffer_size: usize,
    /// How long a graceful withdraw waits for peers to be notified
    pub withdraw_timeout: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            belongs_to: "*".to_string(),
            capabilities: Vec::new(),
            mesh_transport: None,
            bridge_transport: None,
            discovery: None,
            port: None,
            uri: None,
            bus_queue_size: 256,
            pod_queue_size: 64,
            high_water_mark: 64,
            replay_buffer_size: 128,
            withdraw_timeout: Duration::from_secs(5),
        }
    }
}

impl Options {
    pub fn with_belongs_to(mut self, belongs_to: impl Into<String>) -> Self {
        self.belongs_to = belongs_to.into();
        self
    }

    pub fn with_capabilities(mut self, capabilities: impl IntoIterator<Item = String>) -> Self {
        self.capabilities = capabilities.into_iter().collect();
        self
    }

    pub fn with_mesh_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.mesh_transport = Some(transport);
        self
    }

    pub fn with_bridge_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.bridge_transport = Some(transport);
        self
    }

    pub fn with_discovery(mut self, discovery: Arc<dyn Discovery>) -> Self {
        self.discovery = Some(discovery);
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_uri(mut self, uri: impl Into<String>) -> Self {
        self.uri = Some(uri.into());
        self
    }

    pub fn with_bus_queue_size(mut self, size: usize) -> Self {
        self.bus_queue_size = size;
        self
    }

    pub fn with_pod_queue_size(mut self, size: usize) -> Self {
        self.pod_queue_size = size;
        self
    }

    pub fn with_high_water_mark(mut self, mark: usize) -> Self {
        self.high_water_mark = mark;
        self
    }

    pub fn with_replay_buffer_size(mut self, size: usize) -> Self {
        self.replay_buffer_size = size;
        self
    }

    pub fn with_withdraw_timeout(mut self, timeout: Duration) -> Self {
        self.withdraw_timeout = timeout;
        self
    }

    pub(crate) fn bus_config(&self) -> BusConfig {
        BusConfig {
            bus_queue_size: self.bus_queue_size,
            pod_queue_size: self.pod_queue_size,
            high_water_mark: self.high_water_mark,
            replay_buffer_size: self.replay_buffer_size,
        }
    }
}
