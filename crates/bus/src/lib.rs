//! An embeddable message bus
//!
//! Weft is a local publish/subscribe core that can optionally be meshed
//! across processes over pluggable transports. Consumers talk to the bus
//! through [`Pod`]s; the bus fans every message out to every live pod,
//! retries failed deliveries, and evicts consumers that stay unhealthy. A
//! [`Weft`] instance with a transport configured additionally handshakes
//! with peers, forwards bus traffic across the mesh, tunnels
//! capability-addressed messages point to point, and withdraws gracefully.
//!
//! ```no_run
//! use weft_bus::{Message, Weft, MSG_TYPE_DEFAULT};
//!
//! # async fn example() {
//! let weft = Weft::new();
//!
//! let listener = weft.connect();
//! listener.on(|msg| {
//!     println!("received: {:?}", msg.payload());
//!     Ok(())
//! });
//!
//! let sender = weft.connect();
//! sender.send(Message::new(MSG_TYPE_DEFAULT, "hello, world"));
//! # }
//! ```

mod buffer;
mod bus;
mod error;
mod filter;
mod hub;
mod options;
mod pod;
mod pool;

use std::sync::Arc;

use uuid::Uuid;

use crate::bus::MessageBus;
use crate::hub::Hub;

pub use crate::error::{BusError, BusResult};
pub use crate::options::Options;
pub use crate::pod::{Pod, Receipt};

// the message vocabulary is part of this crate's API
pub use weft_message::{HandlerError, HandlerResult, Message, MsgFunc, MSG_TYPE_DEFAULT};

/// A bus instance: the composition root wiring pods, the dispatch ring, and
/// the mesh hub together
pub struct Weft {
    node_uuid: Uuid,
    bus: Arc<MessageBus>,
    hub: Arc<Hub>,
}

impl Weft {
    /// Create a standalone bus with default options
    ///
    /// Must be called within a tokio runtime.
    pub fn new() -> Self {
        Self::with_options(Options::default())
    }

    /// Create a bus with the given options
    ///
    /// Must be called within a tokio runtime.
    pub fn with_options(options: Options) -> Self {
        let node_uuid = Uuid::new_v4();
        let bus = MessageBus::new(options.bus_config());
        let hub = Hub::new(node_uuid, &options, bus.clone());

        Self {
            node_uuid,
            bus,
            hub,
        }
    }

    /// This node's mesh identity
    pub fn node_uuid(&self) -> Uuid {
        self.node_uuid
    }

    /// Create a pod connected to the bus
    pub fn connect(&self) -> Pod {
        self.bus.connect(false)
    }

    /// Create a pod that is caught up on recent messages when it joins
    pub fn connect_with_replay(&self) -> Pod {
        self.bus.connect(true)
    }

    /// Connect to a remote peer at the given endpoint
    pub async fn connect_endpoint(&self, endpoint: &str) -> BusResult<()> {
        self.hub.connect_endpoint(endpoint, None).await
    }

    /// Connect the bus to a topic of an external bridge system
    pub async fn connect_bridge_topic(&self, topic: &str) -> BusResult<()> {
        self.hub.connect_bridge_topic(topic).await
    }

    /// Send a message directly to one peer advertising the capability,
    /// bypassing the broadcast ring
    pub async fn tunnel(&self, capability: &str, msg: Message) -> BusResult<()> {
        self.hub.tunnel(capability, msg).await
    }

    /// UUIDs of the currently established mesh peers
    pub fn peers(&self) -> Vec<Uuid> {
        self.hub.peers()
    }

    /// Leave the mesh gracefully, notifying every peer
    ///
    /// Returns [`BusError::WithdrawTimeout`] if any connection fails to
    /// complete in time; connections that did complete are cleaned up
    /// regardless.
    pub async fn withdraw(&self) -> BusResult<()> {
        self.hub.withdraw().await
    }

    /// Close every remaining connection without waiting
    pub async fn stop(&self) -> BusResult<()> {
        self.hub.stop().await
    }
}

impl Default for Weft {
    fn default() -> Self {
        Self::new()
    }
}
