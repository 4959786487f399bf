//! Plugin contracts for meshing the bus across processes
//!
//! The bus core never touches a socket. Everything it needs from the outside
//! world is expressed here as object-safe traits: a [`Transport`] produces
//! [`Connection`]s to mesh peers (or [`TopicConnection`]s into topic-based
//! bridge systems), and a [`Discovery`] plugin reports peers worth connecting
//! to. Wire-format concerns live entirely inside the implementing adapter.

pub mod error;
pub mod signaler;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use weft_message::{Message, MsgFunc};

pub use error::TransportError;
pub use signaler::{WithdrawSignaler, WithdrawState};

/// Delivers each inbound mesh message to the bus
pub type ReceiveFn = Arc<dyn Fn(Message) + Send + Sync>;

/// Hands a freshly accepted connection to the hub
pub type IncomingConnectionFn = Arc<dyn Fn(Box<dyn Connection>) + Send + Sync>;

/// Asks the hub whether a peer UUID already has an established connection
pub type PeerLookupFn = Arc<dyn Fn(Uuid) -> bool + Send + Sync>;

/// Computes the acknowledgement to transmit for an incoming handshake
pub type AckFn = Box<dyn FnOnce(&Handshake) -> HandshakeAck + Send>;

/// Called by discovery with each `(endpoint, uuid)` peer it finds
pub type PeerFoundFn = Arc<dyn Fn(&str, Uuid) + Send + Sync>;

/// The identity/group/capability exchange that opens every mesh connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Handshake {
    pub uuid: Uuid,
    pub belongs_to: String,
    pub capabilities: Vec<String>,
}

/// The answer to a [`Handshake`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeAck {
    pub accept: bool,
    pub uuid: Uuid,
    pub belongs_to: String,
    pub capabilities: Vec<String>,
}

/// Options handed to [`Transport::setup`]
#[derive(Debug, Clone, Default)]
pub struct TransportOpts {
    /// UUID of the local node
    pub node_uuid: Uuid,
    /// Port to listen on, for transports that serve a listener
    pub port: Option<u16>,
    /// URI to listen on or advertise
    pub uri: Option<String>,
}

/// Options handed to [`Discovery::start`]
#[derive(Debug, Clone, Default)]
pub struct DiscoveryOpts {
    /// UUID of the local node, so discovery can recognize itself
    pub node_uuid: Uuid,
    /// Port the local transport listens on, advertised to peers
    pub transport_port: Option<u16>,
    /// URI the local transport listens on, advertised to peers
    pub transport_uri: Option<String>,
}

/// A transport plugin, mesh or bridge flavored
#[async_trait]
pub trait Transport: Send + Sync {
    /// Bootstrap the transport
    ///
    /// Transports that serve a listener may run indefinitely; the hub spawns
    /// this onto its own task. `incoming` is invoked once per accepted
    /// connection, before any handshake has happened. `peer_lookup` lets the
    /// adapter skip connection churn for peers the hub already holds.
    async fn setup(
        &self,
        opts: TransportOpts,
        incoming: IncomingConnectionFn,
        peer_lookup: PeerLookupFn,
    ) -> Result<(), TransportError>;

    /// Open an outgoing mesh connection to the given endpoint
    async fn create_connection(&self, endpoint: &str)
        -> Result<Box<dyn Connection>, TransportError>;

    /// Open a bridge-style channel into a topic-based external system
    ///
    /// Mesh-only transports keep the default body.
    async fn connect_bridge_topic(
        &self,
        _topic: &str,
    ) -> Result<Box<dyn TopicConnection>, TransportError> {
        Err(TransportError::NotBridge)
    }
}

/// An established (or establishing) channel to one mesh peer
#[async_trait]
pub trait Connection: Send + Sync {
    /// Spawn the receive loop
    ///
    /// Each inbound message goes to `receive_fn`. The connection watches the
    /// signaler: when withdraw is requested it transmits a withdraw notice to
    /// the peer and marks the signaler done; when the peer's withdraw notice
    /// arrives it flags `peer_withdrawn`; read failures flag `failed`.
    fn start(&self, receive_fn: ReceiveFn, signaler: Arc<WithdrawSignaler>);

    /// Send a message to the peer
    ///
    /// Fails with [`TransportError::ConnectionClosed`] or
    /// [`TransportError::PeerWithdrawn`] once the channel is unusable.
    async fn send(&self, msg: &Message) -> Result<(), TransportError>;

    /// Whether a newer connection attempt for the same peer UUID may
    /// supersede this one
    fn can_replace(&self) -> bool;

    /// Run the initiator side of the handshake and return the peer's answer
    async fn do_outgoing_handshake(
        &self,
        handshake: &Handshake,
    ) -> Result<HandshakeAck, TransportError>;

    /// Run the responder side of the handshake
    ///
    /// The connection receives the peer's handshake, transmits the ack
    /// `ack_fn` computes for it, and returns the handshake to the caller.
    async fn do_incoming_handshake(&self, ack_fn: AckFn) -> Result<Handshake, TransportError>;

    /// Close the underlying channel
    async fn close(&self);
}

/// A consumer-facing handle a bridge connection pumps messages through
///
/// This is the slice of the bus's pod surface a bridge needs: inject inbound
/// topic data, and observe outbound bus traffic via a handler.
pub trait PodHandle: Send + Sync {
    /// Emit a message into the bus
    fn send(&self, msg: Message);

    /// Install the handler invoked for each bus message
    fn on(&self, handler: MsgFunc);
}

/// A channel bridging the bus to one topic of an external system
#[async_trait]
pub trait TopicConnection: Send + Sync {
    /// Begin pumping messages between the topic and the given pod
    fn start(&self, pod: Arc<dyn PodHandle>);

    /// Close the bridge channel
    async fn close(&self);
}

/// A peer discovery plugin
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Start discovering, reporting each peer found
    ///
    /// May run indefinitely; the hub spawns it onto its own task.
    async fn start(
        &self,
        opts: DiscoveryOpts,
        on_peer_found: PeerFoundFn,
    ) -> Result<(), TransportError>;

    /// Stop advertising and discovering
    async fn stop(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_wire_round_trip() {
        let handshake = Handshake {
            uuid: Uuid::new_v4(),
            belongs_to: "lab".to_string(),
            capabilities: vec!["render".to_string(), "compress".to_string()],
        };

        let bytes = serde_json::to_vec(&handshake).unwrap();
        let decoded: Handshake = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(decoded.uuid, handshake.uuid);
        assert_eq!(decoded.belongs_to, handshake.belongs_to);
        assert_eq!(decoded.capabilities, handshake.capabilities);
    }

    #[test]
    fn test_ack_rejection_carries_uuid() {
        let ack = HandshakeAck {
            accept: false,
            uuid: Uuid::new_v4(),
            belongs_to: String::new(),
            capabilities: Vec::new(),
        };

        let bytes = serde_json::to_vec(&ack).unwrap();
        let decoded: HandshakeAck = serde_json::from_slice(&bytes).unwrap();

        assert!(!decoded.accept);
        assert!(!decoded.uuid.is_nil());
    }
}
