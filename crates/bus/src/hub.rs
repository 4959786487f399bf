//! Mesh coordination
//!
//! The hub wires zero or one mesh transport and zero or one discovery plugin
//! into the local bus. It owns the handshake protocol, the UUID-keyed
//! connection table, the topic-keyed bridge table, the per-capability
//! round-robin state for tunneling, and the withdraw protocol.
//!
//! One dedicated pod carries all mesh traffic in both directions: its
//! handler fans every local message out to every live peer, and every
//! inbound peer message is re-injected through its `send`. Because a pod
//! never re-observes a message it sent itself, inbound messages are never
//! echoed back into the mesh.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

use weft_message::Message;
use weft_transport::{
    AckFn, Connection, Discovery, DiscoveryOpts, Handshake, HandshakeAck, IncomingConnectionFn,
    PeerFoundFn, PeerLookupFn, ReceiveFn, TopicConnection, Transport, TransportError,
    TransportOpts, WithdrawSignaler,
};

use crate::bus::MessageBus;
use crate::error::{BusError, BusResult};
use crate::options::Options;
use crate::pod::Pod;

/// How often failed or withdrawn connections are swept out of the table
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Whether two group tags admit a connection between their nodes
fn groups_compatible(a: &str, b: &str) -> bool {
    a == b || a == "*" || b == "*"
}

/// Round-robin ring of peer UUIDs advertising one capability
struct UuidRing {
    entries: Vec<Uuid>,
    cursor: usize,
}

impl UuidRing {
    fn new() -> Self {
        Self {
            entries: Vec::new(),
            cursor: 0,
        }
    }

    fn push(&mut self, uuid: Uuid) {
        if !self.entries.contains(&uuid) {
            self.entries.push(uuid);
        }
    }

    /// The next candidate, wrapping around at the end
    fn next(&mut self) -> Option<Uuid> {
        if self.entries.is_empty() {
            return None;
        }

        if self.cursor >= self.entries.len() {
            self.cursor = 0;
        }

        let uuid = self.entries[self.cursor];
        self.cursor += 1;
        Some(uuid)
    }

    fn remove(&mut self, uuid: Uuid) {
        if let Some(pos) = self.entries.iter().position(|u| *u == uuid) {
            self.entries.remove(pos);
            if pos < self.cursor {
                self.cursor -= 1;
            }
        }
    }
}

/// An established mesh connection and its withdraw state
struct ConnectionHandler {
    uuid: Uuid,
    conn: Arc<dyn Connection>,
    signaler: Arc<WithdrawSignaler>,
}

impl ConnectionHandler {
    async fn close(&self) {
        self.conn.close().await;
    }
}

/// Coordinates mesh transport and discovery plugins for one bus
pub(crate) struct Hub {
    node_uuid: Uuid,
    belongs_to: String,
    capabilities: Vec<String>,
    mesh: Option<Arc<dyn Transport>>,
    bridge: Option<Arc<dyn Transport>>,
    discovery: Option<Arc<dyn Discovery>>,
    port: Option<u16>,
    uri: Option<String>,
    withdraw_timeout: Duration,
    cancel: CancellationToken,
    bus: Arc<MessageBus>,
    /// The hub's own pod; carries mesh traffic in both directions
    pod: Pod,
    connections: RwLock<HashMap<Uuid, Arc<ConnectionHandler>>>,
    bridges: Mutex<HashMap<String, Box<dyn TopicConnection>>>,
    balancer: Mutex<HashMap<String, UuidRing>>,
}

impl Hub {
    /// Create the hub and start its transport, discovery, and sweeper tasks
    pub(crate) fn new(node_uuid: Uuid, options: &Options, bus: Arc<MessageBus>) -> Arc<Self> {
        let pod = bus.connect(false);

        let hub = Arc::new(Self {
            node_uuid,
            belongs_to: options.belongs_to.clone(),
            capabilities: options.capabilities.clone(),
            mesh: options.mesh_transport.clone(),
            bridge: options.bridge_transport.clone(),
            discovery: options.discovery.clone(),
            port: options.port,
            uri: options.uri.clone(),
            withdraw_timeout: options.withdraw_timeout,
            cancel: CancellationToken::new(),
            bus,
            pod,
            connections: RwLock::new(HashMap::new()),
            bridges: Mutex::new(HashMap::new()),
            balancer: Mutex::new(HashMap::new()),
        });

        hub.install_outgoing_handler();
        hub.spawn_plugins();
        hub.spawn_sweeper();

        hub
    }

    /// Fan every local bus message out to all live peer connections
    fn install_outgoing_handler(self: &Arc<Self>) {
        let hub = Arc::downgrade(self);

        self.pod.on(move |msg| {
            if let Some(hub) = hub.upgrade() {
                hub.forward_to_peers(msg);
            }

            Ok(())
        });
    }

    fn forward_to_peers(&self, msg: Message) {
        // snapshot under the read lock; sends are per-peer tasks
        let handlers: Vec<Arc<ConnectionHandler>> =
            self.connections.read().values().cloned().collect();

        for handler in handlers {
            if handler.signaler.peer_withdrawn() {
                continue;
            }

            let msg = msg.clone();
            tokio::spawn(async move {
                if let Err(err) = handler.conn.send(&msg).await {
                    warn!(peer = %handler.uuid, %err, "failed to send to mesh peer");
                    handler.signaler.set_failed();
                }
            });
        }
    }

    /// Start mesh transport, then discovery, then the bridge transport,
    /// whichever of them are configured
    fn spawn_plugins(self: &Arc<Self>) {
        if let Some(mesh) = self.mesh.clone() {
            let opts = TransportOpts {
                node_uuid: self.node_uuid,
                port: self.port,
                uri: self.uri.clone(),
            };

            let incoming: IncomingConnectionFn = {
                let hub = Arc::downgrade(self);
                Arc::new(move |conn| {
                    if let Some(hub) = hub.upgrade() {
                        tokio::spawn(async move {
                            hub.handle_incoming_connection(conn).await;
                        });
                    }
                })
            };

            let peer_lookup: PeerLookupFn = {
                let hub = Arc::downgrade(self);
                Arc::new(move |uuid| {
                    hub.upgrade()
                        .is_some_and(|hub| hub.connections.read().contains_key(&uuid))
                })
            };

            tokio::spawn(async move {
                if let Err(err) = mesh.setup(opts, incoming, peer_lookup).await {
                    error!(%err, "failed to set up mesh transport");
                }
            });

            if let Some(discovery) = self.discovery.clone() {
                let opts = DiscoveryOpts {
                    node_uuid: self.node_uuid,
                    transport_port: self.port,
                    transport_uri: self.uri.clone(),
                };

                let on_peer: PeerFoundFn = {
                    let hub = Arc::downgrade(self);
                    Arc::new(move |endpoint, uuid| {
                        if let Some(hub) = hub.upgrade() {
                            hub.handle_discovered_peer(endpoint, uuid);
                        }
                    })
                };

                tokio::spawn(async move {
                    if let Err(err) = discovery.start(opts, on_peer).await {
                        error!(%err, "failed to start discovery");
                    }
                });
            }
        }

        if let Some(bridge) = self.bridge.clone() {
            let opts = TransportOpts {
                node_uuid: self.node_uuid,
                port: None,
                uri: None,
            };

            // bridge transports accept no mesh connections
            let incoming: IncomingConnectionFn = Arc::new(|_conn| {});
            let peer_lookup: PeerLookupFn = Arc::new(|_uuid| false);

            tokio::spawn(async move {
                if let Err(err) = bridge.setup(opts, incoming, peer_lookup).await {
                    error!(%err, "failed to set up bridge transport");
                }
            });
        }
    }

    /// Periodically close and remove failed or withdrawn connections
    fn spawn_sweeper(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);

        tokio::spawn(async move {
            let mut interval = time::interval(SWEEP_INTERVAL);
            interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

            loop {
                interval.tick().await;

                let Some(hub) = weak.upgrade() else {
                    break;
                };

                let stale: Vec<Uuid> = hub
                    .connections
                    .read()
                    .iter()
                    .filter(|(_, handler)| {
                        handler.signaler.failed() || handler.signaler.peer_withdrawn()
                    })
                    .map(|(uuid, _)| *uuid)
                    .collect();

                for uuid in stale {
                    debug!(peer = %uuid, "sweeping failed or withdrawn connection");
                    hub.remove_mesh_connection(uuid).await;
                }
            }
        });
    }

    fn handle_discovered_peer(self: &Arc<Self>, endpoint: &str, uuid: Uuid) {
        if uuid == self.node_uuid {
            debug!("discovered self, discarding");
            return;
        }

        // reduces the number of extraneous outgoing handshakes that get
        // attempted; the install step resolves any remaining races
        let known_fixed = self
            .connections
            .read()
            .get(&uuid)
            .is_some_and(|handler| !handler.conn.can_replace());
        if known_fixed {
            debug!(peer = %uuid, "discovered known peer, discarding");
            return;
        }

        let hub = self.clone();
        let endpoint = endpoint.to_string();
        tokio::spawn(async move {
            if let Err(err) = hub.connect_endpoint(&endpoint, Some(uuid)).await {
                error!(%err, %endpoint, "failed to connect to discovered peer");
            }
        });
    }

    /// Open an outgoing mesh connection and run the handshake
    pub(crate) async fn connect_endpoint(
        &self,
        endpoint: &str,
        expected_uuid: Option<Uuid>,
    ) -> BusResult<()> {
        let Some(mesh) = self.mesh.clone() else {
            return Err(BusError::TransportNotConfigured);
        };

        debug!(endpoint, "connecting to endpoint");

        let conn = mesh.create_connection(endpoint).await?;
        self.setup_outgoing_connection(conn, expected_uuid).await
    }

    async fn setup_outgoing_connection(
        &self,
        conn: Box<dyn Connection>,
        expected_uuid: Option<Uuid>,
    ) -> BusResult<()> {
        let handshake = Handshake {
            uuid: self.node_uuid,
            belongs_to: self.belongs_to.clone(),
            capabilities: self.capabilities.clone(),
        };

        let ack = match conn.do_outgoing_handshake(&handshake).await {
            Ok(ack) => ack,
            Err(err) => {
                conn.close().await;
                return Err(err.into());
            }
        };

        if !ack.accept {
            debug!("handshake was not accepted, terminating connection");
            conn.close().await;
            return Err(TransportError::HandshakeFailed("handshake not accepted".to_string()).into());
        }

        let uuid = match expected_uuid {
            None => {
                if ack.uuid.is_nil() {
                    error!("handshake ack carried an empty uuid, terminating connection");
                    conn.close().await;
                    return Err(TransportError::HandshakeFailed(
                        "ack carried an empty uuid".to_string(),
                    )
                    .into());
                }

                ack.uuid
            }
            Some(expected) => {
                if ack.uuid != expected {
                    error!("handshake ack did not match the discovered uuid, terminating connection");
                    conn.close().await;
                    return Err(BusError::Connection {
                        peer: expected,
                        source: TransportError::HandshakeFailed(
                            "ack did not match the discovered uuid".to_string(),
                        ),
                    });
                }

                expected
            }
        };

        self.install_connection(conn, uuid, ack.capabilities).await;
        Ok(())
    }

    /// Run the responder side of the handshake for an accepted connection
    async fn handle_incoming_connection(&self, conn: Box<dyn Connection>) {
        let local_uuid = self.node_uuid;
        let local_group = self.belongs_to.clone();
        let local_capabilities = self.capabilities.clone();

        let ack_fn: AckFn = Box::new(move |handshake: &Handshake| {
            let accept = groups_compatible(&handshake.belongs_to, &local_group);

            if accept {
                HandshakeAck {
                    accept: true,
                    uuid: local_uuid,
                    belongs_to: local_group,
                    capabilities: local_capabilities,
                }
            } else {
                HandshakeAck {
                    accept: false,
                    uuid: local_uuid,
                    belongs_to: String::new(),
                    capabilities: Vec::new(),
                }
            }
        });

        let handshake = match conn.do_incoming_handshake(ack_fn).await {
            Ok(handshake) => handshake,
            Err(err) => {
                error!(%err, "incoming handshake failed");
                conn.close().await;
                return;
            }
        };

        if handshake.uuid.is_nil() {
            error!("incoming handshake carried an empty uuid, terminating connection");
            conn.close().await;
            return;
        }

        if !groups_compatible(&handshake.belongs_to, &self.belongs_to) {
            debug!(belongs_to = %handshake.belongs_to, "rejecting connection with incompatible group");
            conn.close().await;
            return;
        }

        self.install_connection(conn, handshake.uuid, handshake.capabilities)
            .await;
    }

    /// Admit a handshaken connection, resolving duplicates
    ///
    /// Concurrent bidirectional discovery of the same peer is safe because
    /// the losing connection is discarded here: an existing connection that
    /// is not replaceable wins over any newcomer.
    async fn install_connection(
        &self,
        conn: Box<dyn Connection>,
        uuid: Uuid,
        capabilities: Vec<String>,
    ) {
        let conn: Arc<dyn Connection> = Arc::from(conn);

        enum Outcome {
            Discard,
            Install(Arc<ConnectionHandler>, Option<Arc<ConnectionHandler>>),
        }

        let outcome = {
            let mut table = self.connections.write();

            match table.get(&uuid) {
                Some(existing) if !existing.conn.can_replace() => Outcome::Discard,
                _ => {
                    let replaced = table.remove(&uuid);

                    let handler = Arc::new(ConnectionHandler {
                        uuid,
                        conn: conn.clone(),
                        signaler: Arc::new(WithdrawSignaler::new(self.cancel.child_token())),
                    });
                    table.insert(uuid, handler.clone());

                    Outcome::Install(handler, replaced)
                }
            }
        };

        match outcome {
            Outcome::Discard => {
                debug!(peer = %uuid, "encountered duplicate connection, discarding");
                conn.close().await;
            }
            Outcome::Install(handler, replaced) => {
                if let Some(replaced) = replaced {
                    debug!(peer = %uuid, "replacing existing connection");
                    replaced.close().await;
                }

                debug!(peer = %uuid, "adding connection");

                // inbound messages re-enter the bus through the hub pod
                let pod = self.pod.clone();
                let receive: ReceiveFn = Arc::new(move |msg: Message| {
                    let _ = pod.send(msg);
                });

                handler.conn.start(receive, handler.signaler.clone());

                let mut balancer = self.balancer.lock();
                for capability in &capabilities {
                    balancer
                        .entry(capability.clone())
                        .or_insert_with(UuidRing::new)
                        .push(uuid);
                }
            }
        }
    }

    async fn remove_mesh_connection(&self, uuid: Uuid) {
        let handler = self.connections.write().remove(&uuid);

        {
            let mut balancer = self.balancer.lock();
            for ring in balancer.values_mut() {
                ring.remove(uuid);
            }
        }

        if let Some(handler) = handler {
            debug!(peer = %uuid, "removing connection");
            handler.close().await;
        }
    }

    /// Open a bridge channel to a topic and pump it through a fresh pod
    pub(crate) async fn connect_bridge_topic(&self, topic: &str) -> BusResult<()> {
        let Some(bridge) = self.bridge.clone() else {
            return Err(BusError::TransportNotConfigured);
        };

        debug!(topic, "connecting to bridge topic");

        let conn = bridge.connect_bridge_topic(topic).await?;
        conn.start(Arc::new(self.bus.connect(false)));
        self.bridges.lock().insert(topic.to_string(), conn);

        Ok(())
    }

    /// Send a message directly to one peer advertising `capability`
    ///
    /// Candidates are drawn round-robin; a peer whose send fails is removed
    /// and the next one tried, until none remain.
    pub(crate) async fn tunnel(&self, capability: &str, msg: Message) -> BusResult<()> {
        loop {
            let candidate = {
                let mut balancer = self.balancer.lock();
                match balancer.get_mut(capability) {
                    Some(ring) => ring.next(),
                    None => return Err(BusError::TunnelNotEstablished),
                }
            };

            let Some(uuid) = candidate else {
                return Err(BusError::TunnelNotEstablished);
            };

            let handler = self.connections.read().get(&uuid).cloned();

            match handler {
                Some(handler) => match handler.conn.send(&msg).await {
                    Ok(()) => return Ok(()),
                    Err(err) => {
                        warn!(peer = %uuid, %err, "tunneled send failed, removing peer");
                        self.remove_mesh_connection(uuid).await;
                    }
                },
                None => {
                    // balancer entry outlived its connection
                    let mut balancer = self.balancer.lock();
                    if let Some(ring) = balancer.get_mut(capability) {
                        ring.remove(uuid);
                    }
                }
            }
        }
    }

    /// Leave the mesh gracefully
    ///
    /// Discovery stops advertising first so no new peers arrive, then every
    /// connection is signaled to notify its peer. Connections that complete
    /// within the timeout are cleaned up either way.
    pub(crate) async fn withdraw(&self) -> BusResult<()> {
        if let Some(discovery) = &self.discovery {
            discovery.stop().await;
        }

        self.cancel.cancel();

        let handlers: Vec<Arc<ConnectionHandler>> =
            self.connections.read().values().cloned().collect();

        let all_done = async {
            for handler in &handlers {
                handler.signaler.done().await;
            }
        };
        let result = time::timeout(self.withdraw_timeout, all_done).await;

        let mut pending = 0;
        for handler in &handlers {
            if handler.signaler.is_done() {
                self.remove_mesh_connection(handler.uuid).await;
            } else {
                pending += 1;
            }
        }

        match result {
            Ok(()) => Ok(()),
            Err(_) => {
                warn!(pending, "withdraw timed out");
                Err(BusError::WithdrawTimeout { pending })
            }
        }
    }

    /// Close every remaining connection without waiting for acknowledgement
    pub(crate) async fn stop(&self) -> BusResult<()> {
        let handlers: Vec<Arc<ConnectionHandler>> = {
            let mut table = self.connections.write();
            table.drain().map(|(_, handler)| handler).collect()
        };
        for handler in handlers {
            handler.close().await;
        }

        let bridges: Vec<Box<dyn TopicConnection>> = {
            let mut table = self.bridges.lock();
            table.drain().map(|(_, conn)| conn).collect()
        };
        for bridge in bridges {
            bridge.close().await;
        }

        self.balancer.lock().clear();

        Ok(())
    }

    /// UUIDs of the currently established mesh peers
    pub(crate) fn peers(&self) -> Vec<Uuid> {
        self.connections.read().keys().copied().collect()
    }
}
