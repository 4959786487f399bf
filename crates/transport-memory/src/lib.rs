//! In-process transport and discovery for testing and development
//!
//! Connections are routed between nodes within the same process through a
//! global registry of listening endpoints, so a whole mesh can be stood up
//! inside one test. Frames still carry messages in their canonical byte
//! form; only the transport medium is faked.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use once_cell::sync::Lazy;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use weft_message::Message;
use weft_transport::{
    AckFn, Connection, Discovery, DiscoveryOpts, Handshake, HandshakeAck, IncomingConnectionFn,
    PeerFoundFn, PeerLookupFn, ReceiveFn, Transport, TransportError, TransportOpts,
    WithdrawSignaler,
};

/// Frames per direction a connection can buffer before sends wait
const FRAME_QUEUE_SIZE: usize = 256;

/// Global registry of listening endpoints for cross-connection routing
static REGISTRY: Lazy<DashMap<String, MemoryListener>> = Lazy::new(DashMap::new);

#[derive(Clone)]
struct MemoryListener {
    node_uuid: Uuid,
    conn_tx: flume::Sender<Box<dyn Connection>>,
}

/// What travels between the two halves of a connection pair
enum Frame {
    Handshake(Handshake),
    Ack(HandshakeAck),
    Msg(Bytes),
    Withdraw,
}

/// Configuration for the memory transport
#[derive(Debug, Clone, Default)]
pub struct MemoryOptions {
    /// Whether connections from this transport may be superseded by a newer
    /// connection attempt for the same peer. Defaults to false, the answer a
    /// stateful stream transport would give.
    pub replaceable: bool,
}

/// Memory transport implementation
#[derive(Debug, Clone, Default)]
pub struct MemoryTransport {
    options: MemoryOptions,
}

impl MemoryTransport {
    pub fn new(options: MemoryOptions) -> Self {
        Self { options }
    }

    /// Whether a listener is currently registered at the endpoint
    pub fn is_registered(endpoint: &str) -> bool {
        REGISTRY.contains_key(endpoint)
    }

    /// Drop a listening endpoint from the registry
    pub fn unregister(endpoint: &str) {
        REGISTRY.remove(endpoint);
    }

    /// Clear all registered endpoints (useful between tests)
    pub fn clear_registry() {
        REGISTRY.clear();
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn setup(
        &self,
        opts: TransportOpts,
        incoming: IncomingConnectionFn,
        _peer_lookup: PeerLookupFn,
    ) -> Result<(), TransportError> {
        let uri = opts.uri.clone().ok_or_else(|| {
            TransportError::InvalidEndpoint("memory transport requires a listen uri".to_string())
        })?;

        let (conn_tx, conn_rx) = flume::unbounded();

        match REGISTRY.entry(uri.clone()) {
            Entry::Occupied(_) => {
                return Err(TransportError::InvalidEndpoint(format!(
                    "endpoint {uri} already has a listener"
                )));
            }
            Entry::Vacant(vacant) => {
                vacant.insert(MemoryListener {
                    node_uuid: opts.node_uuid,
                    conn_tx,
                });
            }
        }

        info!(%uri, "memory transport listening");

        // serve until the endpoint is unregistered
        while let Ok(conn) = conn_rx.recv_async().await {
            incoming(conn);
        }

        Ok(())
    }

    async fn create_connection(
        &self,
        endpoint: &str,
    ) -> Result<Box<dyn Connection>, TransportError> {
        let conn_tx = {
            let listener = REGISTRY.get(endpoint).ok_or_else(|| {
                TransportError::ConnectionFailed(format!("no listener at {endpoint}"))
            })?;
            listener.conn_tx.clone()
        };

        debug!(endpoint, "establishing memory connection");

        let (client, server) = MemoryConnection::pair(self.options.replaceable);

        conn_tx
            .send_async(Box::new(server) as Box<dyn Connection>)
            .await
            .map_err(|_| {
                TransportError::ConnectionFailed(format!("listener at {endpoint} is gone"))
            })?;

        Ok(Box::new(client))
    }
}

/// One half of an in-process connection pair
pub struct MemoryConnection {
    tx: flume::Sender<Frame>,
    rx: flume::Receiver<Frame>,
    closed: Arc<AtomicBool>,
    peer_withdrawn: Arc<AtomicBool>,
    shutdown: CancellationToken,
    replaceable: bool,
}

impl MemoryConnection {
    fn pair(replaceable: bool) -> (Self, Self) {
        let (client_tx, server_rx) = flume::bounded(FRAME_QUEUE_SIZE);
        let (server_tx, client_rx) = flume::bounded(FRAME_QUEUE_SIZE);

        let client = Self::half(client_tx, client_rx, replaceable);
        let server = Self::half(server_tx, server_rx, replaceable);

        (client, server)
    }

    fn half(tx: flume::Sender<Frame>, rx: flume::Receiver<Frame>, replaceable: bool) -> Self {
        Self {
            tx,
            rx,
            closed: Arc::new(AtomicBool::new(false)),
            peer_withdrawn: Arc::new(AtomicBool::new(false)),
            shutdown: CancellationToken::new(),
            replaceable,
        }
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    fn start(&self, receive_fn: ReceiveFn, signaler: Arc<WithdrawSignaler>) {
        let tx = self.tx.clone();
        let rx = self.rx.clone();
        let peer_withdrawn = self.peer_withdrawn.clone();
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let mut withdraw_sent = false;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = signaler.withdraw_requested(), if !withdraw_sent => {
                        // notify the peer, then report completion
                        let _ = tx.send_async(Frame::Withdraw).await;
                        signaler.mark_done();
                        withdraw_sent = true;
                    }
                    frame = rx.recv_async() => match frame {
                        Ok(Frame::Msg(bytes)) => match Message::decode(&bytes) {
                            Ok(msg) => receive_fn(msg),
                            Err(err) => warn!(%err, "dropping undecodable frame"),
                        },
                        Ok(Frame::Withdraw) => {
                            debug!("peer has withdrawn, disconnecting");
                            peer_withdrawn.store(true, Ordering::SeqCst);
                            signaler.set_peer_withdrawn();
                            break;
                        }
                        // handshake frames after establishment are stray
                        Ok(_) => {}
                        Err(_) => {
                            if !(signaler.self_withdrawn() || signaler.peer_withdrawn()) {
                                signaler.set_failed();
                            }
                            break;
                        }
                    }
                }
            }
        });
    }

    async fn send(&self, msg: &Message) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed);
        }

        if self.peer_withdrawn.load(Ordering::SeqCst) {
            return Err(TransportError::PeerWithdrawn);
        }

        let bytes = msg
            .encode()
            .map_err(|err| TransportError::Encoding(err.to_string()))?;

        self.tx
            .send_async(Frame::Msg(bytes))
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    fn can_replace(&self) -> bool {
        self.replaceable
    }

    async fn do_outgoing_handshake(
        &self,
        handshake: &Handshake,
    ) -> Result<HandshakeAck, TransportError> {
        self.tx
            .send_async(Frame::Handshake(handshake.clone()))
            .await
            .map_err(|_| TransportError::ConnectionClosed)?;

        match self.rx.recv_async().await {
            Ok(Frame::Ack(ack)) => Ok(ack),
            Ok(_) => Err(TransportError::HandshakeFailed(
                "unexpected frame in place of ack".to_string(),
            )),
            Err(_) => Err(TransportError::ConnectionClosed),
        }
    }

    async fn do_incoming_handshake(&self, ack_fn: AckFn) -> Result<Handshake, TransportError> {
        let handshake = match self.rx.recv_async().await {
            Ok(Frame::Handshake(handshake)) => handshake,
            Ok(_) => {
                return Err(TransportError::HandshakeFailed(
                    "unexpected frame in place of handshake".to_string(),
                ));
            }
            Err(_) => return Err(TransportError::ConnectionClosed),
        };

        let ack = ack_fn(&handshake);

        self.tx
            .send_async(Frame::Ack(ack))
            .await
            .map_err(|_| TransportError::ConnectionClosed)?;

        Ok(handshake)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.shutdown.cancel();
    }
}

/// Discovery over the memory transport's registry
///
/// Reports every registered endpoint on an interval until stopped. The hub
/// is responsible for discarding self-discoveries and known peers.
#[derive(Debug, Clone)]
pub struct MemoryDiscovery {
    interval: Duration,
    shutdown: CancellationToken,
}

impl MemoryDiscovery {
    pub fn new() -> Self {
        Self::with_interval(Duration::from_millis(100))
    }

    pub fn with_interval(interval: Duration) -> Self {
        Self {
            interval,
            shutdown: CancellationToken::new(),
        }
    }
}

impl Default for MemoryDiscovery {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Discovery for MemoryDiscovery {
    async fn start(
        &self,
        _opts: DiscoveryOpts,
        on_peer_found: PeerFoundFn,
    ) -> Result<(), TransportError> {
        info!("memory discovery started");

        loop {
            for entry in REGISTRY.iter() {
                on_peer_found(entry.key(), entry.value().node_uuid);
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }

        Ok(())
    }

    async fn stop(&self) {
        self.shutdown.cancel();
    }
}
