//! Mesh formation, admission, tunneling, withdrawal, and bridging

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use uuid::Uuid;

use weft_bus::{BusError, Message, Options, Weft, MSG_TYPE_DEFAULT};
use weft_transport::{
    AckFn, Connection, Handshake, HandshakeAck, IncomingConnectionFn, PeerLookupFn, PodHandle,
    ReceiveFn, TopicConnection, Transport, TransportError, TransportOpts, WithdrawSignaler,
};
use weft_transport_memory::{MemoryDiscovery, MemoryTransport};

use common::{settle, wait_until};

/// Build a node listening on `uri`
///
/// Every test uses its own non-wildcard group so concurrently running tests
/// sharing the in-process registry cannot mesh with each other.
fn mesh_node(group: &str, uri: &str, capabilities: &[&str]) -> Weft {
    Weft::with_options(
        Options::default()
            .with_belongs_to(group)
            .with_capabilities(capabilities.iter().map(|c| (*c).to_string()))
            .with_mesh_transport(Arc::new(MemoryTransport::default()))
            .with_uri(uri),
    )
}

async fn wait_for_listener(uri: &str) {
    assert!(
        wait_until(|| MemoryTransport::is_registered(uri), Duration::from_secs(5)).await,
        "listener at {uri} never came up"
    );
}

/// Attach a counting consumer to a node
fn counting_pod(weft: &Weft) -> (weft_bus::Pod, Arc<AtomicUsize>) {
    let count = Arc::new(AtomicUsize::new(0));
    let pod = weft.connect();
    {
        let count = count.clone();
        pod.on(move |_msg| {
            count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
    }
    (pod, count)
}

#[tokio::test]
async fn test_mesh_message_flow() {
    let _ = tracing_subscriber::fmt::try_init();

    let a = mesh_node("flow", "mem://flow-a", &[]);
    let b = mesh_node("flow", "mem://flow-b", &[]);
    wait_for_listener("mem://flow-a").await;
    wait_for_listener("mem://flow-b").await;

    a.connect_endpoint("mem://flow-b").await.unwrap();

    assert!(
        wait_until(
            || a.peers().contains(&b.node_uuid()) && b.peers().contains(&a.node_uuid()),
            Duration::from_secs(5)
        )
        .await
    );

    let (_consumer, count) = counting_pod(&b);

    let sender = a.connect();
    sender.send(Message::new(MSG_TYPE_DEFAULT, "across the mesh"));

    assert!(wait_until(|| count.load(Ordering::SeqCst) == 1, Duration::from_secs(5)).await);

    // exactly once: the peer must not echo the message back and forth
    settle().await;
    assert_eq!(count.load(Ordering::SeqCst), 1);

    MemoryTransport::unregister("mem://flow-a");
    MemoryTransport::unregister("mem://flow-b");
}

#[tokio::test]
async fn test_handshake_admission_by_group() {
    let _ = tracing_subscriber::fmt::try_init();

    let red = mesh_node("adm-red", "mem://adm-red", &[]);
    let blue = mesh_node("adm-blue", "mem://adm-blue", &[]);
    wait_for_listener("mem://adm-red").await;
    wait_for_listener("mem://adm-blue").await;

    // different non-wildcard groups never connect
    let result = red.connect_endpoint("mem://adm-blue").await;
    assert!(result.is_err());

    settle().await;
    assert!(red.peers().is_empty());
    assert!(blue.peers().is_empty());

    // a wildcard node connects to anyone
    let anyone = mesh_node("*", "mem://adm-any", &[]);
    wait_for_listener("mem://adm-any").await;

    anyone.connect_endpoint("mem://adm-blue").await.unwrap();
    assert!(
        wait_until(
            || anyone.peers().contains(&blue.node_uuid())
                && blue.peers().contains(&anyone.node_uuid()),
            Duration::from_secs(5)
        )
        .await
    );

    MemoryTransport::unregister("mem://adm-red");
    MemoryTransport::unregister("mem://adm-blue");
    MemoryTransport::unregister("mem://adm-any");
}

#[tokio::test]
async fn test_duplicate_connection_suppressed() {
    let _ = tracing_subscriber::fmt::try_init();

    let a = mesh_node("dup", "mem://dup-a", &[]);
    let b = mesh_node("dup", "mem://dup-b", &[]);
    wait_for_listener("mem://dup-a").await;
    wait_for_listener("mem://dup-b").await;

    a.connect_endpoint("mem://dup-b").await.unwrap();
    assert!(
        wait_until(
            || a.peers().len() == 1 && b.peers().len() == 1,
            Duration::from_secs(5)
        )
        .await
    );

    // the reverse connection handshakes fine but loses to the existing,
    // non-replaceable connection on both sides
    b.connect_endpoint("mem://dup-a").await.unwrap();
    settle().await;
    assert_eq!(a.peers().len(), 1);
    assert_eq!(b.peers().len(), 1);

    // and traffic still flows exactly once over the surviving connection
    let (_consumer, count) = counting_pod(&b);
    a.connect().send(Message::new(MSG_TYPE_DEFAULT, "once"));

    assert!(wait_until(|| count.load(Ordering::SeqCst) == 1, Duration::from_secs(5)).await);
    settle().await;
    assert_eq!(count.load(Ordering::SeqCst), 1);

    MemoryTransport::unregister("mem://dup-a");
    MemoryTransport::unregister("mem://dup-b");
}

#[tokio::test]
async fn test_tunnel_load_balancing_and_failover() {
    let _ = tracing_subscriber::fmt::try_init();

    let a = mesh_node("tun", "mem://tun-a", &[]);
    let b = mesh_node("tun", "mem://tun-b", &["render"]);
    let c = mesh_node("tun", "mem://tun-c", &["render"]);
    wait_for_listener("mem://tun-a").await;
    wait_for_listener("mem://tun-b").await;
    wait_for_listener("mem://tun-c").await;

    a.connect_endpoint("mem://tun-b").await.unwrap();
    a.connect_endpoint("mem://tun-c").await.unwrap();
    assert!(wait_until(|| a.peers().len() == 2, Duration::from_secs(5)).await);

    let (_b_pod, b_count) = counting_pod(&b);
    let (_c_pod, c_count) = counting_pod(&c);

    for i in 0..6 {
        a.tunnel("render", Message::new(MSG_TYPE_DEFAULT, format!("job {i}")))
            .await
            .unwrap();
    }

    // round robin across both advertisers
    assert!(
        wait_until(
            || b_count.load(Ordering::SeqCst) + c_count.load(Ordering::SeqCst) == 6,
            Duration::from_secs(5)
        )
        .await
    );
    assert_eq!(b_count.load(Ordering::SeqCst), 3);
    assert_eq!(c_count.load(Ordering::SeqCst), 3);

    // kill one advertiser; tunneling fails over to the survivor
    c.stop().await.unwrap();
    MemoryTransport::unregister("mem://tun-c");
    drop(c);
    tokio::time::sleep(Duration::from_millis(100)).await;

    for i in 0..4 {
        a.tunnel("render", Message::new(MSG_TYPE_DEFAULT, format!("retry {i}")))
            .await
            .unwrap();
    }

    assert!(wait_until(|| b_count.load(Ordering::SeqCst) == 7, Duration::from_secs(5)).await);
    assert!(wait_until(|| a.peers().len() == 1, Duration::from_secs(5)).await);

    // no advertiser at all is an immediate error
    let result = a
        .tunnel("transcode", Message::new(MSG_TYPE_DEFAULT, "x"))
        .await;
    assert!(matches!(result, Err(BusError::TunnelNotEstablished)));

    MemoryTransport::unregister("mem://tun-a");
    MemoryTransport::unregister("mem://tun-b");
}

#[tokio::test]
async fn test_withdraw_completion() {
    let _ = tracing_subscriber::fmt::try_init();

    let a = mesh_node("leave", "mem://wd-a", &[]);
    let b = mesh_node("leave", "mem://wd-b", &[]);
    wait_for_listener("mem://wd-a").await;
    wait_for_listener("mem://wd-b").await;

    a.connect_endpoint("mem://wd-b").await.unwrap();
    assert!(
        wait_until(
            || a.peers().len() == 1 && b.peers().len() == 1,
            Duration::from_secs(5)
        )
        .await
    );

    a.withdraw().await.unwrap();
    assert!(a.peers().is_empty());

    // the peer observes the withdraw notice and sweeps the connection
    assert!(wait_until(|| b.peers().is_empty(), Duration::from_secs(5)).await);

    MemoryTransport::unregister("mem://wd-a");
    MemoryTransport::unregister("mem://wd-b");
}

/// A connection that handshakes fine but never acknowledges a withdraw
struct UnresponsiveConnection {
    peer: Uuid,
}

#[async_trait]
impl Connection for UnresponsiveConnection {
    fn start(&self, _receive_fn: ReceiveFn, _signaler: Arc<WithdrawSignaler>) {}

    async fn send(&self, _msg: &Message) -> Result<(), TransportError> {
        Ok(())
    }

    fn can_replace(&self) -> bool {
        false
    }

    async fn do_outgoing_handshake(
        &self,
        handshake: &Handshake,
    ) -> Result<HandshakeAck, TransportError> {
        Ok(HandshakeAck {
            accept: true,
            uuid: self.peer,
            belongs_to: handshake.belongs_to.clone(),
            capabilities: Vec::new(),
        })
    }

    async fn do_incoming_handshake(&self, _ack_fn: AckFn) -> Result<Handshake, TransportError> {
        Err(TransportError::HandshakeFailed(
            "outgoing only".to_string(),
        ))
    }

    async fn close(&self) {}
}

struct UnresponsiveTransport {
    peer: Uuid,
}

#[async_trait]
impl Transport for UnresponsiveTransport {
    async fn setup(
        &self,
        _opts: TransportOpts,
        _incoming: IncomingConnectionFn,
        _peer_lookup: PeerLookupFn,
    ) -> Result<(), TransportError> {
        Ok(())
    }

    async fn create_connection(
        &self,
        _endpoint: &str,
    ) -> Result<Box<dyn Connection>, TransportError> {
        Ok(Box::new(UnresponsiveConnection { peer: self.peer }))
    }
}

#[tokio::test]
async fn test_withdraw_timeout() {
    let _ = tracing_subscriber::fmt::try_init();

    let weft = Weft::with_options(
        Options::default()
            .with_mesh_transport(Arc::new(UnresponsiveTransport {
                peer: Uuid::new_v4(),
            }))
            .with_withdraw_timeout(Duration::from_millis(200)),
    );

    weft.connect_endpoint("stub://peer").await.unwrap();
    assert_eq!(weft.peers().len(), 1);

    let result = weft.withdraw().await;
    assert!(matches!(
        result,
        Err(BusError::WithdrawTimeout { pending: 1 })
    ));

    // the unresponsive connection is still there for a hard stop
    assert_eq!(weft.peers().len(), 1);
    weft.stop().await.unwrap();
    assert!(weft.peers().is_empty());
}

#[tokio::test]
async fn test_discovery_forms_mesh() {
    let _ = tracing_subscriber::fmt::try_init();

    let a = Weft::with_options(
        Options::default()
            .with_belongs_to("disco")
            .with_mesh_transport(Arc::new(MemoryTransport::default()))
            .with_uri("mem://disco-a")
            .with_discovery(Arc::new(MemoryDiscovery::with_interval(
                Duration::from_millis(50),
            ))),
    );
    let b = mesh_node("disco", "mem://disco-b", &[]);
    wait_for_listener("mem://disco-a").await;
    wait_for_listener("mem://disco-b").await;

    // discovery reports every endpoint, including a's own; the hub discards
    // the self-discovery and connects to b
    assert!(
        wait_until(
            || a.peers().contains(&b.node_uuid()) && b.peers().contains(&a.node_uuid()),
            Duration::from_secs(5)
        )
        .await
    );

    // repeated discovery ticks must not pile up extra connections
    settle().await;
    assert_eq!(
        a.peers().iter().filter(|u| **u == b.node_uuid()).count(),
        1
    );

    let (_consumer, count) = counting_pod(&b);
    a.connect()
        .send(Message::new(MSG_TYPE_DEFAULT, "found you"));
    assert!(wait_until(|| count.load(Ordering::SeqCst) == 1, Duration::from_secs(5)).await);
    settle().await;
    assert_eq!(count.load(Ordering::SeqCst), 1);

    // withdrawing stops discovery before leaving
    a.withdraw().await.unwrap();

    MemoryTransport::unregister("mem://disco-a");
    MemoryTransport::unregister("mem://disco-b");
}

/// A bridge channel that records outbound bus traffic and injects one
/// inbound topic message
struct RecordingTopicConnection {
    topic: String,
    outbound: Arc<Mutex<Vec<Message>>>,
}

#[async_trait]
impl TopicConnection for RecordingTopicConnection {
    fn start(&self, pod: Arc<dyn PodHandle>) {
        let outbound = self.outbound.clone();
        pod.on(Arc::new(move |msg| {
            outbound.lock().push(msg);
            Ok(())
        }));

        pod.send(Message::new(
            "bridge.topic",
            format!("hello from {}", self.topic),
        ));
    }

    async fn close(&self) {}
}

struct RecordingBridgeTransport {
    outbound: Arc<Mutex<Vec<Message>>>,
}

#[async_trait]
impl Transport for RecordingBridgeTransport {
    async fn setup(
        &self,
        _opts: TransportOpts,
        _incoming: IncomingConnectionFn,
        _peer_lookup: PeerLookupFn,
    ) -> Result<(), TransportError> {
        Ok(())
    }

    async fn create_connection(
        &self,
        _endpoint: &str,
    ) -> Result<Box<dyn Connection>, TransportError> {
        Err(TransportError::ConnectionFailed(
            "bridge transports carry topics, not peers".to_string(),
        ))
    }

    async fn connect_bridge_topic(
        &self,
        topic: &str,
    ) -> Result<Box<dyn TopicConnection>, TransportError> {
        Ok(Box::new(RecordingTopicConnection {
            topic: topic.to_string(),
            outbound: self.outbound.clone(),
        }))
    }
}

#[tokio::test]
async fn test_bridge_topic() {
    let _ = tracing_subscriber::fmt::try_init();

    let outbound = Arc::new(Mutex::new(Vec::new()));
    let weft = Weft::with_options(Options::default().with_bridge_transport(Arc::new(
        RecordingBridgeTransport {
            outbound: outbound.clone(),
        },
    )));

    let topic_count = Arc::new(AtomicUsize::new(0));
    let consumer = weft.connect();
    {
        let topic_count = topic_count.clone();
        consumer.on_type(
            move |_msg| {
                topic_count.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
            &["bridge.topic"],
        );
    }

    weft.connect_bridge_topic("metrics").await.unwrap();

    // the injected topic message reaches local consumers
    assert!(wait_until(|| topic_count.load(Ordering::SeqCst) == 1, Duration::from_secs(5)).await);

    // and outbound bus traffic reaches the bridge, without the bridge's own
    // injection echoing back into it
    let sent = Message::new(MSG_TYPE_DEFAULT, "to the bridge");
    weft.connect().send(sent.clone());

    assert!(
        wait_until(
            || outbound.lock().iter().any(|m| *m == sent),
            Duration::from_secs(5)
        )
        .await
    );
    settle().await;
    assert_eq!(outbound.lock().len(), 1);
}

#[tokio::test]
async fn test_misconfiguration_errors() {
    let _ = tracing_subscriber::fmt::try_init();

    let weft = Weft::new();

    assert!(matches!(
        weft.connect_endpoint("mem://nowhere").await,
        Err(BusError::TransportNotConfigured)
    ));
    assert!(matches!(
        weft.connect_bridge_topic("topic").await,
        Err(BusError::TransportNotConfigured)
    ));
    assert!(matches!(
        weft.tunnel("render", Message::new(MSG_TYPE_DEFAULT, "x"))
            .await,
        Err(BusError::TunnelNotEstablished)
    ));

    // a mesh-only transport refuses bridge duty
    let meshy = Weft::with_options(
        Options::default().with_bridge_transport(Arc::new(MemoryTransport::default())),
    );
    assert!(matches!(
        meshy.connect_bridge_topic("topic").await,
        Err(BusError::Transport(TransportError::NotBridge))
    ));
}
