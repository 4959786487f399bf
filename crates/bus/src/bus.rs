//! The fan-out engine
//!
//! One dedicated dispatch loop per bus drains the inbound queue and walks
//! the whole ring once per message. All traversals are strictly serialized
//! through that loop; it is the sole source of delivery-order determinism.
//! The loop itself never blocks on a slow consumer: every send into a pod is
//! fire-and-forget against the pod's bounded inbound queue.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::warn;

use weft_message::Message;

use crate::buffer::MsgBuffer;
use crate::pod::{Feedback, Pod};
use crate::pool::{ConnectionPool, PodEmitter};

/// Policy knobs the bus core runs with
#[derive(Debug, Clone, Copy)]
pub(crate) struct BusConfig {
    pub(crate) bus_queue_size: usize,
    pub(crate) pod_queue_size: usize,
    pub(crate) high_water_mark: usize,
    pub(crate) replay_buffer_size: usize,
}

/// The local publish/subscribe core
pub(crate) struct MessageBus {
    bus_tx: flume::Sender<Message>,
    pool: Arc<Mutex<ConnectionPool>>,
    config: BusConfig,
}

impl MessageBus {
    /// Create the bus and spawn its dispatch loop
    pub(crate) fn new(config: BusConfig) -> Arc<Self> {
        let (bus_tx, bus_rx) = flume::bounded(config.bus_queue_size);
        let pool = Arc::new(Mutex::new(ConnectionPool::new()));

        let loop_pool = pool.clone();
        let high_water_mark = config.high_water_mark;
        let mut buffer = MsgBuffer::new(config.replay_buffer_size);
        tokio::spawn(async move {
            while let Ok(msg) = bus_rx.recv_async().await {
                {
                    let mut pool = loop_pool.lock();
                    traverse(&mut pool, &buffer, &msg, high_water_mark);
                }

                // buffered after the traversal: a replaying pod gets history
                // first and the current message through the normal send
                buffer.push(msg);
            }
        });

        Arc::new(Self {
            bus_tx,
            pool,
            config,
        })
    }

    /// Create a pod and insert its connection into the ring
    ///
    /// With `replay` set, the connection asks for the recent-message buffer
    /// as soon as it gets a clean traversal.
    pub(crate) fn connect(&self, replay: bool) -> Pod {
        let (msg_tx, msg_rx) = flume::bounded(self.config.pod_queue_size);
        let (feedback_tx, feedback_rx) = flume::bounded(self.config.pod_queue_size);
        let closed = Arc::new(AtomicBool::new(false));
        let kill = Arc::new(Notify::new());

        if replay {
            // seed the request so the first feedback drain sees it
            let _ = feedback_tx.try_send(Feedback::WantsReplay);
        }

        let pod = Pod::new(
            self.bus_tx.clone(),
            msg_rx,
            feedback_tx,
            closed.clone(),
            kill.clone(),
        );

        let emitter = PodEmitter::new(msg_tx, closed, kill);
        self.pool.lock().insert(emitter, feedback_rx);

        pod
    }
}

/// Deliver one message to every live connection in cyclic order
///
/// Per node the order is: health check, then eviction or replay, then flush,
/// then send. Eviction drops the node's buffered failures rather than
/// retrying them forever, and adjusts the remembered start when the start
/// itself is evicted.
fn traverse(pool: &mut ConnectionPool, buffer: &MsgBuffer, msg: &Message, high_water_mark: usize) {
    let Some(mut start) = pool.advance() else {
        return;
    };
    let mut idx = start;

    loop {
        let evict = {
            let conn = pool.get_mut(idx);
            let summary = conn.drain_feedback();
            let evict = summary.disconnected || conn.failed_count() >= high_water_mark;

            if evict {
                if !summary.disconnected {
                    warn!(
                        conn_id = conn.id,
                        failures = conn.failed_count(),
                        "connection reached the high-water mark, evicting"
                    );
                }
            } else {
                if summary.new_failures == 0 {
                    if conn.wants_replay() {
                        for buffered in buffer.iter() {
                            conn.emit(buffered.clone());
                        }
                        conn.grant_replay();
                    }

                    conn.flush_failed();
                }

                conn.emit(msg.clone());
            }

            evict
        };

        if evict {
            let Some(next) = pool.evict(idx) else {
                // the ring is empty now
                return;
            };

            if idx == start {
                // the traversal's anchor is gone; the successor takes over
                // and still gets this message
                start = next;
                idx = next;
                continue;
            }

            if next == start {
                break;
            }
            idx = next;
            continue;
        }

        let next = pool.peek(idx);
        if next == start {
            break;
        }
        idx = next;
    }
}
