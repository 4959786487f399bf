//! The ring of pod connections the bus fans out over
//!
//! Connections form a single cycle that the dispatch loop walks once per
//! message. The cycle is kept in a slot arena: each slot stores its
//! successor's index explicitly, and evicted slots go on a free list for
//! reuse. Insert, advance, and evict are all O(1) except for eviction's
//! predecessor scan, which is bounded by the ring size.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;
use tracing::debug;

use weft_message::Message;

use crate::pod::Feedback;

/// What draining a connection's feedback queue revealed
pub(crate) struct FeedbackSummary {
    /// Failures newly reported since the last drain
    pub(crate) new_failures: usize,
    /// The pod asked to be dropped from the ring
    pub(crate) disconnected: bool,
}

/// The sending half of a pod's inbound queue, behind the eviction gate
///
/// Once the gate closes, sends are accepted and dropped; they never panic
/// and never deliver into a closed destination.
#[derive(Clone)]
pub(crate) struct PodEmitter {
    tx: flume::Sender<Message>,
    closed: Arc<AtomicBool>,
    kill: Arc<Notify>,
}

impl PodEmitter {
    pub(crate) fn new(tx: flume::Sender<Message>, closed: Arc<AtomicBool>, kill: Arc<Notify>) -> Self {
        Self { tx, closed, kill }
    }

    /// Send fire-and-forget, without ever blocking the dispatch loop
    pub(crate) fn emit(&self, msg: Message) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }

        match self.tx.try_send(msg) {
            Ok(()) => {}
            Err(flume::TrySendError::Full(msg)) => {
                // slow consumer: finish the send in the background so the
                // traversal keeps moving
                let tx = self.tx.clone();
                let closed = self.closed.clone();
                tokio::spawn(async move {
                    if !closed.load(Ordering::SeqCst) {
                        let _ = tx.send_async(msg).await;
                    }
                });
            }
            Err(flume::TrySendError::Disconnected(_)) => {}
        }
    }

    /// Close the gate exactly once and wake the pod's dispatch loop
    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.kill.notify_waiters();
    }
}

/// One node in the ring
pub(crate) struct PodConnection {
    pub(crate) id: u64,
    emitter: PodEmitter,
    feedback_rx: flume::Receiver<Feedback>,
    /// Messages this pod failed to handle, awaiting a clean pass
    failed: Vec<Message>,
    /// Set via feedback; granted on the next clean pass
    wants_replay: bool,
}

impl PodConnection {
    fn new(id: u64, emitter: PodEmitter, feedback_rx: flume::Receiver<Feedback>) -> Self {
        Self {
            id,
            emitter,
            feedback_rx,
            failed: Vec::new(),
            wants_replay: false,
        }
    }

    /// Drain the feedback queue, accumulating failures
    pub(crate) fn drain_feedback(&mut self) -> FeedbackSummary {
        let mut summary = FeedbackSummary {
            new_failures: 0,
            disconnected: false,
        };

        while let Ok(feedback) = self.feedback_rx.try_recv() {
            match feedback {
                Feedback::Success => {}
                Feedback::Failure(msg) => {
                    self.failed.push(msg);
                    summary.new_failures += 1;
                }
                Feedback::WantsReplay => self.wants_replay = true,
                Feedback::Disconnected => summary.disconnected = true,
            }
        }

        summary
    }

    pub(crate) fn failed_count(&self) -> usize {
        self.failed.len()
    }

    pub(crate) fn wants_replay(&self) -> bool {
        self.wants_replay
    }

    pub(crate) fn grant_replay(&mut self) {
        self.wants_replay = false;
    }

    /// Re-send everything in the failed buffer and clear it
    ///
    /// Flushing twice without new failures delivers nothing the second time.
    pub(crate) fn flush_failed(&mut self) {
        for msg in self.failed.drain(..) {
            self.emitter.emit(msg);
        }
    }

    pub(crate) fn emit(&self, msg: Message) {
        self.emitter.emit(msg);
    }
}

struct Slot {
    conn: Option<PodConnection>,
    next: usize,
}

/// A mutable circular sequence of pod connections
pub(crate) struct ConnectionPool {
    slots: Vec<Slot>,
    free: Vec<usize>,
    current: Option<usize>,
    next_id: u64,
}

impl ConnectionPool {
    pub(crate) fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            current: None,
            next_id: 0,
        }
    }

    /// Insert a new connection into the cycle, just after the cursor
    pub(crate) fn insert(
        &mut self,
        emitter: PodEmitter,
        feedback_rx: flume::Receiver<Feedback>,
    ) -> u64 {
        let id = self.next_id;
        self.next_id += 1;

        let conn = PodConnection::new(id, emitter, feedback_rx);

        let idx = match self.free.pop() {
            Some(idx) => {
                self.slots[idx].conn = Some(conn);
                idx
            }
            None => {
                self.slots.push(Slot { conn: Some(conn), next: 0 });
                self.slots.len() - 1
            }
        };

        match self.current {
            Some(current) => {
                self.slots[idx].next = self.slots[current].next;
                self.slots[current].next = idx;
            }
            None => {
                // a brand-new ring of one links to itself
                self.slots[idx].next = idx;
                self.current = Some(idx);
            }
        }

        id
    }

    /// Advance the cursor and return its new position
    pub(crate) fn advance(&mut self) -> Option<usize> {
        let current = self.current?;
        let next = self.slots[current].next;
        self.current = Some(next);
        Some(next)
    }

    /// The successor of `idx`, without moving the cursor
    pub(crate) fn peek(&self, idx: usize) -> usize {
        self.slots[idx].next
    }

    pub(crate) fn get_mut(&mut self, idx: usize) -> &mut PodConnection {
        self.slots[idx]
            .conn
            .as_mut()
            .expect("ring traversal visited a freed slot")
    }

    /// Evict the connection at `idx`: close its gate, unlink it, and drop
    /// its buffered failures
    ///
    /// Returns the successor's index, or `None` when the ring became empty.
    pub(crate) fn evict(&mut self, idx: usize) -> Option<usize> {
        let next = self.slots[idx].next;

        if let Some(conn) = self.slots[idx].conn.take() {
            debug!(conn_id = conn.id, "evicting ring connection");
            conn.emitter.close();
        }

        self.free.push(idx);

        if next == idx {
            // last node standing
            self.current = None;
            return None;
        }

        // predecessor scan; eviction is rare enough that O(ring) is fine
        let mut prev = next;
        while self.slots[prev].next != idx {
            prev = self.slots[prev].next;
        }
        self.slots[prev].next = next;

        if self.current == Some(idx) {
            self.current = Some(prev);
        }

        Some(next)
    }

    /// Number of live connections
    pub(crate) fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.conn.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_emitter() -> (PodEmitter, flume::Receiver<Message>) {
        let (tx, rx) = flume::bounded(16);
        let emitter = PodEmitter::new(
            tx,
            Arc::new(AtomicBool::new(false)),
            Arc::new(Notify::new()),
        );
        (emitter, rx)
    }

    fn pool_with(n: usize) -> (ConnectionPool, Vec<flume::Receiver<Message>>) {
        let mut pool = ConnectionPool::new();
        let mut inboxes = Vec::new();

        for _ in 0..n {
            let (emitter, inbox) = test_emitter();
            let (_fb_tx, fb_rx) = flume::bounded(16);
            pool.insert(emitter, fb_rx);
            inboxes.push(inbox);
        }

        (pool, inboxes)
    }

    /// Walk the ring once from the cursor and collect connection ids
    fn cycle_ids(pool: &mut ConnectionPool) -> Vec<u64> {
        let Some(start) = pool.advance() else {
            return Vec::new();
        };

        let mut ids = vec![pool.get_mut(start).id];
        let mut idx = pool.peek(start);
        while idx != start {
            ids.push(pool.get_mut(idx).id);
            idx = pool.peek(idx);
        }

        ids
    }

    #[test]
    fn test_insert_forms_single_cycle() {
        let (mut pool, _inboxes) = pool_with(4);

        let mut ids = cycle_ids(&mut pool);
        ids.sort_unstable();
        assert_eq!(ids, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_ring_of_one_links_to_itself() {
        let (mut pool, _inboxes) = pool_with(1);

        let idx = pool.advance().unwrap();
        assert_eq!(pool.peek(idx), idx);
    }

    #[test]
    fn test_evict_preserves_cycle() {
        let (mut pool, _inboxes) = pool_with(3);

        let start = pool.advance().unwrap();
        let victim = pool.peek(start);
        pool.evict(victim);

        assert_eq!(pool.len(), 2);
        let ids = cycle_ids(&mut pool);
        assert_eq!(ids.len(), 2);
    }

    #[test]
    fn test_evict_last_empties_ring() {
        let (mut pool, _inboxes) = pool_with(1);

        let idx = pool.advance().unwrap();
        assert_eq!(pool.evict(idx), None);
        assert_eq!(pool.len(), 0);
        assert_eq!(pool.advance(), None);
    }

    #[test]
    fn test_slot_reuse_after_eviction() {
        let (mut pool, _inboxes) = pool_with(2);

        let start = pool.advance().unwrap();
        pool.evict(start);

        let (emitter, _inbox) = test_emitter();
        let (_fb_tx, fb_rx) = flume::bounded(16);
        pool.insert(emitter, fb_rx);

        assert_eq!(pool.len(), 2);
        assert_eq!(cycle_ids(&mut pool).len(), 2);
    }

    #[test]
    fn test_closed_gate_drops_sends() {
        let (emitter, inbox) = test_emitter();
        emitter.close();
        emitter.emit(Message::new("t", "x"));

        assert!(inbox.try_recv().is_err());
    }
}
