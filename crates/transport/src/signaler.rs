//! Withdraw signaling between the hub and its connections
//!
//! Every mesh connection carries one [`WithdrawSignaler`]. The hub owns the
//! cancellation token side; the connection's receive loop owns the reporting
//! side. Withdraw progress is an explicit state machine rather than loose
//! booleans, because "leaving" has three meaningful points: nothing
//! requested, requested-and-notifying, and complete.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Where a connection currently stands in the withdraw protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WithdrawState {
    /// No withdraw has been requested
    None,
    /// The hub requested withdrawal; the notice may still be in flight
    Requested,
    /// The connection has sent its notice and reported completion
    Complete,
}

/// Shared withdraw/health state for one mesh connection
#[derive(Debug)]
pub struct WithdrawSignaler {
    cancel: CancellationToken,
    done_tx: watch::Sender<bool>,
    peer_withdrawn: AtomicBool,
    failed: AtomicBool,
}

impl WithdrawSignaler {
    /// Create a signaler tied to the hub's cancellation token
    pub fn new(cancel: CancellationToken) -> Self {
        let (done_tx, _) = watch::channel(false);

        Self {
            cancel,
            done_tx,
            peer_withdrawn: AtomicBool::new(false),
            failed: AtomicBool::new(false),
        }
    }

    /// Resolves when the hub requests withdrawal
    pub async fn withdraw_requested(&self) {
        self.cancel.cancelled().await;
    }

    /// Whether this node has begun withdrawing
    pub fn self_withdrawn(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Report that the withdraw notice has been sent to the peer
    pub fn mark_done(&self) {
        // watch send only fails with no receivers, which is fine here
        let _ = self.done_tx.send(true);
    }

    /// Resolves once the connection has completed its withdraw
    pub async fn done(&self) {
        let mut rx = self.done_tx.subscribe();
        // wait_for checks the current value first, so a completed withdraw
        // resolves immediately
        let _ = rx.wait_for(|done| *done).await;
    }

    /// Whether the withdraw has completed
    pub fn is_done(&self) -> bool {
        *self.done_tx.borrow()
    }

    /// Current position in the withdraw protocol
    pub fn state(&self) -> WithdrawState {
        if self.is_done() {
            WithdrawState::Complete
        } else if self.self_withdrawn() {
            WithdrawState::Requested
        } else {
            WithdrawState::None
        }
    }

    /// Record that the peer announced its withdrawal
    pub fn set_peer_withdrawn(&self) {
        self.peer_withdrawn.store(true, Ordering::SeqCst);
    }

    /// Whether the peer has announced its withdrawal
    pub fn peer_withdrawn(&self) -> bool {
        self.peer_withdrawn.load(Ordering::SeqCst)
    }

    /// Record a transport-level failure on this connection
    pub fn set_failed(&self) {
        self.failed.store(true, Ordering::SeqCst);
    }

    /// Whether the connection has failed
    pub fn failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }
}
