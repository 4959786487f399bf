//! The consumer-facing handle to the bus
//!
//! Pods are bidirectional: the bus delivers messages into them, and their
//! owner emits messages through them. They are deliberately lightweight with
//! no persistence of their own; the bus is responsible for any smarts.
//! Inbound messages pass through the pod's filter before reaching the
//! handler, and every delivery outcome is reported back to the ring through
//! the feedback queue.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::Notify;
use tracing::debug;
use uuid::Uuid;

use weft_message::{HandlerError, HandlerResult, Message, MsgFunc};
use weft_transport::PodHandle;

use crate::error::{BusError, BusResult};
use crate::filter::MessageFilter;

/// A delivery outcome reported back to the ring
pub(crate) enum Feedback {
    /// The previous message was handled successfully
    Success,
    /// The handler failed (or was absent); the message needs re-delivery
    Failure(Message),
    /// The pod asks for the recent-message buffer
    WantsReplay,
    /// The pod is done; its ring slot should be dropped
    Disconnected,
}

struct PodInner {
    handler: RwLock<Option<MsgFunc>>,
    filter: MessageFilter,
    bus_tx: flume::Sender<Message>,
    feedback_tx: flume::Sender<Feedback>,
    dead: AtomicBool,
}

/// A bidirectional connection to the bus
///
/// At most one handler is active at a time; installing a new one replaces
/// the previous one and resets the filter. Cloning a `Pod` clones the
/// handle, not the connection.
#[derive(Clone)]
pub struct Pod {
    inner: Arc<PodInner>,
}

impl Pod {
    /// Create a pod and spawn its dispatch loop
    ///
    /// Must be called within a tokio runtime.
    pub(crate) fn new(
        bus_tx: flume::Sender<Message>,
        msg_rx: flume::Receiver<Message>,
        feedback_tx: flume::Sender<Feedback>,
        closed: Arc<AtomicBool>,
        kill: Arc<Notify>,
    ) -> Self {
        let inner = Arc::new(PodInner {
            handler: RwLock::new(None),
            filter: MessageFilter::new(),
            bus_tx,
            feedback_tx,
            dead: AtomicBool::new(false),
        });

        let loop_inner = inner.clone();
        tokio::spawn(async move {
            loop {
                // the closed gate is checked before every receive so an
                // eviction that lands while a message is being handled still
                // stops the loop on the next pass
                if closed.load(Ordering::SeqCst) {
                    break;
                }

                let msg = tokio::select! {
                    biased;
                    _ = kill.notified() => continue,
                    res = msg_rx.recv_async() => match res {
                        Ok(msg) => msg,
                        Err(_) => break,
                    },
                };

                loop_inner.deliver(msg);
            }

            loop_inner.dead.store(true, Ordering::SeqCst);
        });

        Self { inner }
    }

    /// Install the handler called for every message this pod receives
    ///
    /// Replaces any previous handler and resets the filter. To receive with
    /// two different functions, create two pods.
    pub fn on<F>(&self, handler: F)
    where
        F: Fn(Message) -> HandlerResult + Send + Sync + 'static,
    {
        self.install(Arc::new(handler));
    }

    /// Install a handler restricted to the given message types
    ///
    /// Replaces any previous handler and resets the filter to allow-only
    /// mode for `types`.
    pub fn on_type<F>(&self, handler: F, types: &[&str])
    where
        F: Fn(Message) -> HandlerResult + Send + Sync + 'static,
    {
        let mut guard = self.inner.handler.write();
        self.inner.filter.reset_to_types(types);
        *guard = Some(Arc::new(handler));
    }

    /// Block until a qualifying message arrives
    ///
    /// `predicate` runs for each message; returning
    /// [`HandlerError::NotWanted`] keeps waiting. The first other outcome is
    /// propagated to the caller and the handler is uninstalled.
    pub async fn wait_on<F>(&self, predicate: F) -> HandlerResult
    where
        F: Fn(Message) -> HandlerResult + Send + Sync + 'static,
    {
        let rx = self.install_wait_handler(predicate);

        let outcome = match rx.recv_async().await {
            Ok(outcome) => outcome,
            Err(_) => Err(HandlerError::failed("pod closed while waiting")),
        };

        self.clear_handler();
        outcome
    }

    /// Like [`Pod::wait_on`], but gives up after `timeout`
    pub async fn wait_on_for<F>(&self, timeout: Duration, predicate: F) -> BusResult<()>
    where
        F: Fn(Message) -> HandlerResult + Send + Sync + 'static,
    {
        let rx = self.install_wait_handler(predicate);
        let result = tokio::time::timeout(timeout, rx.recv_async()).await;
        self.clear_handler();

        match result {
            Ok(Ok(outcome)) => outcome.map_err(BusError::from),
            Ok(Err(_)) => Err(BusError::from(HandlerError::failed(
                "pod closed while waiting",
            ))),
            Err(_) => Err(BusError::WaitTimeout),
        }
    }

    /// Emit a message to be routed to the bus
    ///
    /// Never blocks the caller; the message is dropped silently if the pod
    /// has been disconnected. The returned receipt can be used to wait for a
    /// reply.
    pub fn send(&self, msg: Message) -> Receipt<'_> {
        let id = msg.id();

        if !self.inner.dead.load(Ordering::SeqCst) {
            // don't let the same message bounce back through this pod
            self.inner.filter.filter_id(id, false);

            match self.inner.bus_tx.try_send(msg) {
                Ok(()) => {}
                Err(flume::TrySendError::Full(msg)) => {
                    let tx = self.inner.bus_tx.clone();
                    match tokio::runtime::Handle::try_current() {
                        Ok(handle) => {
                            handle.spawn(async move {
                                let _ = tx.send_async(msg).await;
                            });
                        }
                        // outside the runtime there is nothing to hand the
                        // send to, so complete it inline
                        Err(_) => {
                            let _ = tx.send(msg);
                        }
                    }
                }
                Err(flume::TrySendError::Disconnected(_)) => {}
            }
        }

        Receipt { id, pod: self }
    }

    /// Send a reply to a previously received message
    pub fn reply_to(
        &self,
        to: &Message,
        msg_type: impl Into<String>,
        payload: impl Into<bytes::Bytes>,
    ) -> Receipt<'_> {
        self.send(Message::reply_to(msg_type, to.id(), payload))
    }

    /// Stop sending and ask the ring to drop this pod's slot
    pub fn disconnect(&self) {
        self.inner.dead.store(true, Ordering::SeqCst);
        self.inner.push_feedback(Feedback::Disconnected);
    }

    /// Whether the pod has been disconnected or evicted
    pub fn is_dead(&self) -> bool {
        self.inner.dead.load(Ordering::SeqCst)
    }

    fn install(&self, handler: MsgFunc) {
        let mut guard = self.inner.handler.write();
        self.inner.filter.reset();
        *guard = Some(handler);
    }

    /// Install a wait wrapper without touching the filter
    fn install_wait_handler<F>(&self, predicate: F) -> flume::Receiver<HandlerResult>
    where
        F: Fn(Message) -> HandlerResult + Send + Sync + 'static,
    {
        let (tx, rx) = flume::bounded(1);

        let wrapper: MsgFunc = Arc::new(move |msg| {
            match predicate(msg) {
                Err(HandlerError::NotWanted) => {}
                outcome => {
                    let _ = tx.try_send(outcome);
                }
            }

            Ok(())
        });

        *self.inner.handler.write() = Some(wrapper);
        rx
    }

    fn clear_handler(&self) {
        *self.inner.handler.write() = None;
    }
}

impl PodInner {
    /// Run one message through the filter and handler, reporting the outcome
    fn deliver(&self, msg: Message) {
        // shared read so a concurrent handler replacement waits for us
        let guard = self.handler.read();

        if !self.filter.allow(&msg) {
            return;
        }

        let feedback = match guard.as_ref() {
            Some(handler) => match handler(msg.clone()) {
                // NotWanted is a waiting marker, never a delivery failure
                Ok(()) | Err(HandlerError::NotWanted) => Feedback::Success,
                Err(err) => {
                    debug!(msg_id = %msg.id(), %err, "handler failed, message will be retried");
                    Feedback::Failure(msg)
                }
            },
            // no handler yet: buffer for re-delivery once one is installed
            None => Feedback::Failure(msg),
        };
        drop(guard);

        self.push_feedback(feedback);
    }

    /// Push feedback without ever blocking the dispatch loop
    fn push_feedback(&self, feedback: Feedback) {
        match self.feedback_tx.try_send(feedback) {
            Ok(()) => {}
            Err(flume::TrySendError::Full(feedback)) => {
                let tx = self.feedback_tx.clone();
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    handle.spawn(async move {
                        let _ = tx.send_async(feedback).await;
                    });
                }
            }
            Err(flume::TrySendError::Disconnected(_)) => {}
        }
    }
}

impl PodHandle for Pod {
    fn send(&self, msg: Message) {
        let _ = Pod::send(self, msg);
    }

    fn on(&self, handler: MsgFunc) {
        self.install(handler);
    }
}

/// References a sent message in the hope of getting a response
///
/// Waiting on a receipt replaces the owning pod's handler, just like
/// [`Pod::wait_on`] does.
pub struct Receipt<'a> {
    id: Uuid,
    pod: &'a Pod,
}

impl Receipt<'_> {
    /// ID of the message that was sent
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Block until a reply to the sent message arrives
    ///
    /// `handler` runs only for messages whose `response_to` names the sent
    /// message; its outcome is propagated like [`Pod::wait_on`].
    pub async fn wait<F>(&self, handler: F) -> HandlerResult
    where
        F: Fn(Message) -> HandlerResult + Send + Sync + 'static,
    {
        let id = self.id;
        self.pod
            .wait_on(move |msg| {
                if msg.response_to() == Some(id) {
                    handler(msg)
                } else {
                    Err(HandlerError::NotWanted)
                }
            })
            .await
    }

    /// Like [`Receipt::wait`], but gives up after `timeout`
    pub async fn wait_for<F>(&self, timeout: Duration, handler: F) -> BusResult<()>
    where
        F: Fn(Message) -> HandlerResult + Send + Sync + 'static,
    {
        let id = self.id;
        self.pod
            .wait_on_for(timeout, move |msg| {
                if msg.response_to() == Some(id) {
                    handler(msg)
                } else {
                    Err(HandlerError::NotWanted)
                }
            })
            .await
    }
}
