//! The message value type shared by every layer of the bus
//!
//! A [`Message`] is an immutable envelope: identity, optional correlation
//! fields, a free-form type tag, a timestamp, and an opaque payload. The
//! canonical byte form produced by [`Message::encode`] is what transports put
//! on the wire; [`Message::decode`] reverses it losslessly.

use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Message type assigned when the caller doesn't care to pick one
pub const MSG_TYPE_DEFAULT: &str = "weft.message";

/// Outcome of running a handler against one message
pub type HandlerResult = Result<(), HandlerError>;

/// A message handler callback
///
/// Handlers are synchronous on purpose: the pod's dispatch loop invokes them
/// inline and reports the outcome back to the bus, so a handler that blocks
/// stalls only its own pod.
pub type MsgFunc = Arc<dyn Fn(Message) -> HandlerResult + Send + Sync>;

/// Errors a handler can return
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    /// Distinguished marker used by waiting predicates to say "keep waiting";
    /// never treated as a delivery failure
    #[error("message not wanted")]
    NotWanted,

    /// The handler failed; the message will be re-delivered to this consumer
    #[error("handler failed: {0}")]
    Failed(String),
}

impl HandlerError {
    /// Shorthand for a [`HandlerError::Failed`] with the given reason
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed(reason.into())
    }
}

/// Errors arising from the canonical byte form
#[derive(Debug, Error)]
pub enum MessageError {
    /// Message could not be encoded
    #[error("failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),

    /// Bytes did not decode into a message
    #[error("failed to decode message: {0}")]
    Decode(#[source] serde_json::Error),
}

/// An immutable message routed by the bus
///
/// Equality is by `id` alone; two messages with the same id are the same
/// message regardless of payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    id: Uuid,
    /// ID of the causally-prior request, if any
    parent_id: Option<Uuid>,
    /// ID of the message being answered, if any
    response_to: Option<Uuid>,
    msg_type: String,
    timestamp: DateTime<Utc>,
    payload: Bytes,
}

impl Message {
    /// Create a new message with the given type and payload
    pub fn new(msg_type: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self::build(msg_type, None, None, payload)
    }

    /// Create a new message correlated to a causally-prior request
    pub fn with_parent(
        msg_type: impl Into<String>,
        parent_id: Uuid,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self::build(msg_type, Some(parent_id), None, payload)
    }

    /// Create a new message answering a previously received one
    pub fn reply_to(
        msg_type: impl Into<String>,
        response_to: Uuid,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self::build(msg_type, None, Some(response_to), payload)
    }

    fn build(
        msg_type: impl Into<String>,
        parent_id: Option<Uuid>,
        response_to: Option<Uuid>,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            parent_id,
            response_to,
            msg_type: msg_type.into(),
            timestamp: Utc::now(),
            payload: payload.into(),
        }
    }

    /// Unique ID for this message
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// ID of the parent event or request, such as an HTTP request
    pub fn parent_id(&self) -> Option<Uuid> {
        self.parent_id
    }

    /// The ID of the message being responded to, if any
    pub fn response_to(&self) -> Option<Uuid> {
        self.response_to
    }

    /// Type of message (application-specific)
    pub fn msg_type(&self) -> &str {
        &self.msg_type
    }

    /// Time the message was created
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Raw payload bytes
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Encode into the canonical byte form
    pub fn encode(&self) -> Result<Bytes, MessageError> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(MessageError::Encode)
    }

    /// Decode from the canonical byte form
    pub fn decode(bytes: &[u8]) -> Result<Self, MessageError> {
        serde_json::from_slice(bytes).map_err(MessageError::Decode)
    }
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Message {}
