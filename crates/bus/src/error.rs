//! Error types for the bus core

use thiserror::Error;
use uuid::Uuid;

use weft_message::HandlerError;
use weft_transport::TransportError;

/// Errors surfaced to callers of the bus
#[derive(Debug, Error)]
pub enum BusError {
    /// A mesh or bridge operation was invoked with no transport configured
    #[error("transport not configured")]
    TransportNotConfigured,

    /// No live peer advertises the requested capability
    #[error("tunnel not established")]
    TunnelNotEstablished,

    /// No qualifying message arrived before the deadline
    #[error("timed out waiting for message")]
    WaitTimeout,

    /// Not every mesh connection completed its withdraw in time
    #[error("withdraw timed out with {pending} connection(s) outstanding")]
    WithdrawTimeout { pending: usize },

    /// A peer connection failed during an operation invoked by the caller
    #[error("connection to peer {peer} failed: {source}")]
    Connection {
        peer: Uuid,
        #[source]
        source: TransportError,
    },

    /// Transport-level failure
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A handler reported failure
    #[error(transparent)]
    Handler(#[from] HandlerError),
}

/// Result type alias for bus operations
pub type BusResult<T> = Result<T, BusError>;
