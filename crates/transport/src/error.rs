//! Error types shared by transport adapters

use thiserror::Error;

/// Errors a transport, connection, or discovery plugin can report
#[derive(Debug, Error)]
pub enum TransportError {
    /// The underlying channel is gone
    #[error("connection closed")]
    ConnectionClosed,

    /// The peer announced its withdrawal; no further sends will be accepted
    #[error("peer withdrawn")]
    PeerWithdrawn,

    /// An outgoing connection could not be established
    #[error("failed to connect: {0}")]
    ConnectionFailed(String),

    /// The handshake exchange broke down before admission was decided
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// The endpoint is malformed or unknown to this transport
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// Bridge operation requested of a mesh-only transport
    #[error("transport is not a bridge")]
    NotBridge,

    /// A frame could not be encoded or decoded
    #[error("encoding error: {0}")]
    Encoding(String),
}
