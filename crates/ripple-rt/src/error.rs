//! Error types for the WebSocket runtime.
//!
//! Three failure families map to three recovery policies:
//!
//! - [`WsError::Protocol`]: the peer sent bytes that violate RFC 6455. The
//!   connection is failed immediately.
//! - [`WsError::Handshake`]: the HTTP upgrade exchange did not produce a
//!   WebSocket session. Reported to whoever started the handshake.
//! - [`WsError::Transport`]: the byte stream itself failed. Treated as a
//!   disconnect of the one affected connection.

use std::io;

use crate::ws::connection::ConnectionState;

/// Errors produced by the frame codec, handshake, and connection layers.
#[derive(Debug, thiserror::Error)]
pub enum WsError {
    /// Malformed or disallowed frame (reserved bits, unknown opcode, oversize
    /// payload, fragmentation violation).
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    /// I/O failure on the underlying stream, including premature end of stream.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    /// An application send was attempted on a connection that is not open.
    #[error("connection is not open (state: {0:?})")]
    NotOpen(ConnectionState),

    #[error("invalid WebSocket URL: {0}")]
    InvalidUrl(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    /// A value passed to `send_json` could not be serialized.
    #[error("JSON encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

impl WsError {
    pub(crate) fn protocol(reason: impl Into<String>) -> Self {
        WsError::Protocol(reason.into())
    }

    /// Whether this error came from the transport rather than the protocol.
    pub fn is_transport(&self) -> bool {
        matches!(self, WsError::Transport(_))
    }
}

/// Reasons an opening handshake can fail.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandshakeError {
    #[error("unexpected status code {0} (expected 101)")]
    UnexpectedStatus(u16),

    #[error("missing {0} header")]
    MissingHeader(&'static str),

    #[error("invalid Upgrade header: {0:?}")]
    InvalidUpgrade(String),

    #[error("Sec-WebSocket-Accept mismatch (expected {expected}, got {actual})")]
    AcceptMismatch { expected: String, actual: String },

    #[error("malformed HTTP response: {0}")]
    MalformedResponse(String),

    #[error("malformed HTTP request: {0}")]
    MalformedRequest(String),
}

/// Convenience alias used throughout the crate.
pub type WsResult<T> = Result<T, WsError>;
