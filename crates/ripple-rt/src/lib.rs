//! Ripple: a blocking, thread-per-connection WebSocket runtime.
//!
//! ## Modules
//!
//! - [`ws`]: RFC 6455 framing, handshake, connections, server and client
//! - [`transport`]: byte streams a connection runs over (TCP, TLS, in-memory)
//! - [`http`]: the HTTP/1.1 subset the opening handshake needs
//! - [`config`]: server configuration (TOML)
//! - [`error`]: error types
//!
//! Logging goes through `tracing`; installing a subscriber is up to the
//! application.

pub mod config;
pub mod error;
pub mod http;
pub mod transport;
pub mod ws;

pub use config::{HeartbeatConfig, ServerConfig};
pub use error::{HandshakeError, WsError, WsResult};
pub use ws::{
    connect, Callbacks, ClientOptions, CloseCode, Connection, ConnectionId, ConnectionState,
    Handler, Opcode, Registry, Server, ServerHandle,
};
