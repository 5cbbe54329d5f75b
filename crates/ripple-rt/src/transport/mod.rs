//! Byte-stream transports a [`Connection`](crate::ws::Connection) runs over.
//!
//! A transport is split into independent halves so the receive loop can
//! block in `read` while other threads write frames:
//!
//! ```text
//!   TransportParts
//!     +-- reader   (owned by the receive loop)
//!     +-- writer   (behind the connection's write lock)
//!     +-- control  (shutdown + read timeout, callable from any thread)
//! ```
//!
//! - [`tcp`]: plain `TcpStream`, split with `try_clone`
//! - [`tls`]: client-side rustls session over TCP, for `wss://`
//! - [`memory`]: in-process duplex pipe

pub mod memory;
pub mod tcp;
pub mod tls;

use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::time::Duration;

/// Operations on a transport that do not read or write payload bytes.
pub trait TransportControl: Send + Sync {
    /// Tear the transport down. Blocked reads and writes on either half
    /// return promptly afterwards. Calling it more than once is harmless.
    fn close(&self);

    /// Read timeout for the reader half. `None` blocks indefinitely.
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;
}

/// The split halves of one transport.
pub struct TransportParts {
    pub reader: Box<dyn Read + Send>,
    pub writer: Box<dyn Write + Send>,
    pub control: Box<dyn TransportControl>,
    pub peer_addr: Option<SocketAddr>,
}

impl std::fmt::Debug for TransportParts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportParts")
            .field("peer_addr", &self.peer_addr)
            .finish_non_exhaustive()
    }
}

/// Map a zero duration to "no timeout".
pub(crate) fn timeout_from_millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}
