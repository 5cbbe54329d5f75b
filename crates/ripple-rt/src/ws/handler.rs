//! Application callbacks for connection events.
//!
//! Every method has a no-op default, so a handler only implements the events
//! it cares about. Callbacks run on the connection's receive-loop thread; a
//! slow callback delays that connection's frame processing only.

use std::sync::Arc;

use super::connection::Connection;

/// Receives connection lifecycle and message events.
pub trait Handler: Send + Sync + 'static {
    /// The opening handshake completed; the connection is `Open`.
    fn on_connect(&self, _conn: &Arc<Connection>) {}

    /// A complete text message arrived.
    fn on_message(&self, _conn: &Arc<Connection>, _text: &str) {}

    /// A complete binary message arrived.
    fn on_binary(&self, _conn: &Arc<Connection>, _data: &[u8]) {}

    /// The connection reached `Closed`. Fires exactly once per connection.
    ///
    /// `code` is the status code from the peer's close frame, or `None`
    /// when there was none (transport failure, empty close payload, or a
    /// local forced close).
    fn on_disconnect(&self, _conn: &Arc<Connection>, _code: Option<u16>) {}
}

/// A handler that ignores every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHandler;

impl Handler for NoopHandler {}

type ConnectFn = Box<dyn Fn(&Arc<Connection>) + Send + Sync>;
type MessageFn = Box<dyn Fn(&Arc<Connection>, &str) + Send + Sync>;
type BinaryFn = Box<dyn Fn(&Arc<Connection>, &[u8]) + Send + Sync>;
type DisconnectFn = Box<dyn Fn(&Arc<Connection>, Option<u16>) + Send + Sync>;

/// Closure-backed [`Handler`].
///
/// ```ignore
/// let handler = Callbacks::new()
///     .on_message(|conn, text| { let _ = conn.send_text(text); });
/// ```
#[derive(Default)]
pub struct Callbacks {
    connect: Option<ConnectFn>,
    message: Option<MessageFn>,
    binary: Option<BinaryFn>,
    disconnect: Option<DisconnectFn>,
}

impl Callbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_connect(mut self, f: impl Fn(&Arc<Connection>) + Send + Sync + 'static) -> Self {
        self.connect = Some(Box::new(f));
        self
    }

    pub fn on_message(
        mut self,
        f: impl Fn(&Arc<Connection>, &str) + Send + Sync + 'static,
    ) -> Self {
        self.message = Some(Box::new(f));
        self
    }

    pub fn on_binary(
        mut self,
        f: impl Fn(&Arc<Connection>, &[u8]) + Send + Sync + 'static,
    ) -> Self {
        self.binary = Some(Box::new(f));
        self
    }

    pub fn on_disconnect(
        mut self,
        f: impl Fn(&Arc<Connection>, Option<u16>) + Send + Sync + 'static,
    ) -> Self {
        self.disconnect = Some(Box::new(f));
        self
    }
}

impl Handler for Callbacks {
    fn on_connect(&self, conn: &Arc<Connection>) {
        if let Some(f) = &self.connect {
            f(conn);
        }
    }

    fn on_message(&self, conn: &Arc<Connection>, text: &str) {
        if let Some(f) = &self.message {
            f(conn, text);
        }
    }

    fn on_binary(&self, conn: &Arc<Connection>, data: &[u8]) {
        if let Some(f) = &self.binary {
            f(conn, data);
        }
    }

    fn on_disconnect(&self, conn: &Arc<Connection>, code: Option<u16>) {
        if let Some(f) = &self.disconnect {
            f(conn, code);
        }
    }
}

impl std::fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Callbacks")
            .field("connect", &self.connect.is_some())
            .field("message", &self.message.is_some())
            .field("binary", &self.binary.is_some())
            .field("disconnect", &self.disconnect.is_some())
            .finish()
    }
}
