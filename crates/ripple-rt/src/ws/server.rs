//! WebSocket server: accept loop, per-connection workers, heartbeat.
//!
//! ## Architecture
//!
//! ```text
//! TcpListener (accept loop, own thread or caller's)
//!     |
//!     v  spawn worker per connection (catch_unwind)
//! serve_connection
//!     |
//!     +-- read HTTP request (handshake timeout)
//!     +-- upgrade?  yes -> Connection::accept -> registry.add -> on_connect
//!     |                    -> receive loop -> registry.remove -> on_disconnect
//!     |             no  -> HttpHandler -> write response -> close
//!     +-- malformed upgrade -> 400 Bad Request -> close
//!
//! heartbeat thread (optional): ping every open connection each interval,
//! close with 1001 when a pong is overdue
//! ```

use std::io::BufReader;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::close::CloseCode;
use super::connection::{Connection, ConnectionId, ConnectionOptions, ConnectionState, Role};
use super::handler::Handler;
use super::handshake::{upgrade_key, write_bad_request};
use super::registry::Registry;
use crate::config::{HeartbeatConfig, ServerConfig};
use crate::error::{WsError, WsResult};
use crate::http::{self, HttpHandler, HttpRequest, NotFound};
use crate::transport::{tcp, TransportParts};

/// Keeps the registry in step with connection lifecycles, then forwards
/// every event to the application handler.
struct Dispatch {
    registry: Arc<Registry>,
    app: Arc<dyn Handler>,
}

impl Handler for Dispatch {
    fn on_connect(&self, conn: &Arc<Connection>) {
        self.registry.add(Arc::clone(conn));
        self.app.on_connect(conn);
    }

    fn on_message(&self, conn: &Arc<Connection>, text: &str) {
        self.app.on_message(conn, text);
    }

    fn on_binary(&self, conn: &Arc<Connection>, data: &[u8]) {
        self.app.on_binary(conn, data);
    }

    fn on_disconnect(&self, conn: &Arc<Connection>, code: Option<u16>) {
        self.registry.remove(conn.id());
        self.app.on_disconnect(conn, code);
    }
}

struct Shutdown {
    stopped: AtomicBool,
    /// Dropped on shutdown to wake the heartbeat thread.
    wake: Mutex<Option<Sender<()>>>,
}

/// Cloneable handle for talking to a running server from any thread.
#[derive(Clone)]
pub struct ServerHandle {
    registry: Arc<Registry>,
    local_addr: SocketAddr,
    shutdown: Arc<Shutdown>,
}

impl std::fmt::Debug for ServerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerHandle")
            .field("local_addr", &self.local_addr)
            .field("connections", &self.registry.len())
            .finish()
    }
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    /// Send `text` to every open connection. Returns the failure count.
    pub fn broadcast(&self, text: &str) -> usize {
        self.registry.broadcast(text)
    }

    pub fn send_to(&self, id: ConnectionId, text: &str) -> WsResult<()> {
        match self.registry.get(id) {
            Some(conn) => conn.send_text(text),
            None => Err(WsError::NotOpen(ConnectionState::Closed)),
        }
    }

    /// Start closing connection `id`. Returns `false` if it is not registered.
    pub fn disconnect(&self, id: ConnectionId, code: u16) -> bool {
        match self.registry.get(id) {
            Some(conn) => {
                conn.disconnect(code);
                true
            }
            None => false,
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.shutdown.stopped.load(Ordering::Acquire)
    }

    /// Stop accepting, stop the heartbeat, and send `1001 Going Away` to
    /// every open connection.
    pub fn shutdown(&self) {
        if self.shutdown.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown.wake.lock().take();
        // Unblock the accept loop.
        let _ = TcpStream::connect(self.local_addr);
        for conn in self.registry.snapshot() {
            conn.disconnect(CloseCode::GOING_AWAY);
        }
        info!(addr = %self.local_addr, "server shut down");
    }
}

pub struct Server {
    listener: TcpListener,
    config: ServerConfig,
    options: ConnectionOptions,
    dispatch: Arc<Dispatch>,
    http_handler: Arc<dyn HttpHandler>,
    handle: ServerHandle,
    wake_rx: Receiver<()>,
}

impl Server {
    /// Bind the configured address with a fresh registry.
    pub fn bind(config: ServerConfig, handler: impl Handler) -> WsResult<Server> {
        Self::bind_with_registry(config, Arc::new(Registry::new()), handler)
    }

    /// Bind using a caller-owned registry, so the handler itself can reach
    /// other connections (for example to broadcast).
    pub fn bind_with_registry(
        config: ServerConfig,
        registry: Arc<Registry>,
        handler: impl Handler,
    ) -> WsResult<Server> {
        config.validate()?;
        let listener = TcpListener::bind(config.bind_addr()?)?;
        let local_addr = listener.local_addr()?;
        let (wake_tx, wake_rx) = bounded(0);

        Ok(Server {
            listener,
            options: config.connection_options(),
            config,
            dispatch: Arc::new(Dispatch {
                registry: Arc::clone(&registry),
                app: Arc::new(handler),
            }),
            http_handler: Arc::new(NotFound),
            handle: ServerHandle {
                registry,
                local_addr,
                shutdown: Arc::new(Shutdown {
                    stopped: AtomicBool::new(false),
                    wake: Mutex::new(Some(wake_tx)),
                }),
            },
            wake_rx,
        })
    }

    /// Replace the default `404 Not Found` responder for plain HTTP requests.
    pub fn with_http_handler(mut self, handler: impl HttpHandler) -> Self {
        self.http_handler = Arc::new(handler);
        self
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.handle.local_addr
    }

    pub fn handle(&self) -> ServerHandle {
        self.handle.clone()
    }

    pub fn broadcast(&self, text: &str) -> usize {
        self.handle.broadcast(text)
    }

    pub fn send_to(&self, id: ConnectionId, text: &str) -> WsResult<()> {
        self.handle.send_to(id, text)
    }

    pub fn disconnect(&self, id: ConnectionId, code: u16) -> bool {
        self.handle.disconnect(id, code)
    }

    /// Run the accept loop on a background thread.
    pub fn spawn(self) -> WsResult<ServerHandle> {
        let handle = self.handle();
        thread::Builder::new()
            .name("ws-accept".to_string())
            .spawn(move || {
                if let Err(e) = self.serve() {
                    error!(error = %e, "accept loop failed");
                }
            })?;
        Ok(handle)
    }

    /// Run the accept loop on the calling thread until [`ServerHandle::shutdown`].
    pub fn serve(self) -> WsResult<()> {
        let Server {
            listener,
            config,
            options,
            dispatch,
            http_handler,
            handle,
            wake_rx,
        } = self;
        info!(addr = %handle.local_addr, "WebSocket server listening");

        if let Some(heartbeat) = config.heartbeat {
            let registry = Arc::clone(&handle.registry);
            thread::Builder::new()
                .name("ws-heartbeat".to_string())
                .spawn(move || heartbeat_loop(registry, heartbeat, wake_rx))?;
        }

        let worker = Arc::new(Worker {
            dispatch,
            http_handler,
            options,
            handshake_timeout: config.handshake_timeout(),
        });

        for stream in listener.incoming() {
            if handle.is_stopped() {
                break;
            }
            let stream = match stream {
                Ok(s) => s,
                Err(e) => {
                    error!(error = %e, "accept failed");
                    continue;
                }
            };
            let worker = Arc::clone(&worker);
            let spawned = thread::Builder::new()
                .name("ws-conn".to_string())
                .spawn(move || worker.run(stream));
            if let Err(e) = spawned {
                error!(error = %e, "failed to spawn connection worker");
            }
        }
        Ok(())
    }
}

/// Everything a per-connection worker needs.
struct Worker {
    dispatch: Arc<Dispatch>,
    http_handler: Arc<dyn HttpHandler>,
    options: ConnectionOptions,
    handshake_timeout: Option<std::time::Duration>,
}

impl Worker {
    /// Serve one accepted socket. Panics stay inside this worker.
    fn run(&self, stream: TcpStream) {
        let peer = stream.peer_addr().ok();
        let outcome = catch_unwind(AssertUnwindSafe(|| self.serve_connection(stream)));
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(peer = ?peer, error = %e, "connection ended with error"),
            Err(_) => error!(peer = ?peer, "connection worker panicked"),
        }
    }

    fn serve_connection(&self, stream: TcpStream) -> WsResult<()> {
        let parts = tcp::split(stream)?;
        parts.control.set_read_timeout(self.handshake_timeout)?;
        let mut reader = BufReader::new(parts.reader);

        let request = match http::read_request(&mut reader) {
            Ok(request) => request,
            Err(WsError::Handshake(e)) => {
                let mut writer = parts.writer;
                let _ = write_bad_request(&mut writer, &e.to_string());
                parts.control.close();
                return Err(e.into());
            }
            Err(e) => {
                parts.control.close();
                return Err(e);
            }
        };

        let Some(key) = upgrade_key(&request).map(str::to_string) else {
            let mut writer = parts.writer;
            if wants_websocket(&request) {
                warn!(
                    peer = ?parts.peer_addr,
                    path = %request.path,
                    "rejecting malformed upgrade request"
                );
                let _ = write_bad_request(&mut writer, "invalid WebSocket upgrade request");
            } else {
                let response =
                    self.http_handler.handle(&request).with_header("Connection", "close");
                http::write_response(&mut writer, &response)?;
            }
            parts.control.close();
            return Ok(());
        };

        // The buffered reader may already hold the client's first frames.
        let parts = TransportParts {
            reader: Box::new(reader),
            ..parts
        };
        let dispatch: Arc<dyn Handler> = self.dispatch.clone();
        let options = self.options.clone();
        let conn = Connection::new(Role::Acceptor, parts, request.path, dispatch, options);

        // `on_connect` runs inside `accept`, after the connection is registered.
        let served = catch_unwind(AssertUnwindSafe(|| -> WsResult<()> {
            conn.accept(&key)?;
            conn.run();
            Ok(())
        }));
        match served {
            Ok(result) => result,
            Err(_) => {
                error!(conn_id = %conn.id(), "handler panicked; closing connection");
                conn.terminate(CloseCode::INTERNAL_ERROR, "internal error");
                Ok(())
            }
        }
    }
}

/// Upgrade requested, but not well-formed enough to accept.
fn wants_websocket(request: &HttpRequest) -> bool {
    request
        .headers
        .get("Upgrade")
        .is_some_and(|v| v.trim().eq_ignore_ascii_case("websocket"))
}

fn heartbeat_loop(registry: Arc<Registry>, config: HeartbeatConfig, wake: Receiver<()>) {
    let interval = config.interval();
    let pong_timeout = config.pong_timeout();
    loop {
        match wake.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
        }
        for conn in registry.snapshot() {
            if conn.pong_overdue(pong_timeout) {
                warn!(conn_id = %conn.id(), "pong timeout");
                conn.terminate(CloseCode::GOING_AWAY, "pong timeout");
            } else if conn.is_open() && !conn.awaiting_pong() {
                if let Err(e) = conn.heartbeat_ping() {
                    debug!(conn_id = %conn.id(), error = %e, "heartbeat ping failed");
                }
            }
        }
    }
}
