//! One WebSocket session over one transport.
//!
//! ## State machine
//!
//! ```text
//!   Connecting --handshake ok--> Open --close sent/received--> Closing --> Closed
//!       |                          |                                        ^
//!       +---- disconnect / failure +----------- transport failure ----------+
//! ```
//!
//! The disconnect notification fires exactly once, when `Closed` is reached
//! from an opened connection.
//!
//! ## Locking
//!
//! The write lock is always taken before the state lock. Every frame write
//! re-checks the state under the write lock, so no data frame can follow a
//! close frame on the wire and at most one close frame is ever sent.

use std::fmt;
use std::io::{BufReader, Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::close::{build_close_payload, parse_close_code, CloseCode};
use super::fragment::{Reassembler, Reassembly};
use super::frame::{
    read_frame_limited, write_frame, Frame, Opcode, MAX_CONTROL_PAYLOAD, MAX_PAYLOAD_SIZE,
};
use super::handler::Handler;
use super::handshake::{
    compute_accept_key, generate_key, validate_upgrade_response, write_upgrade_request,
    write_upgrade_response,
};
use crate::error::{WsError, WsResult};
use crate::http;
use crate::transport::{TransportControl, TransportParts};

/// Which end of the handshake this connection played.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Client side: sent the upgrade request, masks every outgoing frame.
    Initiator,
    /// Server side: answered the upgrade request, never masks.
    Acceptor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Process-unique connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        ConnectionId(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-connection limits and timeouts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionOptions {
    /// Largest accepted single-frame payload.
    pub max_frame_size: u64,
    /// Largest accepted reassembled message.
    pub max_message_size: usize,
    /// Fail the connection with 1007 on invalid UTF-8 text instead of
    /// decoding lossily.
    pub strict_utf8: bool,
    /// Read timeout applied once the handshake completes. `None` blocks.
    pub read_timeout: Option<Duration>,
    /// How long to wait for the peer's echo after a local close frame
    /// before closing the transport anyway. `None` waits indefinitely.
    pub close_timeout: Option<Duration>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        ConnectionOptions {
            max_frame_size: MAX_PAYLOAD_SIZE,
            max_message_size: 16 * 1024 * 1024,
            strict_utf8: false,
            read_timeout: None,
            close_timeout: Some(Duration::from_secs(5)),
        }
    }
}

#[derive(Debug, Default)]
struct Heartbeat {
    pending: Option<[u8; 4]>,
    sent_at: Option<Instant>,
}

/// Whether the receive loop keeps going after a frame.
enum Flow {
    Continue,
    Stop,
}

pub struct Connection {
    id: ConnectionId,
    role: Role,
    path: String,
    peer_addr: Option<SocketAddr>,
    state: Mutex<ConnectionState>,
    /// Taken by the receive loop; `None` while it runs.
    reader: Mutex<Option<BufReader<Box<dyn Read + Send>>>>,
    writer: Mutex<Box<dyn Write + Send>>,
    control: Box<dyn TransportControl>,
    handler: Arc<dyn Handler>,
    disconnected: AtomicBool,
    options: ConnectionOptions,
    heartbeat: Mutex<Heartbeat>,
    /// Dropped when the connection closes, waking the close-echo timer.
    close_timer: Mutex<Option<Sender<()>>>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("path", &self.path)
            .field("peer_addr", &self.peer_addr)
            .field("state", &self.state())
            .finish()
    }
}

impl Connection {
    /// Wrap a transport in a new connection in the `Connecting` state.
    ///
    /// `path` is the request target: sent in the upgrade request by an
    /// initiator, recorded from the request by an acceptor.
    pub fn new(
        role: Role,
        parts: TransportParts,
        path: impl Into<String>,
        handler: Arc<dyn Handler>,
        options: ConnectionOptions,
    ) -> Arc<Connection> {
        let TransportParts {
            reader,
            writer,
            control,
            peer_addr,
        } = parts;
        Arc::new(Connection {
            id: ConnectionId::next(),
            role,
            path: path.into(),
            peer_addr,
            state: Mutex::new(ConnectionState::Connecting),
            reader: Mutex::new(Some(BufReader::new(reader))),
            writer: Mutex::new(writer),
            control,
            handler,
            disconnected: AtomicBool::new(false),
            options,
            heartbeat: Mutex::new(Heartbeat::default()),
            close_timer: Mutex::new(None),
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    // ── Handshake ──────────────────────────────────────────────────────

    /// Initiator handshake: send the upgrade request for `host` and verify
    /// the reply.
    ///
    /// On failure the transport is closed and the connection is left
    /// `Closed` without any notification, since it never opened.
    pub fn handshake(self: &Arc<Self>, host: &str) -> WsResult<()> {
        self.expect_connecting()?;
        let key = generate_key();
        if let Err(e) = self.exchange_upgrade(host, &key) {
            warn!(conn_id = %self.id, error = %e, "WebSocket handshake failed");
            self.abort();
            return Err(e);
        }
        self.open();
        Ok(())
    }

    fn exchange_upgrade(&self, host: &str, key: &str) -> WsResult<()> {
        {
            let mut writer = self.writer.lock();
            write_upgrade_request(&mut **writer, host, &self.path, key)?;
        }
        let response = {
            let mut guard = self.reader.lock();
            let reader = guard
                .as_mut()
                .ok_or_else(|| WsError::protocol("receive loop already owns the stream"))?;
            http::read_response(reader)?
        };
        validate_upgrade_response(&response, key)?;
        Ok(())
    }

    /// Acceptor handshake: answer an upgrade request carrying `client_key`
    /// with `101 Switching Protocols`. The key is not validated.
    pub fn accept(self: &Arc<Self>, client_key: &str) -> WsResult<()> {
        self.expect_connecting()?;
        let accept = compute_accept_key(client_key);
        let written = {
            let mut writer = self.writer.lock();
            write_upgrade_response(&mut **writer, &accept)
        };
        if let Err(e) = written {
            self.abort();
            return Err(e.into());
        }
        self.open();
        Ok(())
    }

    fn expect_connecting(&self) -> WsResult<()> {
        match self.state() {
            ConnectionState::Connecting => Ok(()),
            other => Err(WsError::protocol(format!("handshake attempted in state {:?}", other))),
        }
    }

    fn open(self: &Arc<Self>) {
        *self.state.lock() = ConnectionState::Open;
        if let Err(e) = self.control.set_read_timeout(self.options.read_timeout) {
            warn!(conn_id = %self.id, error = %e, "failed to apply read timeout");
        }
        info!(
            conn_id = %self.id,
            peer = ?self.peer_addr,
            role = ?self.role,
            path = %self.path,
            "connection open"
        );
        self.handler.on_connect(self);
    }

    /// Tear down a connection that never opened. No notification fires.
    fn abort(&self) {
        self.disconnected.store(true, Ordering::Release);
        *self.state.lock() = ConnectionState::Closed;
        self.control.close();
    }

    // ── Sending ────────────────────────────────────────────────────────

    fn mask_key(&self) -> Option<[u8; 4]> {
        match self.role {
            Role::Initiator => Some(rand::random()),
            Role::Acceptor => None,
        }
    }

    /// Send one final frame. Fails with [`WsError::NotOpen`] unless the
    /// connection is `Open`. A write failure closes the connection and
    /// fires the disconnect notification.
    ///
    /// Close frames go through [`disconnect`](Self::disconnect) instead.
    pub fn send(self: &Arc<Self>, payload: &[u8], opcode: Opcode) -> WsResult<()> {
        if opcode == Opcode::Close {
            return Err(WsError::protocol("close frames are sent with disconnect()"));
        }
        if opcode.is_control() && payload.len() > MAX_CONTROL_PAYLOAD {
            return Err(WsError::protocol(format!(
                "control frame payload too large: {} bytes (max {})",
                payload.len(),
                MAX_CONTROL_PAYLOAD
            )));
        }

        let mut writer = self.writer.lock();
        let state = self.state();
        if state != ConnectionState::Open {
            return Err(WsError::NotOpen(state));
        }
        let result = write_frame(&mut **writer, opcode, payload, self.mask_key());
        drop(writer);

        if let Err(e) = &result {
            warn!(conn_id = %self.id, error = %e, "write failed; closing connection");
            self.finish(None);
        }
        result
    }

    pub fn send_text(self: &Arc<Self>, text: &str) -> WsResult<()> {
        self.send(text.as_bytes(), Opcode::Text)
    }

    pub fn send_binary(self: &Arc<Self>, data: &[u8]) -> WsResult<()> {
        self.send(data, Opcode::Binary)
    }

    /// Serialize `value` and send it as a text message.
    pub fn send_json<T: Serialize + ?Sized>(self: &Arc<Self>, value: &T) -> WsResult<()> {
        let text = serde_json::to_string(value)?;
        self.send_text(&text)
    }

    pub fn ping(self: &Arc<Self>, payload: &[u8]) -> WsResult<()> {
        self.send(payload, Opcode::Ping)
    }

    /// Write a frame regardless of state. Used for close echoes and pong
    /// replies from the receive loop, which already hold the right to write.
    fn write_raw(
        &self,
        writer: &mut (dyn Write + Send),
        opcode: Opcode,
        payload: &[u8],
    ) -> WsResult<()> {
        write_frame(writer, opcode, payload, self.mask_key())
    }

    // ── Closing ────────────────────────────────────────────────────────

    /// Start a normal close with `code` and no reason.
    pub fn disconnect(self: &Arc<Self>, code: u16) {
        self.close(code, "");
    }

    /// Start a close handshake.
    ///
    /// - `Open`: sends a close frame and moves to `Closing`. `Closed` is
    ///   reached in the receive loop when the echo arrives, or when the close
    ///   timeout runs out first.
    /// - `Closing`: nothing; a close frame is already on the wire.
    /// - `Connecting` / `Closed`: closes the transport immediately.
    pub fn close(self: &Arc<Self>, code: u16, reason: &str) {
        let mut writer = self.writer.lock();
        let mut state = self.state.lock();
        let current = *state;
        match current {
            ConnectionState::Open => {
                *state = ConnectionState::Closing;
                drop(state);
                let payload = build_close_payload(code, reason);
                let written = self.write_raw(&mut **writer, Opcode::Close, &payload);
                drop(writer);
                match written {
                    Ok(()) => {
                        debug!(conn_id = %self.id, code, "close frame sent");
                        if let Some(timeout) = self.options.close_timeout {
                            self.start_close_timer(timeout);
                        }
                    }
                    Err(e) => {
                        warn!(conn_id = %self.id, error = %e, "failed to send close frame");
                        self.finish(None);
                    }
                }
            }
            ConnectionState::Closing => {}
            ConnectionState::Connecting | ConnectionState::Closed => {
                drop(state);
                drop(writer);
                self.finish(None);
            }
        }
    }

    /// Send a close frame if still `Open`, then close immediately without
    /// waiting for the echo. Used for protocol violations, overdue pongs and
    /// panicking callbacks.
    pub(crate) fn terminate(self: &Arc<Self>, code: u16, reason: &str) {
        {
            let mut writer = self.writer.lock();
            let mut state = self.state.lock();
            if *state == ConnectionState::Open {
                *state = ConnectionState::Closing;
                drop(state);
                let payload = build_close_payload(code, reason);
                if let Err(e) = self.write_raw(&mut **writer, Opcode::Close, &payload) {
                    debug!(conn_id = %self.id, error = %e, "close frame not sent");
                }
            }
        }
        self.finish(Some(code));
    }

    /// Force `Closed` if the peer has not echoed our close frame within
    /// `timeout`. The receive loop may be blocked in a read that a socket
    /// timeout change would not interrupt, so the wait runs on its own thread.
    fn start_close_timer(self: &Arc<Self>, timeout: Duration) {
        let (tx, rx) = bounded::<()>(0);
        *self.close_timer.lock() = Some(tx);
        let conn: Weak<Connection> = Arc::downgrade(self);
        let spawned = thread::Builder::new()
            .name(format!("ws-close-{}", self.id))
            .spawn(move || {
                if let Err(RecvTimeoutError::Timeout) = rx.recv_timeout(timeout) {
                    let Some(conn) = conn.upgrade() else { return };
                    if conn.state() == ConnectionState::Closing {
                        debug!(conn_id = %conn.id, "no close echo; closing transport");
                        conn.finish(None);
                    }
                }
            });
        if let Err(e) = spawned {
            warn!(conn_id = %self.id, error = %e, "failed to start close timer");
        }
    }

    /// Reach `Closed`: notify once, then close the transport.
    fn finish(self: &Arc<Self>, code: Option<u16>) {
        *self.state.lock() = ConnectionState::Closed;
        self.close_timer.lock().take();
        if !self.disconnected.swap(true, Ordering::AcqRel) {
            info!(conn_id = %self.id, code = ?code, "connection closed");
            self.handler.on_disconnect(self, code);
        }
        self.control.close();
    }

    // ── Heartbeat ──────────────────────────────────────────────────────

    /// Send a ping with a random payload and remember it until the matching
    /// pong arrives.
    pub(crate) fn heartbeat_ping(self: &Arc<Self>) -> WsResult<()> {
        let payload: [u8; 4] = rand::random();
        {
            let mut hb = self.heartbeat.lock();
            hb.pending = Some(payload);
            hb.sent_at = Some(Instant::now());
        }
        self.ping(&payload)
    }

    /// Whether a heartbeat ping is still waiting for its pong.
    pub(crate) fn awaiting_pong(&self) -> bool {
        self.heartbeat.lock().pending.is_some()
    }

    /// Whether a heartbeat ping has gone unanswered for longer than `timeout`.
    pub(crate) fn pong_overdue(&self, timeout: Duration) -> bool {
        let hb = self.heartbeat.lock();
        match (hb.pending, hb.sent_at) {
            (Some(_), Some(sent)) => sent.elapsed() > timeout,
            _ => false,
        }
    }

    fn record_pong(&self, payload: &[u8]) {
        let mut hb = self.heartbeat.lock();
        if hb.pending.is_some_and(|p| p[..] == *payload) {
            hb.pending = None;
            hb.sent_at = None;
        }
    }

    // ── Receive loop ───────────────────────────────────────────────────

    /// Run the receive loop on a new named thread.
    pub fn spawn(self: &Arc<Self>) -> std::io::Result<JoinHandle<()>> {
        let conn = Arc::clone(self);
        std::thread::Builder::new()
            .name(format!("ws-conn-{}", self.id))
            .spawn(move || conn.run())
    }

    /// Read and dispatch frames until the connection closes.
    ///
    /// Returns immediately if another receive loop already owns the stream.
    pub fn run(self: &Arc<Self>) {
        let Some(mut reader) = self.reader.lock().take() else {
            warn!(conn_id = %self.id, "receive loop already running");
            return;
        };
        let mut fragments = Reassembler::new(self.options.max_message_size);

        while self.state() != ConnectionState::Closed {
            let frame = match read_frame_limited(&mut reader, self.options.max_frame_size) {
                Ok(frame) => frame,
                Err(WsError::Protocol(reason)) => {
                    warn!(conn_id = %self.id, reason = %reason, "protocol violation");
                    self.terminate(CloseCode::PROTOCOL_ERROR, &reason);
                    return;
                }
                Err(e) => {
                    debug!(conn_id = %self.id, error = %e, "read failed");
                    self.finish(None);
                    return;
                }
            };
            debug!(
                conn_id = %self.id,
                opcode = ?frame.opcode,
                fin = frame.fin,
                len = frame.payload.len(),
                "frame received"
            );

            if let Flow::Stop = self.dispatch(frame, &mut fragments) {
                return;
            }
        }
    }

    fn dispatch(self: &Arc<Self>, frame: Frame, fragments: &mut Reassembler) -> Flow {
        match frame.opcode {
            Opcode::Close => {
                self.handle_close(&frame.payload);
                Flow::Stop
            }
            Opcode::Ping => {
                let replied = {
                    let mut writer = self.writer.lock();
                    if self.state() == ConnectionState::Closed {
                        return Flow::Stop;
                    }
                    self.write_raw(&mut **writer, Opcode::Pong, &frame.payload)
                };
                match replied {
                    Ok(()) => Flow::Continue,
                    Err(e) => {
                        debug!(conn_id = %self.id, error = %e, "pong write failed");
                        self.finish(None);
                        Flow::Stop
                    }
                }
            }
            Opcode::Pong => {
                self.record_pong(&frame.payload);
                Flow::Continue
            }
            Opcode::Text | Opcode::Binary | Opcode::Continuation => match fragments.push(frame) {
                Reassembly::Message(Opcode::Binary, data) => {
                    self.handler.on_binary(self, &data);
                    Flow::Continue
                }
                Reassembly::Message(_, data) => self.deliver_text(data),
                Reassembly::Pending => Flow::Continue,
                Reassembly::TooLarge => {
                    let limit = self.options.max_message_size;
                    warn!(conn_id = %self.id, limit, "message too big");
                    self.terminate(CloseCode::MESSAGE_TOO_BIG, "message too big");
                    Flow::Stop
                }
                Reassembly::Violation(reason) => {
                    warn!(conn_id = %self.id, reason, "fragmentation violation");
                    self.terminate(CloseCode::PROTOCOL_ERROR, reason);
                    Flow::Stop
                }
            },
        }
    }

    fn deliver_text(self: &Arc<Self>, data: Vec<u8>) -> Flow {
        if self.options.strict_utf8 {
            match String::from_utf8(data) {
                Ok(text) => self.handler.on_message(self, &text),
                Err(_) => {
                    warn!(conn_id = %self.id, "invalid UTF-8 in text message");
                    self.terminate(CloseCode::INVALID_DATA, "invalid UTF-8");
                    return Flow::Stop;
                }
            }
        } else {
            self.handler.on_message(self, &String::from_utf8_lossy(&data));
        }
        Flow::Continue
    }

    /// Peer sent a close frame: echo it if we had not started closing, then
    /// finish with the peer's code.
    fn handle_close(self: &Arc<Self>, payload: &[u8]) {
        {
            let mut writer = self.writer.lock();
            let mut state = self.state.lock();
            if *state == ConnectionState::Open {
                *state = ConnectionState::Closing;
                drop(state);
                if let Err(e) = self.write_raw(&mut **writer, Opcode::Close, payload) {
                    debug!(conn_id = %self.id, error = %e, "close echo failed");
                }
            }
        }
        self.finish(parse_close_code(payload));
    }
}
