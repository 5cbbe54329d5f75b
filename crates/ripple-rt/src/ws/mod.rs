//! WebSocket protocol layer (RFC 6455).
//!
//! - **Frame codec** (`frame`): frame parsing and writing with XOR masking
//! - **Handshake** (`handshake`): HTTP upgrade and Sec-WebSocket-Accept, both roles
//! - **Close** (`close`): close codes and close payloads
//! - **Fragments** (`fragment`): inbound message reassembly
//! - **Connection** (`connection`): state machine, receive loop, serialized sends
//! - **Registry** (`registry`): live connections, broadcast, rooms
//! - **Server** / **Client**: accept loop and `ws://` / `wss://` connect

pub mod client;
pub mod close;
pub mod connection;
pub mod fragment;
pub mod frame;
pub mod handler;
pub mod handshake;
pub mod registry;
pub mod server;

pub use client::{connect, ClientOptions, WsUrl};
pub use close::{build_close_payload, parse_close_code, parse_close_payload, CloseCode};
pub use connection::{Connection, ConnectionId, ConnectionOptions, ConnectionState, Role};
pub use frame::{
    apply_mask, encode_frame, read_frame, read_frame_limited, write_frame, Frame, Opcode,
};
pub use handler::{Callbacks, Handler, NoopHandler};
pub use handshake::compute_accept_key;
pub use registry::Registry;
pub use server::{Server, ServerHandle};
