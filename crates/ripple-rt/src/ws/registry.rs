//! Live-connection registry with broadcast and named rooms.
//!
//! ## Locks
//!
//! - `connections: Mutex<FxHashMap<ConnectionId, Arc<Connection>>>`
//! - `rooms: RwLock<FxHashMap<String, FxHashSet<ConnectionId>>>` -- room to members
//! - `conn_rooms: RwLock<FxHashMap<ConnectionId, FxHashSet<String>>>` -- reverse index
//!
//! Lock ordering: `connections`, then `rooms`, then `conn_rooms`. Only
//! [`Registry::join`] holds `connections` together with the room locks, so
//! a membership can never be recorded for a connection already removed.
//!
//! Fan-out takes a snapshot under the lock and sends after releasing it. A
//! failed send closes that connection, whose disconnect handler calls
//! [`Registry::remove`]; sending under the lock would deadlock there.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::debug;

use super::connection::{Connection, ConnectionId};

#[derive(Default)]
pub struct Registry {
    connections: Mutex<FxHashMap<ConnectionId, Arc<Connection>>>,
    rooms: RwLock<FxHashMap<String, FxHashSet<ConnectionId>>>,
    conn_rooms: RwLock<FxHashMap<ConnectionId, FxHashSet<String>>>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("connections", &self.len())
            .field("rooms", &self.rooms.read().len())
            .finish()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, conn: Arc<Connection>) {
        self.connections.lock().insert(conn.id(), conn);
    }

    /// Drop a connection and its room memberships.
    pub fn remove(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        let removed = self.connections.lock().remove(&id);
        self.leave_all(id);
        removed
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections.lock().get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every registered connection at this instant.
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections.lock().values().cloned().collect()
    }

    /// Send `text` to every registered connection. Returns the number of
    /// connections the message could not be delivered to.
    pub fn broadcast(&self, text: &str) -> usize {
        deliver(self.snapshot(), text)
    }

    /// [`broadcast`](Self::broadcast) skipping `except`.
    pub fn broadcast_except(&self, text: &str, except: ConnectionId) -> usize {
        let targets = self.snapshot().into_iter().filter(|c| c.id() != except);
        deliver(targets, text)
    }

    // ── Rooms ──────────────────────────────────────────────────────────

    /// Add `id` to `room`. Returns `false`, recording nothing, when `id` is
    /// not registered.
    pub fn join(&self, id: ConnectionId, room: &str) -> bool {
        let connections = self.connections.lock();
        if !connections.contains_key(&id) {
            return false;
        }
        let mut rooms = self.rooms.write();
        let mut conn_rooms = self.conn_rooms.write();
        rooms.entry(room.to_string()).or_default().insert(id);
        conn_rooms.entry(id).or_default().insert(room.to_string());
        true
    }

    /// Empty rooms are dropped.
    pub fn leave(&self, id: ConnectionId, room: &str) {
        let mut rooms = self.rooms.write();
        let mut conn_rooms = self.conn_rooms.write();

        if let Some(members) = rooms.get_mut(room) {
            members.remove(&id);
            if members.is_empty() {
                rooms.remove(room);
            }
        }
        if let Some(joined) = conn_rooms.get_mut(&id) {
            joined.remove(room);
            if joined.is_empty() {
                conn_rooms.remove(&id);
            }
        }
    }

    fn leave_all(&self, id: ConnectionId) {
        let mut rooms = self.rooms.write();
        let mut conn_rooms = self.conn_rooms.write();

        let Some(joined) = conn_rooms.remove(&id) else {
            return;
        };
        for room in joined {
            if let Some(members) = rooms.get_mut(&room) {
                members.remove(&id);
                if members.is_empty() {
                    rooms.remove(&room);
                }
            }
        }
    }

    pub fn members(&self, room: &str) -> Vec<ConnectionId> {
        self.rooms
            .read()
            .get(room)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn rooms_of(&self, id: ConnectionId) -> Vec<String> {
        self.conn_rooms
            .read()
            .get(&id)
            .map(|joined| joined.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Send `text` to every member of `room`. Returns the failure count.
    pub fn broadcast_to_room(&self, room: &str, text: &str) -> usize {
        let ids = self.members(room);
        let targets: Vec<_> = {
            let connections = self.connections.lock();
            ids.iter().filter_map(|id| connections.get(id).cloned()).collect()
        };
        deliver(targets, text)
    }
}

/// Send to each open connection in turn; one failure never stops the rest.
fn deliver(targets: impl IntoIterator<Item = Arc<Connection>>, text: &str) -> usize {
    let mut failed = 0;
    for conn in targets {
        if !conn.is_open() {
            continue;
        }
        if let Err(e) = conn.send_text(text) {
            debug!(conn_id = %conn.id(), error = %e, "broadcast delivery failed");
            failed += 1;
        }
    }
    failed
}
