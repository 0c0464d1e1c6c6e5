//! Shared server state: the room table, the connection table, and the
//! read-only user/password map. All three are process-wide and shared
//! across worker threads; this module is where §5's mandatory "lock
//! the registries" fix lives — the original C server left the room
//! and connection tables unsynchronized, which is a data race the
//! spec calls out explicitly as something that must not be carried
//! forward.

use std::collections::HashMap;
use std::io::Write;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use anyhow::Context;
use tracing::{debug, warn};

use crate::consts::MAX_CONNECTIONS;
use crate::test_hooks;

/// Stable identifier for a connection, used instead of a raw socket
/// fd or pointer so that rooms can reference members without holding
/// onto anything that could be freed out from under them (the
/// "pointer-into-container" redesign note from the spec).
pub type ConnId = u64;

/// One accepted TCP connection. Rooms hold `ConnId`s, not `Arc`s
/// directly, to keep the only owner of a connection's lifetime in the
/// registry's connection table.
pub struct ConnectionHandle {
    pub id: ConnId,
    pub remote_addr: std::net::SocketAddr,
    /// The send half, cloned from the accepted stream. Any thread
    /// writing to this connection — including another worker
    /// fanning a MESSAGE out — must hold this lock for the duration
    /// of its own write and no longer.
    send_lock: Mutex<TcpStream>,
    client_id: Mutex<Option<String>>,
    current_room: Mutex<Option<String>>,
    alive: AtomicBool,
}

impl ConnectionHandle {
    pub fn new(id: ConnId, remote_addr: std::net::SocketAddr, stream: TcpStream) -> anyhow::Result<Self> {
        let send_half = stream.try_clone().context("cloning stream for send half")?;
        Ok(ConnectionHandle {
            id,
            remote_addr,
            send_lock: Mutex::new(send_half),
            client_id: Mutex::new(None),
            current_room: Mutex::new(None),
            alive: AtomicBool::new(true),
        })
    }

    pub fn client_id(&self) -> Option<String> {
        self.client_id.lock().unwrap().clone()
    }

    pub fn set_client_id(&self, id: String) {
        *self.client_id.lock().unwrap() = Some(id);
    }

    pub fn current_room(&self) -> Option<String> {
        self.current_room.lock().unwrap().clone()
    }

    fn set_current_room(&self, room: Option<String>) {
        *self.current_room.lock().unwrap() = room;
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn mark_dead(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    /// Send raw, already-serialized packet bytes, holding the send
    /// lock only for this one write.
    pub fn send_raw(&self, bytes: &[u8]) -> anyhow::Result<()> {
        let mut stream = self.send_lock.lock().unwrap();
        stream.write_all(bytes).context("writing to connection")
    }
}

struct Room {
    members: Vec<ConnId>,
}

/// Errors distinguishing the semantic NAK cases the worker dispatch
/// table needs to map to specific response bodies.
#[derive(Debug, PartialEq, Eq)]
pub enum RoomError {
    DoesNotExist,
    AlreadyExists,
    NotAMember,
}

#[derive(Debug, PartialEq, Eq)]
pub enum LoginError {
    BadCredentials,
    AlreadyLoggedIn,
}

/// The process-wide shared state: rooms, connections, and the
/// read-only user map.
pub struct Registry {
    rooms: Mutex<HashMap<String, Room>>,
    connections: Mutex<HashMap<ConnId, Arc<ConnectionHandle>>>,
    users: Arc<HashMap<String, String>>,
    next_id: AtomicU64,
    admission_count: Mutex<usize>,
    admission_cond: Condvar,
    max_connections: usize,
}

impl Registry {
    pub fn new(users: HashMap<String, String>, max_connections: usize) -> Self {
        Registry {
            rooms: Mutex::new(HashMap::new()),
            connections: Mutex::new(HashMap::new()),
            users: Arc::new(users),
            next_id: AtomicU64::new(1),
            admission_count: Mutex::new(0),
            admission_cond: Condvar::new(),
            max_connections,
        }
    }

    pub fn with_default_bound(users: HashMap<String, String>) -> Self {
        Self::new(users, MAX_CONNECTIONS)
    }

    /// Blocks until fewer than `max_connections` connections are
    /// admitted, then reserves a slot for the caller. Mirrors
    /// `connectionsMutex`/`connectionsCond` from §5: a single mutex
    /// guards the count and a condvar wakes waiters when a worker
    /// releases its slot.
    pub fn reserve_admission_slot(&self) {
        let mut count = self.admission_count.lock().unwrap();
        while *count >= self.max_connections {
            test_hooks::emit("acceptor-blocked-on-admission");
            count = self.admission_cond.wait(count).unwrap();
        }
        *count += 1;
    }

    /// Releases a slot reserved by `reserve_admission_slot` without a
    /// connection ever having been registered for it — the acceptor's
    /// own error paths (accept/clone/register failure) need this,
    /// since `teardown_connection` only runs for connections that made
    /// it into the connection table.
    pub(crate) fn release_admission_slot(&self) {
        let mut count = self.admission_count.lock().unwrap();
        *count -= 1;
        self.admission_cond.notify_one();
    }

    /// Registers a newly-accepted connection, handing out the next
    /// stable id. Must be called only after `reserve_admission_slot`.
    pub fn register_connection(
        &self,
        remote_addr: std::net::SocketAddr,
        stream: TcpStream,
    ) -> anyhow::Result<Arc<ConnectionHandle>> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let handle = Arc::new(ConnectionHandle::new(id, remote_addr, stream)?);
        self.connections.lock().unwrap().insert(id, Arc::clone(&handle));
        debug!(conn_id = id, addr = %remote_addr, "registered connection");
        Ok(handle)
    }

    /// Tears a connection down: removes it from every room it was a
    /// member of (evicting any room left empty), removes it from the
    /// connection table, and releases its admission slot. Safe to
    /// call multiple times.
    pub fn teardown_connection(&self, conn: &ConnectionHandle) {
        {
            let mut rooms = self.rooms.lock().unwrap();
            let mut emptied = Vec::new();
            for (name, room) in rooms.iter_mut() {
                if let Some(pos) = room.members.iter().position(|m| *m == conn.id) {
                    room.members.remove(pos);
                    if room.members.is_empty() {
                        emptied.push(name.clone());
                    }
                }
            }
            // Evict using the name captured above, never a name read
            // back off the connection after it has already been
            // cleared — this is the fix for the "room never evicted"
            // source bug in §9.
            for name in emptied {
                rooms.remove(&name);
                test_hooks::emit("room-evicted-empty");
            }
        }
        conn.set_current_room(None);
        let removed = self.connections.lock().unwrap().remove(&conn.id);
        conn.mark_dead();
        if removed.is_some() {
            self.release_admission_slot();
        }
    }

    /// Attempts a login. On success, records the client id on the
    /// connection and returns `Ok(())`; the password check happens
    /// before the duplicate-login check, matching the spec's stated
    /// tie-break.
    pub fn login(&self, conn: &ConnectionHandle, username: &str, password: &str) -> Result<(), LoginError> {
        let expected = self.users.get(username);
        if expected.map(|p| p.as_str()) != Some(password) {
            return Err(LoginError::BadCredentials);
        }
        let connections = self.connections.lock().unwrap();
        let already_logged_in = connections
            .values()
            .any(|c| c.id != conn.id && c.client_id().as_deref() == Some(username));
        if already_logged_in {
            return Err(LoginError::AlreadyLoggedIn);
        }
        drop(connections);
        conn.set_client_id(username.to_string());
        Ok(())
    }

    pub fn create_room(&self, conn: &ConnectionHandle, name: &str) -> Result<(), RoomError> {
        let mut rooms = self.rooms.lock().unwrap();
        if rooms.contains_key(name) {
            return Err(RoomError::AlreadyExists);
        }
        rooms.insert(name.to_string(), Room { members: vec![conn.id] });
        drop(rooms);
        conn.set_current_room(Some(name.to_string()));
        Ok(())
    }

    pub fn join_room(&self, conn: &ConnectionHandle, name: &str) -> Result<(), RoomError> {
        let mut rooms = self.rooms.lock().unwrap();
        let room = rooms.get_mut(name).ok_or(RoomError::DoesNotExist)?;
        if !room.members.contains(&conn.id) {
            room.members.push(conn.id);
        }
        drop(rooms);
        conn.set_current_room(Some(name.to_string()));
        Ok(())
    }

    /// Removes `conn` from `name`, deleting the room if it becomes
    /// empty. Returns `RoomError::DoesNotExist` if the room is
    /// absent and `RoomError::NotAMember` if the room exists but
    /// `conn` never joined it — tightening the original's "remove
    /// nothing and still ACK" behavior per §4.2's tie-break note.
    pub fn leave_room(&self, conn: &ConnectionHandle, name: &str) -> Result<(), RoomError> {
        let mut rooms = self.rooms.lock().unwrap();
        let is_empty_after = {
            let room = rooms.get_mut(name).ok_or(RoomError::DoesNotExist)?;
            let pos = room.members.iter().position(|m| *m == conn.id).ok_or(RoomError::NotAMember)?;
            room.members.remove(pos);
            room.members.is_empty()
        };
        if is_empty_after {
            rooms.remove(name);
            test_hooks::emit("room-evicted-empty");
        }
        drop(rooms);
        conn.set_current_room(None);
        Ok(())
    }

    /// Produces the QUERY listing: one `'<name>': <count> users\n`
    /// header per room followed by one `\t<clientid>\n` per member,
    /// concatenated in the order rooms and members happen to iterate.
    pub fn query_listing(&self) -> String {
        let rooms = self.rooms.lock().unwrap();
        let connections = self.connections.lock().unwrap();
        let mut out = String::new();
        for (name, room) in rooms.iter() {
            out.push_str(&format!("'{}': {} users\n", name, room.members.len()));
            for member_id in &room.members {
                if let Some(conn) = connections.get(member_id) {
                    if let Some(cid) = conn.client_id() {
                        out.push_str(&format!("\t{cid}\n"));
                    }
                }
            }
        }
        out
    }

    /// Forwards `raw_bytes` (the original serialized request) to
    /// every other member of `room`, skipping `sender`. Best-effort:
    /// a failed send to one member does not abort the fan-out to the
    /// rest. Returns `RoomError::DoesNotExist`/`NotAMember` if the
    /// room doesn't exist or the sender isn't in it — both map to the
    /// same "Cannot send message, not in session" response at the
    /// call site, per spec.
    pub fn broadcast(&self, sender: &ConnectionHandle, room: &str, raw_bytes: &[u8]) -> Result<(), RoomError> {
        let member_ids = {
            let rooms = self.rooms.lock().unwrap();
            let r = rooms.get(room).ok_or(RoomError::DoesNotExist)?;
            if !r.members.contains(&sender.id) {
                return Err(RoomError::NotAMember);
            }
            r.members.clone()
        };

        let targets: Vec<Arc<ConnectionHandle>> = {
            let connections = self.connections.lock().unwrap();
            member_ids
                .iter()
                .filter(|id| **id != sender.id)
                .filter_map(|id| connections.get(id).cloned())
                .collect()
        };

        for target in targets {
            if let Err(e) = target.send_raw(raw_bytes) {
                warn!(conn_id = target.id, error = %e, "best-effort broadcast send failed");
            }
        }
        test_hooks::emit("broadcast-delivered");
        Ok(())
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    pub fn get_connection(&self, id: ConnId) -> Option<Arc<ConnectionHandle>> {
        self.connections.lock().unwrap().get(&id).cloned()
    }

    pub fn room_exists(&self, name: &str) -> bool {
        self.rooms.lock().unwrap().contains_key(name)
    }

    pub fn room_member_count(&self, name: &str) -> Option<usize> {
        self.rooms.lock().unwrap().get(name).map(|r| r.members.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{TcpListener, TcpStream};

    fn loopback_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    fn registry_with_user(name: &str, pass: &str) -> Registry {
        let mut users = HashMap::new();
        users.insert(name.to_string(), pass.to_string());
        Registry::with_default_bound(users)
    }

    fn handle(registry: &Registry) -> Arc<ConnectionHandle> {
        let (_client, server) = loopback_pair();
        registry.reserve_admission_slot();
        registry.register_connection(server.peer_addr().unwrap(), server).unwrap()
    }

    #[test]
    fn login_rejects_bad_password_before_duplicate_check() {
        let registry = registry_with_user("alice", "pw");
        let conn = handle(&registry);
        assert_eq!(registry.login(&conn, "alice", "wrong"), Err(LoginError::BadCredentials));
    }

    #[test]
    fn login_rejects_duplicate_already_logged_in_user() {
        let registry = registry_with_user("alice", "pw");
        let conn1 = handle(&registry);
        let conn2 = handle(&registry);
        assert!(registry.login(&conn1, "alice", "pw").is_ok());
        assert_eq!(registry.login(&conn2, "alice", "pw"), Err(LoginError::AlreadyLoggedIn));
    }

    #[test]
    fn room_lifecycle_tracks_membership_and_evicts_when_empty() {
        let registry = registry_with_user("alice", "pw");
        let conn = handle(&registry);
        registry.login(&conn, "alice", "pw").unwrap();
        registry.create_room(&conn, "room1").unwrap();
        assert!(registry.query_listing().contains("'room1': 1 users"));
        assert!(registry.query_listing().contains("alice"));

        registry.leave_room(&conn, "room1").unwrap();
        assert!(!registry.room_exists("room1"));
    }

    #[test]
    fn room_survives_when_one_of_several_members_leaves() {
        let registry = registry_with_user("alice", "pw");
        let conn1 = handle(&registry);
        let conn2 = handle(&registry);
        registry.create_room(&conn1, "room1").unwrap();
        registry.join_room(&conn2, "room1").unwrap();
        registry.leave_room(&conn1, "room1").unwrap();
        assert_eq!(registry.room_member_count("room1"), Some(1));
    }

    #[test]
    fn duplicate_room_creation_is_rejected() {
        let registry = registry_with_user("alice", "pw");
        let conn1 = handle(&registry);
        let conn2 = handle(&registry);
        registry.create_room(&conn1, "r").unwrap();
        assert_eq!(registry.create_room(&conn2, "r"), Err(RoomError::AlreadyExists));
    }

    #[test]
    fn leave_room_not_a_member_is_distinguished_from_missing_room() {
        let registry = registry_with_user("alice", "pw");
        let conn1 = handle(&registry);
        let conn2 = handle(&registry);
        registry.create_room(&conn1, "r").unwrap();
        assert_eq!(registry.leave_room(&conn2, "r"), Err(RoomError::NotAMember));
        assert_eq!(registry.leave_room(&conn2, "nope"), Err(RoomError::DoesNotExist));
    }

    #[test]
    fn teardown_removes_connection_from_every_room_and_evicts_if_last() {
        let registry = registry_with_user("alice", "pw");
        let conn = handle(&registry);
        registry.create_room(&conn, "r").unwrap();
        registry.teardown_connection(&conn);
        assert!(!registry.room_exists("r"));
        assert_eq!(registry.connection_count(), 0);
    }

    #[test]
    fn admission_slot_is_released_on_teardown() {
        let registry = registry_with_user("alice", "pw");
        let conn = handle(&registry);
        registry.teardown_connection(&conn);
        assert_eq!(*registry.admission_count.lock().unwrap(), 0);
    }
}
