//! Per-connection server worker: owns the read side of one accepted
//! TCP connection, parses inbound packets, dispatches them against
//! the shared [`Registry`], and writes back a response. One of these
//! runs per connection thread, spawned by the acceptor.

use std::io::Read;
use std::net::TcpStream;

use tracing::{debug, info, warn};

use crate::consts::{MAX_DATA, MAX_NAME};
use crate::protocol::{self, Packet, PacketType};
use crate::registry::{ConnectionHandle, LoginError, Registry, RoomError};

const NOT_LOGGED_IN: &str = "Not logged in.";
const SESSION_DOES_NOT_EXIST: &str = "Session does not exist.";
const SESSION_ALREADY_EXISTS: &str = "Session already exists.";
const NOT_IN_SESSION: &str = "Not in session.";
const CANNOT_SEND_NOT_IN_SESSION: &str = "Cannot send message, not in session";
const UNKNOWN_REQUEST: &str = "Unknown request.";

/// Drives one accepted connection from hello to goodbye. `stream` is
/// this thread's exclusive read handle; `conn` is the shared, stable
/// identity registered for it (its send half is reached only through
/// `conn.send_raw`, which serializes writes against any concurrent
/// broadcaster).
pub fn run(registry: &Registry, mut stream: TcpStream, conn: &ConnectionHandle) -> anyhow::Result<()> {
    let mut buf = vec![0u8; MAX_NAME + MAX_DATA + 64];
    loop {
        let n = match stream.read(&mut buf) {
            Ok(0) => {
                info!(conn_id = conn.id, "connection closed by peer");
                break;
            }
            Ok(n) => n,
            Err(e) => {
                warn!(conn_id = conn.id, error = %e, "read error, treating as disconnect");
                break;
            }
        };

        let raw = &buf[..n];
        let request = match Packet::parse(raw) {
            Ok(p) => p,
            Err(e) => {
                warn!(conn_id = conn.id, error = %e, "malformed packet");
                let resp = Packet::new(PacketType::Unknown, "", UNKNOWN_REQUEST.as_bytes().to_vec());
                let _ = conn.send_raw(&resp.serialize());
                continue;
            }
        };

        if dispatch(registry, conn, &request, raw)? {
            break;
        }
    }

    // Idempotent: also reached via the EXIT arm of dispatch, and
    // harmless to run twice since every step no-ops once the
    // connection is already gone.
    registry.teardown_connection(conn);
    Ok(())
}

/// Handles one request. Returns `true` if the connection should be
/// torn down and the read loop should stop.
fn dispatch(registry: &Registry, conn: &ConnectionHandle, request: &Packet, raw: &[u8]) -> anyhow::Result<bool> {
    debug!(conn_id = conn.id, packet_type = ?request.packet_type, "dispatching request");

    match request.packet_type {
        PacketType::Login => {
            handle_login(registry, conn, request);
            Ok(false)
        }
        PacketType::Exit => {
            registry.teardown_connection(conn);
            Ok(true)
        }
        PacketType::Join => {
            handle_with_auth(registry, conn, request, PacketType::JnNak, |registry, conn, room| {
                match registry.join_room(conn, room) {
                    Ok(()) => Packet::new(PacketType::JnAck, "", room.as_bytes().to_vec()),
                    Err(RoomError::DoesNotExist) => nak(PacketType::JnNak, SESSION_DOES_NOT_EXIST),
                    Err(other) => {
                        warn!(conn_id = conn.id, ?other, "unexpected join error");
                        nak(PacketType::JnNak, SESSION_DOES_NOT_EXIST)
                    }
                }
            });
            Ok(false)
        }
        PacketType::LeaveSess => {
            handle_with_auth(registry, conn, request, PacketType::LsNack, |registry, conn, room| {
                match registry.leave_room(conn, room) {
                    Ok(()) => Packet::new(PacketType::LsAck, "", Vec::new()),
                    Err(RoomError::DoesNotExist) => nak(PacketType::LsNack, SESSION_DOES_NOT_EXIST),
                    Err(RoomError::NotAMember) => nak(PacketType::LsNack, NOT_IN_SESSION),
                    Err(RoomError::AlreadyExists) => unreachable!("leave_room never returns AlreadyExists"),
                }
            });
            Ok(false)
        }
        PacketType::NewSess => {
            handle_with_auth(registry, conn, request, PacketType::NsNak, |registry, conn, room| {
                match registry.create_room(conn, room) {
                    Ok(()) => Packet::new(PacketType::NsAck, "", room.as_bytes().to_vec()),
                    Err(RoomError::AlreadyExists) => nak(PacketType::NsNak, SESSION_ALREADY_EXISTS),
                    Err(other) => {
                        warn!(conn_id = conn.id, ?other, "unexpected create error");
                        nak(PacketType::NsNak, SESSION_ALREADY_EXISTS)
                    }
                }
            });
            Ok(false)
        }
        PacketType::Query => {
            let response = if !authorized(conn, request) {
                nak(PacketType::QuNack, NOT_LOGGED_IN)
            } else {
                Packet::new(PacketType::QuAck, "", registry.query_listing().into_bytes())
            };
            let _ = conn.send_raw(&response.serialize());
            Ok(false)
        }
        PacketType::Message => {
            handle_message(registry, conn, request, raw);
            Ok(false)
        }
        _ => {
            let resp = Packet::new(PacketType::Unknown, "", UNKNOWN_REQUEST.as_bytes().to_vec());
            let _ = conn.send_raw(&resp.serialize());
            Ok(false)
        }
    }
}

fn authorized(conn: &ConnectionHandle, request: &Packet) -> bool {
    conn.client_id().as_deref() == Some(request.source.as_str())
}

fn nak(packet_type: PacketType, body: &str) -> Packet {
    Packet::new(packet_type, "", body.as_bytes().to_vec())
}

fn handle_login(registry: &Registry, conn: &ConnectionHandle, request: &Packet) {
    let body = String::from_utf8_lossy(&request.data);
    let mut parts = body.splitn(2, ',');
    let (username, password) = match (parts.next(), parts.next()) {
        (Some(u), Some(p)) => (u, p),
        _ => {
            let _ = conn.send_raw(&nak(PacketType::LoNak, "").serialize());
            return;
        }
    };

    let response = match registry.login(conn, username, password) {
        Ok(()) => Packet::new(PacketType::LoAck, "", username.as_bytes().to_vec()),
        Err(LoginError::BadCredentials) | Err(LoginError::AlreadyLoggedIn) => nak(PacketType::LoNak, ""),
    };
    let _ = conn.send_raw(&response.serialize());
}

/// Shared shape for JOIN/LEAVE_SESS/NEW_SESS: check the auth gate,
/// parse the room name out of the body, run `op`, and write back
/// whatever packet it produces.
fn handle_with_auth(
    registry: &Registry,
    conn: &ConnectionHandle,
    request: &Packet,
    unauthorized_nak: PacketType,
    op: impl FnOnce(&Registry, &ConnectionHandle, &str) -> Packet,
) {
    let response = if !authorized(conn, request) {
        nak(unauthorized_nak, NOT_LOGGED_IN)
    } else {
        let room = String::from_utf8_lossy(&request.data).to_string();
        op(registry, conn, &room)
    };
    let _ = conn.send_raw(&response.serialize());
}

fn handle_message(registry: &Registry, conn: &ConnectionHandle, request: &Packet, raw: &[u8]) {
    let response = if !authorized(conn, request) {
        nak(PacketType::MessageNck, NOT_LOGGED_IN)
    } else {
        match protocol::split_message_body(&request.data) {
            None => nak(PacketType::MessageNck, CANNOT_SEND_NOT_IN_SESSION),
            Some((room, _text)) => match registry.broadcast(conn, room, raw) {
                Ok(()) => Packet::new(PacketType::MessageAck, "", Vec::new()),
                Err(_) => nak(PacketType::MessageNck, CANNOT_SEND_NOT_IN_SESSION),
            },
        }
    };
    let _ = conn.send_raw(&response.serialize());
}
