//! The client's full-duplex session core: the foreground methods the
//! REPL calls (login, logout, join/leave/create session, list,
//! sendMessage) and the shared state the background listener thread
//! (see [`crate::client::listener`]) reads and writes. The socket is
//! owned jointly — every foreground call and the listener's receive
//! loop take `socket` for only as long as their own request/response
//! or single recv needs it.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};

use crate::consts::{MAX_DATA, MAX_NAME, TIMEOUT_RTT_FLOOR, TIMEOUT_RTT_MULT};
use crate::consts::MAX_SIMUL_SESSIONS;
use crate::protocol::{self, Packet, PacketType};

/// Outcome of a foreground request: the server's ACK/NAK body,
/// rendered by the caller (the REPL binary owns all println!s).
pub struct Outcome {
    pub ok: bool,
    pub body: String,
}

impl Outcome {
    fn ack(body: impl Into<String>) -> Self {
        Outcome { ok: true, body: body.into() }
    }

    fn nak(body: impl Into<String>) -> Self {
        Outcome { ok: false, body: body.into() }
    }
}

pub struct ClientSession {
    socket: Mutex<TcpStream>,
    client_id: Mutex<Option<String>>,
    /// `None` until the first login response calibrates it.
    timeout: Mutex<Option<Duration>>,
    pub listener_alive: AtomicBool,
    tabs: Mutex<[Option<String>; MAX_SIMUL_SESSIONS]>,
    current_tab: AtomicUsize,
}

impl ClientSession {
    pub fn new(socket: TcpStream) -> Self {
        ClientSession {
            socket: Mutex::new(socket),
            client_id: Mutex::new(None),
            timeout: Mutex::new(None),
            listener_alive: AtomicBool::new(false),
            tabs: Mutex::new(Default::default()),
            current_tab: AtomicUsize::new(0),
        }
    }

    pub fn client_id(&self) -> Option<String> {
        self.client_id.lock().unwrap().clone()
    }

    pub fn current_tab_index(&self) -> usize {
        self.current_tab.load(Ordering::SeqCst)
    }

    pub fn current_room(&self) -> Option<String> {
        self.tabs.lock().unwrap()[self.current_tab_index()].clone()
    }

    pub fn recv_timeout(&self) -> Duration {
        self.timeout.lock().unwrap().unwrap_or(TIMEOUT_RTT_FLOOR)
    }

    /// Resolves a room name to the tab currently holding it, for the
    /// background listener's inbound routing. `None` if no tab
    /// matches, which the listener renders as an explicit unknown-tab
    /// label rather than silently guessing tab 0.
    pub fn tab_for_room(&self, room: &str) -> Option<usize> {
        self.tabs.lock().unwrap().iter().position(|t| t.as_deref() == Some(room))
    }

    pub fn room_in_tab(&self, tab: usize) -> Option<String> {
        self.tabs.lock().unwrap().get(tab).cloned().flatten()
    }

    /// Sends `request` and reads exactly one response packet, honoring
    /// the calibrated receive timeout once one has been set.
    fn request(&self, request: &Packet) -> anyhow::Result<Packet> {
        let mut socket = self.socket.lock().unwrap();
        socket.write_all(&request.serialize()).context("sending request")?;
        if let Some(timeout) = *self.timeout.lock().unwrap() {
            socket.set_read_timeout(Some(timeout)).context("setting read timeout")?;
        }
        let mut buf = vec![0u8; MAX_NAME + MAX_DATA + 64];
        let n = socket.read(&mut buf).context("no data received")?;
        if n == 0 {
            bail!("server closed the connection");
        }
        Packet::parse(&buf[..n])
    }

    /// Logs in, calibrating the receive timeout from this one
    /// request's round-trip time: `TIMEOUT_RTT_MULT` times the
    /// measured RTT, floored at `TIMEOUT_RTT_FLOOR` so a
    /// same-tick loopback RTT never yields a zero timeout.
    pub fn login(&self, client_id: &str, password: &str) -> anyhow::Result<Outcome> {
        let request = protocol::login_request(client_id, password);
        let start = Instant::now();
        let mut socket = self.socket.lock().unwrap();
        socket.write_all(&request.serialize()).context("sending login request")?;
        let mut buf = vec![0u8; MAX_NAME + MAX_DATA + 64];
        let n = socket.read(&mut buf).context("no data received")?;
        let rtt = start.elapsed();
        drop(socket);

        let scaled = rtt.checked_mul(TIMEOUT_RTT_MULT).unwrap_or(rtt);
        let calibrated = if scaled.is_zero() { TIMEOUT_RTT_FLOOR } else { scaled };
        *self.timeout.lock().unwrap() = Some(calibrated);

        if n == 0 {
            bail!("server closed the connection during login");
        }
        let response = Packet::parse(&buf[..n])?;
        if response.packet_type == PacketType::LoAck {
            *self.client_id.lock().unwrap() = Some(client_id.to_string());
            self.listener_alive.store(true, Ordering::SeqCst);
            Ok(Outcome::ack(String::from_utf8_lossy(&response.data).to_string()))
        } else {
            Ok(Outcome::nak(String::from_utf8_lossy(&response.data).to_string()))
        }
    }

    /// Fire-and-forget: sends EXIT and marks the listener dead without
    /// waiting for (or expecting) a response, matching the original's
    /// logout, which never reads a reply before tearing the socket
    /// down.
    pub fn logout(&self) -> anyhow::Result<()> {
        let client_id = self.client_id().context("not logged in")?;
        let request = protocol::exit_request(&client_id);
        let mut socket = self.socket.lock().unwrap();
        socket.write_all(&request.serialize()).context("sending exit request")?;
        let _ = socket.shutdown(std::net::Shutdown::Both);
        drop(socket);
        self.listener_alive.store(false, Ordering::SeqCst);
        *self.client_id.lock().unwrap() = None;
        Ok(())
    }

    pub fn join_session(&self, room: &str) -> anyhow::Result<Outcome> {
        let client_id = self.client_id().context("not logged in")?;
        let response = self.request(&protocol::join_request(&client_id, room))?;
        if response.packet_type == PacketType::JnAck {
            let joined = String::from_utf8_lossy(&response.data).to_string();
            self.tabs.lock().unwrap()[self.current_tab_index()] = Some(joined.clone());
            Ok(Outcome::ack(joined))
        } else {
            Ok(Outcome::nak(String::from_utf8_lossy(&response.data).to_string()))
        }
    }

    pub fn leave_session(&self) -> anyhow::Result<Outcome> {
        let client_id = self.client_id().context("not logged in")?;
        let room = self.current_room().context("not in a session")?;
        let response = self.request(&protocol::leave_request(&client_id, &room))?;
        if response.packet_type == PacketType::LsAck {
            self.tabs.lock().unwrap()[self.current_tab_index()] = None;
            Ok(Outcome::ack(""))
        } else {
            Ok(Outcome::nak(String::from_utf8_lossy(&response.data).to_string()))
        }
    }

    pub fn create_session(&self, room: &str) -> anyhow::Result<Outcome> {
        let client_id = self.client_id().context("not logged in")?;
        if self.current_room().is_some() {
            bail!("already in a session on this tab");
        }
        let response = self.request(&protocol::new_session_request(&client_id, room))?;
        if response.packet_type == PacketType::NsAck {
            let created = String::from_utf8_lossy(&response.data).to_string();
            self.tabs.lock().unwrap()[self.current_tab_index()] = Some(created.clone());
            Ok(Outcome::ack(created))
        } else {
            Ok(Outcome::nak(String::from_utf8_lossy(&response.data).to_string()))
        }
    }

    pub fn list(&self) -> anyhow::Result<Outcome> {
        let client_id = self.client_id().context("not logged in")?;
        let response = self.request(&protocol::query_request(&client_id))?;
        if response.packet_type == PacketType::QuAck {
            Ok(Outcome::ack(String::from_utf8_lossy(&response.data).to_string()))
        } else {
            Ok(Outcome::nak(String::from_utf8_lossy(&response.data).to_string()))
        }
    }

    pub fn send_message(&self, text: &str) -> anyhow::Result<Outcome> {
        let client_id = self.client_id().context("not logged in")?;
        let room = self.current_room().context("not in a session")?;
        let response = self.request(&protocol::message_request(&client_id, &room, text))?;
        if response.packet_type == PacketType::MessageAck {
            Ok(Outcome::ack(""))
        } else {
            Ok(Outcome::nak(String::from_utf8_lossy(&response.data).to_string()))
        }
    }

    /// Switches the active tab. Any tab index is valid; tabs beyond
    /// `MAX_SIMUL_SESSIONS - 1` are rejected by the caller before
    /// reaching here since this takes a plain array index.
    pub fn switch_tab(&self, tab: usize) -> anyhow::Result<()> {
        if tab >= MAX_SIMUL_SESSIONS {
            bail!("tab {tab} is out of range (max {})", MAX_SIMUL_SESSIONS - 1);
        }
        self.current_tab.store(tab, Ordering::SeqCst);
        Ok(())
    }

    /// Advances to the next tab, wrapping around. Used by `/switchtab`
    /// with no argument. Returns the new (0-indexed) tab.
    pub fn cycle_tab(&self) -> usize {
        let next = (self.current_tab_index() + 1) % MAX_SIMUL_SESSIONS;
        self.current_tab.store(next, Ordering::SeqCst);
        next
    }

    /// Exposed for the listener thread: take the socket lock for one
    /// non-blocking-ish recv attempt (using the calibrated timeout as
    /// the poll interval) and return raw bytes, or `None` on a timeout
    /// that should simply be retried.
    pub fn try_recv_broadcast(&self) -> anyhow::Result<Option<Vec<u8>>> {
        let mut socket = self.socket.lock().unwrap();
        socket.set_read_timeout(Some(self.recv_timeout())).context("setting listener read timeout")?;
        let mut buf = vec![0u8; MAX_NAME + MAX_DATA + 64];
        match socket.read(&mut buf) {
            Ok(0) => {
                self.listener_alive.store(false, Ordering::SeqCst);
                Ok(None)
            }
            Ok(n) => Ok(Some(buf[..n].to_vec())),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut => Ok(None),
            Err(e) => Err(e).context("listener recv failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn connected_pair() -> (ClientSession, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (ClientSession::new(client), server)
    }

    #[test]
    fn login_success_sets_client_id_and_marks_listener_alive() {
        let (session, mut server) = connected_pair();
        let handle = std::thread::spawn(move || session.login("alice", "pw").map(|o| (o, session)));
        let mut buf = [0u8; 256];
        let n = server.read(&mut buf).unwrap();
        let request = Packet::parse(&buf[..n]).unwrap();
        assert_eq!(request.packet_type, PacketType::Login);
        let response = Packet::new(PacketType::LoAck, "", b"alice".to_vec());
        server.write_all(&response.serialize()).unwrap();

        let (outcome, session) = handle.join().unwrap().unwrap();
        assert!(outcome.ok);
        assert_eq!(session.client_id(), Some("alice".to_string()));
        assert!(session.listener_alive.load(Ordering::SeqCst));
    }

    #[test]
    fn login_failure_does_not_set_client_id() {
        let (session, mut server) = connected_pair();
        let handle = std::thread::spawn(move || session.login("alice", "wrong").map(|o| (o, session)));
        let mut buf = [0u8; 256];
        let _ = server.read(&mut buf).unwrap();
        let response = Packet::new(PacketType::LoNak, "", Vec::new());
        server.write_all(&response.serialize()).unwrap();

        let (outcome, session) = handle.join().unwrap().unwrap();
        assert!(!outcome.ok);
        assert_eq!(session.client_id(), None);
    }

    #[test]
    fn switch_tab_rejects_out_of_range_index() {
        let (session, _server) = connected_pair();
        assert!(session.switch_tab(0).is_ok());
        assert!(session.switch_tab(MAX_SIMUL_SESSIONS).is_err());
    }

    #[test]
    fn tab_for_room_finds_the_matching_tab() {
        let (session, _server) = connected_pair();
        session.tabs.lock().unwrap()[2] = Some("room1".to_string());
        assert_eq!(session.tab_for_room("room1"), Some(2));
        assert_eq!(session.tab_for_room("ghost"), None);
    }
}
