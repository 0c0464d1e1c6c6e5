//! The background listener thread: owns incoming broadcast delivery
//! while the foreground REPL thread is free to read the next command.
//! It takes the socket lock only for the duration of one recv attempt,
//! so it never starves a foreground request/response exchange for
//! longer than one timeout window.

use std::sync::Arc;
use std::thread;

use tracing::{debug, warn};

use crate::client::session::ClientSession;
use crate::consts::LISTENER_IDLE_SLEEP;
use crate::protocol::{self, Packet};

/// Runs until the session is logged out or the connection drops.
/// Intended to be the body of a dedicated thread spawned right after
/// a successful login.
pub fn run(session: Arc<ClientSession>) {
    use std::sync::atomic::Ordering;

    while session.listener_alive.load(Ordering::SeqCst) {
        match session.try_recv_broadcast() {
            Ok(Some(raw)) => render(&session, &raw),
            Ok(None) => thread::sleep(LISTENER_IDLE_SLEEP),
            Err(e) => {
                warn!(error = %e, "listener recv failed, exiting");
                break;
            }
        }
    }
    debug!("listener thread exiting");
}

fn render(session: &ClientSession, raw: &[u8]) {
    let packet = match Packet::parse(raw) {
        Ok(p) => p,
        Err(e) => {
            warn!(error = %e, "listener received an unparsable packet");
            return;
        }
    };

    let Some((room, text)) = protocol::split_message_body(&packet.data) else {
        warn!("listener received a broadcast with no room delimiter");
        return;
    };

    // Explicit unknown-tab path: a room that matches no tab is
    // rendered as such instead of silently attributed to tab 0.
    let label = match session.tab_for_room(room) {
        Some(_) => room.to_string(),
        None => format!("{room} (unknown session)"),
    };

    let prompt_tab = session.current_tab_index();
    print!("\rSession {label}: {}: {}\n\r", packet.source, String::from_utf8_lossy(text));
    match session.room_in_tab(prompt_tab) {
        Some(prompt_room) => print!("Tab {} '{prompt_room}'> ", prompt_tab + 1),
        None => print!("Tab {}> ", prompt_tab + 1),
    }
    let _ = std::io::Write::flush(&mut std::io::stdout());
}
