//! Exercises the full client stack (`ClientSession` plus the
//! background listener) against a real server, and the server
//! binary's password-file loading.

use std::collections::HashMap;
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chatroom::client::session::ClientSession;
use chatroom::daemon::{self, acceptor};
use chatroom::registry::Registry;

fn start_server(users: HashMap<String, String>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let registry = Arc::new(Registry::with_default_bound(users));
    thread::spawn(move || {
        let _ = acceptor::run(listener, registry);
    });
    addr
}

#[test]
fn switching_tabs_keeps_each_rooms_membership_independent() {
    let mut users = HashMap::new();
    users.insert("alice".to_string(), "pw".to_string());
    let addr = start_server(users);

    let stream = TcpStream::connect(&addr).unwrap();
    let session = Arc::new(ClientSession::new(stream));
    let outcome = session.login("alice", "pw").unwrap();
    assert!(outcome.ok);

    let created = session.create_session("general").unwrap();
    assert!(created.ok);
    assert_eq!(session.current_room(), Some("general".to_string()));

    session.switch_tab(1).unwrap();
    assert_eq!(session.current_room(), None);
    let created_second = session.create_session("random").unwrap();
    assert!(created_second.ok);
    assert_eq!(session.current_room(), Some("random".to_string()));

    session.switch_tab(0).unwrap();
    assert_eq!(session.current_room(), Some("general".to_string()));
    assert_eq!(session.tab_for_room("random"), Some(1));
}

#[test]
fn logout_is_fire_and_forget_and_clears_client_id() {
    let mut users = HashMap::new();
    users.insert("alice".to_string(), "pw".to_string());
    let addr = start_server(users);

    let stream = TcpStream::connect(&addr).unwrap();
    let session = ClientSession::new(stream);
    session.login("alice", "pw").unwrap();
    assert!(session.client_id().is_some());

    session.logout().unwrap();
    assert_eq!(session.client_id(), None);
    assert!(!session.listener_alive.load(std::sync::atomic::Ordering::SeqCst));
}

#[test]
fn password_file_round_trips_through_the_real_loader() {
    use std::io::Write;
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "alice\thunter2").unwrap();
    writeln!(file, "bob\tswordfish").unwrap();

    let contents = std::fs::read_to_string(file.path()).unwrap();
    let users = daemon::load_password_file(&contents).unwrap();
    assert_eq!(users.get("alice"), Some(&"hunter2".to_string()));
    assert_eq!(users.get("bob"), Some(&"swordfish".to_string()));
}

#[test]
fn message_text_with_random_bytes_survives_the_round_trip() {
    use rand::Rng;
    let mut users = HashMap::new();
    users.insert("alice".to_string(), "pw".to_string());
    users.insert("bob".to_string(), "pw".to_string());
    let addr = start_server(users);

    let alice_stream = TcpStream::connect(&addr).unwrap();
    let alice = ClientSession::new(alice_stream);
    alice.login("alice", "pw").unwrap();
    alice.create_session("room1").unwrap();

    let bob_stream = TcpStream::connect(&addr).unwrap();
    let bob = Arc::new(ClientSession::new(bob_stream));
    bob.login("bob", "pw").unwrap();
    bob.join_session("room1").unwrap();

    let mut rng = rand::thread_rng();
    let text: String = (0..32).map(|_| rng.gen_range('a'..='z')).collect();

    let ack = alice.send_message(&text).unwrap();
    assert!(ack.ok);

    thread::sleep(Duration::from_millis(100));
    let raw = bob.try_recv_broadcast().unwrap();
    assert!(raw.is_some(), "bob should have received alice's broadcast");
}
