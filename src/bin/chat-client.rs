use std::fs;
use std::io::{self, BufRead, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::thread;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use chatroom::client::commands::{self, Command};
use chatroom::client::listener;
use chatroom::client::session::ClientSession;

/// Interactive chat client.
#[derive(Parser, Debug)]
#[command(name = "chat-client", about = "Multi-room chat client")]
struct Args {
    /// Write logs to this file instead of stderr.
    #[arg(long)]
    log_file: Option<String>,

    /// Increase log verbosity; may be repeated.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

const HELP: &str = "\
Commands:
  /login <id> <pw> <host> <port>   connect and log in
  /logout                          log out
  /createsession <room>            create and join a room on the current tab
  /joinsession <room>              join a room on the current tab
  /leavesession                    leave the room on the current tab
  /list                            list rooms and their members
  /switchtab [n]                   switch to tab n (1-4), or cycle if omitted
  /quit                            exit
  anything else                    sent as a message to the current tab's room";

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.verbose, args.log_file.as_deref())?;

    let mut session: Option<Arc<ClientSession>> = None;

    println!("{HELP}");
    print_prompt(session.as_deref());
    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = line.context("reading stdin")?;
        match commands::parse(&line) {
            Command::Login { user, pass, host, port } => {
                match connect_or_reuse(&mut session, &host, port) {
                    Ok(sess) => match sess.login(&user, &pass) {
                        Ok(outcome) if outcome.ok => {
                            println!("Logged in as {}", outcome.body);
                            let listener_session = Arc::clone(&sess);
                            thread::spawn(move || listener::run(listener_session));
                        }
                        Ok(outcome) => println!("Login error: {}", outcome.body),
                        Err(e) => println!("Login failed: {e}"),
                    },
                    Err(e) => println!("Connection failed: {e}"),
                }
            }
            Command::Logout => with_session(&session, |sess| match sess.logout() {
                Ok(()) => println!("Logged out"),
                Err(e) => println!("Logout error: {e}"),
            }),
            Command::JoinSession { room } => {
                with_session(&session, |sess| report(sess.join_session(&room), "Joined session", "Join session error"))
            }
            Command::LeaveSession => {
                with_session(&session, |sess| report(sess.leave_session(), "Left session", "Error leaving session"))
            }
            Command::CreateSession { room } => with_session(&session, |sess| {
                report(sess.create_session(&room), "Session created", "Create session error")
            }),
            Command::List => with_session(&session, |sess| report(sess.list(), "", "Error listing sessions")),
            Command::SwitchTab { tab } => with_session(&session, |sess| match tab {
                None => println!("Switched to tab {}", sess.cycle_tab() + 1),
                Some(n) => match n.checked_sub(1).and_then(|t| sess.switch_tab(t).ok().map(|_| t)) {
                    Some(t) => println!("Switched to tab {}", t + 1),
                    None => println!("Invalid tab {n}"),
                },
            }),
            Command::Quit => {
                if let Some(sess) = &session {
                    if sess.client_id().is_some() {
                        let _ = sess.logout();
                    }
                }
                break;
            }
            Command::Message(text) => match &session {
                Some(sess) if sess.client_id().is_some() => {
                    report(sess.send_message(&text), "", "Error sending message")
                }
                _ => println!("{HELP}"),
            },
            Command::Invalid => println!("{HELP}"),
        }
        print_prompt(session.as_deref());
    }

    Ok(())
}

/// Reuses the existing connection if one is already open, matching
/// `chatclient_login`'s "only open a socket if none exists yet"
/// check; otherwise connects fresh and stores the new session.
fn connect_or_reuse(session: &mut Option<Arc<ClientSession>>, host: &str, port: u16) -> anyhow::Result<Arc<ClientSession>> {
    if let Some(sess) = session {
        return Ok(Arc::clone(sess));
    }
    let stream = TcpStream::connect((host, port)).with_context(|| format!("connecting to {host}:{port}"))?;
    let sess = Arc::new(ClientSession::new(stream));
    *session = Some(Arc::clone(&sess));
    Ok(sess)
}

fn with_session(session: &Option<Arc<ClientSession>>, op: impl FnOnce(&Arc<ClientSession>)) {
    match session {
        Some(sess) => op(sess),
        None => println!("Not connected. Use /login <id> <pw> <host> <port>."),
    }
}

fn report(result: anyhow::Result<chatroom::client::session::Outcome>, ok_prefix: &str, err_prefix: &str) {
    match result {
        Ok(outcome) if outcome.ok => {
            if ok_prefix.is_empty() {
                if !outcome.body.is_empty() {
                    println!("{}", outcome.body);
                }
            } else if outcome.body.is_empty() {
                println!("{ok_prefix}");
            } else {
                println!("{ok_prefix}: {}", outcome.body);
            }
        }
        Ok(outcome) => println!("{err_prefix}: {}", outcome.body),
        Err(e) => println!("{err_prefix}: {e}"),
    }
}

fn print_prompt(session: Option<&ClientSession>) {
    match session {
        Some(session) => {
            let tab = session.current_tab_index();
            match session.current_room() {
                Some(room) => print!("Tab {} '{room}'> ", tab + 1),
                None => print!("Tab {}> ", tab + 1),
            }
        }
        None => print!("Tab 1> "),
    }
    let _ = io::stdout().flush();
}

fn init_logging(verbose: u8, log_file: Option<&str>) -> anyhow::Result<()> {
    let level = match verbose {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    match log_file {
        Some(path) => {
            let file = fs::File::create(path).with_context(|| format!("creating log file {path}"))?;
            builder.with_writer(file).with_ansi(false).init();
        }
        None => builder.init(),
    }
    Ok(())
}
