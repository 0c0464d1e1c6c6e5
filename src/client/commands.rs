//! Parses one line of REPL input into a [`Command`]. Token-count
//! gating matches the original client exactly: a slash command with
//! the wrong number of arguments is `Invalid`, not guessed at.

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Login { user: String, pass: String, host: String, port: u16 },
    Logout,
    JoinSession { room: String },
    LeaveSession,
    CreateSession { room: String },
    List,
    /// `Some(n)` jumps to the 1-indexed tab `n`; `None` cycles to the
    /// next tab, per `/switchtab`'s "accept either form" rule.
    SwitchTab { tab: Option<usize> },
    Quit,
    Message(String),
    /// Unrecognized command or wrong argument count. The caller is
    /// expected to print help text.
    Invalid,
}

pub fn parse(line: &str) -> Command {
    let line = line.trim_end_matches(['\n', '\r']);
    if !line.starts_with('/') {
        return Command::Message(line.to_string());
    }

    let tokens: Vec<&str> = line.split_whitespace().collect();
    match tokens.as_slice() {
        ["/login", user, pass, host, port] => match port.parse::<u16>() {
            Ok(port) => Command::Login { user: user.to_string(), pass: pass.to_string(), host: host.to_string(), port },
            Err(_) => Command::Invalid,
        },
        ["/logout"] => Command::Logout,
        ["/joinsession", room] => Command::JoinSession { room: room.to_string() },
        ["/leavesession"] => Command::LeaveSession,
        ["/createsession", room] => Command::CreateSession { room: room.to_string() },
        ["/list"] => Command::List,
        ["/switchtab"] => Command::SwitchTab { tab: None },
        ["/switchtab", tab] => match tab.parse::<usize>() {
            Ok(tab) => Command::SwitchTab { tab: Some(tab) },
            Err(_) => Command::Invalid,
        },
        ["/quit"] => Command::Quit,
        _ => Command::Invalid,
    }
}
