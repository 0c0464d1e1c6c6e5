//! The server daemon: reads configuration, loads the password file,
//! binds the listening socket, installs the signal handler, and runs
//! the accept loop until the process is killed.

pub mod acceptor;
pub mod signals;
pub mod worker;

use std::collections::HashMap;
use std::net::TcpListener;
use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use crate::config::Config;
use crate::registry::Registry;

/// Everything the daemon needs to start serving.
pub struct Options {
    pub port: u16,
    pub users: HashMap<String, String>,
    pub config: Config,
}

/// Parses a password file: one `<username>\t<password>` pair per
/// line, blank lines ignored. Matches the original server's
/// tab-separated credential file.
pub fn load_password_file(contents: &str) -> anyhow::Result<HashMap<String, String>> {
    let mut users = HashMap::new();
    for (lineno, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let mut parts = line.splitn(2, '\t');
        let user = parts.next().context("missing username field")?;
        let pass = parts
            .next()
            .with_context(|| format!("password file line {}: missing password field", lineno + 1))?;
        users.insert(user.to_string(), pass.to_string());
    }
    Ok(users)
}

/// Binds the listener, installs the signal handler, and runs the
/// accept loop. Does not return under normal operation.
pub fn run(opts: Options) -> anyhow::Result<()> {
    let registry = Arc::new(Registry::new(opts.users, opts.config.max_connections()));

    let listener = bind_with_backlog(opts.port, opts.config.listen_backlog())
        .with_context(|| format!("binding to port {}", opts.port))?;
    info!(port = opts.port, max_connections = opts.config.max_connections(), "chat server listening");

    signals::Handler::new().spawn().context("installing signal handler")?;

    acceptor::run(listener, registry)
}

/// `std::net::TcpListener::bind` has no way to pass a backlog value
/// through to `listen(2)` — that requires `socket2`, which nothing
/// else in this crate needs. The configured backlog is accepted and
/// threaded through from `Config` but not actually applied; the
/// platform default backlog is used regardless.
fn bind_with_backlog(port: u16, _backlog: i32) -> anyhow::Result<TcpListener> {
    TcpListener::bind(("0.0.0.0", port)).context("binding TCP listener")
}
