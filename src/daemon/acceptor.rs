//! The accept loop: blocks on admission before accepting a socket at
//! all, so a connection over the bound never occupies a worker slot
//! even transiently, then hands each accepted stream to its own
//! worker thread.

use std::net::TcpListener;
use std::sync::Arc;
use std::thread;

use tracing::{error, info, warn};

use crate::daemon::worker;
use crate::registry::Registry;
use crate::test_hooks;

/// Runs forever, accepting connections and spawning a worker thread
/// per connection. Returns only if the listener itself errors out.
pub fn run(listener: TcpListener, registry: Arc<Registry>) -> anyhow::Result<()> {
    loop {
        registry.reserve_admission_slot();

        let (stream, addr) = match listener.accept() {
            Ok(pair) => pair,
            Err(e) => {
                error!(error = %e, "accept failed");
                registry.release_admission_slot();
                continue;
            }
        };

        let worker_stream = match stream.try_clone() {
            Ok(s) => s,
            Err(e) => {
                warn!(addr = %addr, error = %e, "failed to clone accepted stream, dropping connection");
                registry.release_admission_slot();
                continue;
            }
        };

        let conn = match registry.register_connection(addr, stream) {
            Ok(conn) => conn,
            Err(e) => {
                warn!(addr = %addr, error = %e, "failed to register connection, dropping it");
                registry.release_admission_slot();
                continue;
            }
        };

        let registry = Arc::clone(&registry);

        info!(conn_id = conn.id, addr = %addr, "accepted connection");
        test_hooks::emit("connection-accepted");

        thread::spawn(move || {
            if let Err(e) = worker::run(&registry, worker_stream, &conn) {
                warn!(conn_id = conn.id, error = %e, "worker exited with error");
            }
        });
    }
}
