//! Graceful shutdown for `SIGINT`/`SIGTERM`. The server has no
//! cancellation path for a hung client connection (per §5, only a
//! socket close interrupts a worker), but the acceptor thread itself
//! should still exit cleanly on a signal rather than being killed
//! mid-accept.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread;

use anyhow::Context;
use signal_hook::consts::TERM_SIGNALS;
use signal_hook::iterator::Signals;
use tracing::info;

pub struct Handler;

impl Handler {
    pub fn new() -> Self {
        Handler
    }

    /// Spawns a background thread that waits for the first
    /// `SIGINT`/`SIGTERM` and exits the process. A second signal
    /// before the first has been handled terminates immediately,
    /// matching the teacher's "mashing ^C" escape hatch.
    pub fn spawn(self) -> anyhow::Result<()> {
        let term_now = Arc::new(AtomicBool::new(false));
        for sig in TERM_SIGNALS {
            signal_hook::flag::register_conditional_shutdown(*sig, 1, Arc::clone(&term_now))?;
            signal_hook::flag::register(*sig, Arc::clone(&term_now))?;
        }

        let mut signals = Signals::new(TERM_SIGNALS).context("creating signal iterator")?;
        thread::spawn(move || {
            if let Some(sig) = (&mut signals).into_iter().next() {
                info!(signal = sig, "received shutdown signal, exiting");
                std::process::exit(0);
            }
        });

        Ok(())
    }
}

impl Default for Handler {
    fn default() -> Self {
        Self::new()
    }
}
