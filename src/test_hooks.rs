//! A mechanism for exposing internal events to the test harness so
//! that integration tests can block on "the acceptor admitted a
//! connection" or "a broadcast was delivered" instead of sleeping and
//! hoping a background thread has caught up. Subscribers register a
//! [`crossbeam_channel`] sender; `emit` fans a named event out to
//! every live subscriber. Production code pays the cost of a lock
//! check per call site and nothing else when no test has subscribed.

use std::sync::{Mutex, OnceLock};
use std::time::Duration;

use tracing::trace;

fn subscribers() -> &'static Mutex<Vec<crossbeam_channel::Sender<String>>> {
    static SUBSCRIBERS: OnceLock<Mutex<Vec<crossbeam_channel::Sender<String>>>> = OnceLock::new();
    SUBSCRIBERS.get_or_init(|| Mutex::new(Vec::new()))
}

/// Registers a new subscriber and returns its receiving half.
pub fn subscribe() -> crossbeam_channel::Receiver<String> {
    let (tx, rx) = crossbeam_channel::unbounded();
    subscribers().lock().unwrap().push(tx);
    rx
}

/// Publishes `event` to every subscriber. Cheap no-op when nothing
/// has subscribed (the common case outside of tests).
pub fn emit(event: &str) {
    let subs = subscribers().lock().unwrap();
    if subs.is_empty() {
        return;
    }
    trace!(event, "test hook fired");
    for tx in subs.iter() {
        // a dropped receiver just means that test stopped listening
        let _ = tx.send(event.to_string());
    }
}

/// Blocks until `event` is observed or `timeout` elapses.
pub fn wait_for(rx: &crossbeam_channel::Receiver<String>, event: &str, timeout: Duration) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(std::time::Instant::now());
        if remaining.is_zero() {
            return false;
        }
        match rx.recv_timeout(remaining) {
            Ok(seen) if seen == event => return true,
            Ok(_) => continue,
            Err(_) => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_for_observes_emitted_event() {
        let rx = subscribe();
        emit("unit-test-event-marker");
        assert!(wait_for(&rx, "unit-test-event-marker", Duration::from_secs(1)));
    }

    #[test]
    fn wait_for_times_out_when_event_never_fires() {
        let rx = subscribe();
        assert!(!wait_for(&rx, "never-emitted-marker", Duration::from_millis(50)));
    }
}
