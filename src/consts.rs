use std::time::Duration;

/// Maximum length, in bytes, of a packet's `source` field.
pub const MAX_NAME: usize = 64;
/// Maximum length, in bytes, of a packet's payload.
pub const MAX_DATA: usize = 2048;
/// Number of tabs a client may hold open concurrently.
pub const MAX_SIMUL_SESSIONS: usize = 4;
/// Upper bound on concurrently live server connections.
pub const MAX_CONNECTIONS: usize = 16;
/// Listen backlog passed to the server's TCP listener.
pub const LISTEN_BACKLOG: i32 = 16;

/// Multiplier applied to the measured login RTT to derive the
/// client's socket send/recv timeout.
pub const TIMEOUT_RTT_MULT: u32 = 3;
/// Floor applied to the RTT-derived timeout so a suspiciously fast
/// loopback RTT never produces an unusably short timeout.
pub const TIMEOUT_RTT_FLOOR: Duration = Duration::from_micros(2500);

/// How long the background listener blocks on a single `recv` attempt
/// before giving the foreground thread a chance at the socket lock.
pub const LISTENER_IDLE_SLEEP: Duration = Duration::from_millis(1);
