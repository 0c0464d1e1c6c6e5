//! Optional server configuration. None of these knobs are part of the
//! wire protocol; they tune operational behavior the protocol itself
//! doesn't dictate (admission bound, listen backlog, log verbosity).
//! Absent a `--config` file, every field falls back to the value the
//! spec names as the default.

use serde_derive::Deserialize;

use crate::consts::{LISTEN_BACKLOG, MAX_CONNECTIONS};

#[derive(Deserialize, Default)]
pub struct Config {
    /// Overrides `MAX_CONNECTIONS`.
    pub max_connections: Option<usize>,
    /// Overrides the TCP listen backlog.
    pub listen_backlog: Option<i32>,
    /// `"error"`, `"warn"`, `"info"`, `"debug"`, or `"trace"`.
    pub log_level: Option<String>,
}

impl Config {
    pub fn from_toml_str(s: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(s)?)
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections.unwrap_or(MAX_CONNECTIONS)
    }

    pub fn listen_backlog(&self) -> i32 {
        self.listen_backlog.unwrap_or(LISTEN_BACKLOG)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_constants_when_file_is_empty() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config.max_connections(), MAX_CONNECTIONS);
        assert_eq!(config.listen_backlog(), LISTEN_BACKLOG);
    }

    #[test]
    fn overrides_apply_when_present() {
        let config = Config::from_toml_str("max_connections = 4\nlisten_backlog = 8\n").unwrap();
        assert_eq!(config.max_connections(), 4);
        assert_eq!(config.listen_backlog(), 8);
    }
}
