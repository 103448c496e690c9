//! Session configuration.

use serde::Deserialize;

/// Default maximum keep alive in seconds.
pub const DEFAULT_MAX_KEEP_ALIVE: u16 = 65535;

/// Session configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Maximum keep alive in seconds (client value capped to this).
    #[serde(default = "default_max_keep_alive")]
    pub max_keep_alive: u16,

    /// Messages held for one disconnected session. When full the oldest is
    /// dropped. 0 = unbounded.
    #[serde(default)]
    pub max_queued_messages: usize,
}

fn default_max_keep_alive() -> u16 {
    DEFAULT_MAX_KEEP_ALIVE
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_keep_alive: DEFAULT_MAX_KEEP_ALIVE,
            max_queued_messages: 0,
        }
    }
}

impl SessionConfig {
    /// Apply the cap to a client's requested keep alive. A request of 0 keeps
    /// the timeout disabled.
    pub fn effective_keep_alive(&self, requested: u16) -> u16 {
        if requested == 0 || self.max_keep_alive == 0 {
            requested
        } else {
            requested.min(self.max_keep_alive)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_keep_alive() {
        let config = SessionConfig {
            max_keep_alive: 60,
            ..Default::default()
        };
        assert_eq!(config.effective_keep_alive(0), 0);
        assert_eq!(config.effective_keep_alive(30), 30);
        assert_eq!(config.effective_keep_alive(600), 60);
    }
}
