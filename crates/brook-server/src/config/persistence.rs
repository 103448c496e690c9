//! Persistence configuration.
//!
//! Controls the JSON session store.

use std::path::PathBuf;

use serde::Deserialize;

/// Default session store file.
pub const DEFAULT_PERSISTENCE_PATH: &str = "brook-session-store.json";

/// Default periodic save interval.
pub const DEFAULT_SYNC_INTERVAL_SECS: u64 = 60;

/// Persistence configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Persist sessions, subscriptions and retained messages across restarts.
    pub enabled: bool,

    /// Session store file. It is read at startup and then removed.
    pub path: PathBuf,

    /// Save interval in seconds. 0 saves only on shutdown.
    pub sync_interval_secs: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: PathBuf::from(DEFAULT_PERSISTENCE_PATH),
            sync_interval_secs: DEFAULT_SYNC_INTERVAL_SECS,
        }
    }
}

impl PersistenceConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.enabled && self.path.as_os_str().is_empty() {
            return Err("persistence.path must be set when persistence is enabled".into());
        }
        Ok(())
    }
}
