//! Client session store.
//!
//! The in-flight QoS state is kept in a JSON file between runs so a
//! persistent session can finish its handshakes after a restart. The file
//! is removed once loaded and written again when the client is dropped.

use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use brook_core::InflightState;
use log::{debug, warn};

use crate::error::Result;

/// Load the in-flight state at `path` and remove the file.
///
/// A missing or corrupt file yields empty state.
pub fn load(path: &Path) -> Result<InflightState> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(InflightState::default()),
        Err(e) => return Err(e.into()),
    };
    fs::remove_file(path)?;

    match serde_json::from_str(&content) {
        Ok(state) => {
            debug!("Loaded client session from {}", path.display());
            Ok(state)
        }
        Err(e) => {
            warn!("Ignoring corrupt client session {}: {}", path.display(), e);
            Ok(InflightState::default())
        }
    }
}

/// Write the in-flight state to `path`.
pub fn save(path: &Path, state: &InflightState) -> Result<()> {
    let json = serde_json::to_string_pretty(state)?;
    fs::write(path, json)?;
    debug!("Saved client session to {}", path.display());
    Ok(())
}
