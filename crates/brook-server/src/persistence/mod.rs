//! JSON session store.
//!
//! Persistent sessions, the subscription tree and retained messages are
//! written to a single JSON document so they survive broker restarts.
//!
//! ```text
//! {
//!   "session_store":     { "<client id>": { "message_queue": [...], ... } },
//!   "retain_tree":       { "topic_level": { "a": { "message": {...} } } },
//!   "subscription_tree": { "topic_filter": { "a": { "qos_map": {...} } } }
//! }
//! ```
//!
//! On startup: read the file, then remove it
//! On shutdown and every sync interval: write the file

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::retain::RetainTree;
use crate::session::Session;
use crate::subscription::SubscriptionTree;

/// Contents of the session store file.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct SessionStore {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub session_store: BTreeMap<String, Session>,
    #[serde(default, skip_serializing_if = "RetainTree::is_empty")]
    pub retain_tree: RetainTree,
    #[serde(default, skip_serializing_if = "SubscriptionTree::is_empty")]
    pub subscription_tree: SubscriptionTree,
}

/// Errors from the persistence layer.
#[derive(Debug)]
pub enum PersistenceError {
    /// Reading or writing the store file failed.
    Io(std::io::Error),
    /// The store could not be encoded.
    Json(serde_json::Error),
}

impl std::fmt::Display for PersistenceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PersistenceError::Io(e) => write!(f, "IO error: {}", e),
            PersistenceError::Json(e) => write!(f, "JSON error: {}", e),
        }
    }
}

impl std::error::Error for PersistenceError {}

impl From<std::io::Error> for PersistenceError {
    fn from(e: std::io::Error) -> Self {
        PersistenceError::Io(e)
    }
}

impl From<serde_json::Error> for PersistenceError {
    fn from(e: serde_json::Error) -> Self {
        PersistenceError::Json(e)
    }
}

/// Load the store at `path` and remove the file.
///
/// A missing file yields an empty store. So does a corrupt one, with a
/// warning, so a bad file never keeps the broker from starting.
pub fn load<P: AsRef<Path>>(path: P) -> Result<SessionStore, PersistenceError> {
    let path = path.as_ref();
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            info!("No session store at {}", path.display());
            return Ok(SessionStore::default());
        }
        Err(e) => return Err(e.into()),
    };
    fs::remove_file(path)?;

    match serde_json::from_str(&content) {
        Ok(store) => {
            info!("Loaded session store from {}", path.display());
            Ok(store)
        }
        Err(e) => {
            warn!(
                "Ignoring corrupt session store {}: {}",
                path.display(),
                e
            );
            Ok(SessionStore::default())
        }
    }
}

/// Write a snapshot to `path`, replacing any previous file.
pub fn save<P: AsRef<Path>>(path: P, snapshot: &serde_json::Value) -> Result<(), PersistenceError> {
    let path = path.as_ref();
    let json = serde_json::to_string_pretty(snapshot)?;
    // Written beside the target, then renamed over it
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json)?;
    fs::rename(&tmp, path)?;
    log::debug!("Saved session store to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Broker, BrokerOptions};
    use brook_core::{Message, QoS};
    use mio::Token;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let store = load(dir.path().join("none.json")).unwrap();
        assert!(store.session_store.is_empty());
        assert!(store.retain_tree.is_empty());
        assert!(store.subscription_tree.is_empty());
    }

    #[test]
    fn test_corrupt_file_is_empty_and_removed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.json");
        fs::write(&path, "{ not json").unwrap();
        let store = load(&path).unwrap();
        assert!(store.session_store.is_empty());
        assert!(!path.exists());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.json");

        let mut broker = Broker::default();
        let mut out = Vec::new();
        broker.new_session("c", Token(1), false);
        broker.subscribe("c", "a/+", QoS::AtLeastOnce, &mut out);
        broker.release_session("c", Token(1));
        broker.publish(None, Message::new("a/b", "hi", QoS::AtLeastOnce, false), &mut out);
        broker.publish(None, Message::new("r", "kept", QoS::AtMostOnce, true), &mut out);

        save(&path, &broker.snapshot().unwrap()).unwrap();
        assert!(path.exists());

        let store = load(&path).unwrap();
        assert!(!path.exists());
        let queue = store.session_store["c"].message_queue();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].message.as_ref(), b"hi");

        let restored = Broker::restore(BrokerOptions::default(), store);
        assert_eq!(restored.subscriptions("c"), vec!["a/+"]);
        assert_eq!(restored.retained_messages()[0].0, "r");
    }

    #[test]
    fn test_empty_sections_omitted() {
        let json = serde_json::to_string(&SessionStore::default()).unwrap();
        assert_eq!(json, "{}");
    }
}
