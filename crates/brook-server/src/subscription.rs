//! Subscription store with trie-based topic matching.
//!
//! Each node is one topic level of a filter. Literal levels, `+` and `#` are
//! all ordinary children keyed by their text; matching decides how to walk
//! them. Subscribers are stored on the node where their filter ends.

use ahash::AHashMap;
use brook_core::topic::{MULTI_LEVEL_WILDCARD, SINGLE_LEVEL_WILDCARD};
use brook_core::QoS;
use serde::{Deserialize, Serialize};

fn is_empty_map<V>(map: &AHashMap<String, V>) -> bool {
    map.is_empty()
}

/// A node in the subscription trie.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct TrieNode {
    /// Child nodes by topic level.
    #[serde(default, skip_serializing_if = "is_empty_map")]
    topic_filter: AHashMap<String, TrieNode>,
    /// Clients whose filter ends here, with their granted QoS.
    #[serde(default, skip_serializing_if = "is_empty_map")]
    qos_map: AHashMap<String, QoS>,
}

impl TrieNode {
    fn is_empty(&self) -> bool {
        self.topic_filter.is_empty() && self.qos_map.is_empty()
    }

    fn insert(&mut self, levels: &[&str], client_id: &str, qos: QoS) -> bool {
        match levels.split_first() {
            None => self.qos_map.insert(client_id.to_string(), qos).is_none(),
            Some((level, rest)) => self
                .topic_filter
                .entry(level.to_string())
                .or_default()
                .insert(rest, client_id, qos),
        }
    }

    /// Remove a client at the end of `levels`, pruning emptied nodes.
    fn remove(&mut self, levels: &[&str], client_id: &str) -> bool {
        let Some((level, rest)) = levels.split_first() else {
            return self.qos_map.remove(client_id).is_some();
        };
        let Some(child) = self.topic_filter.get_mut(*level) else {
            return false;
        };
        let removed = child.remove(rest, client_id);
        if child.is_empty() {
            self.topic_filter.remove(*level);
        }
        removed
    }

    /// Remove every client for which `keep` is false, pruning emptied nodes.
    fn retain_clients(&mut self, keep: &impl Fn(&str) -> bool) {
        self.qos_map.retain(|client_id, _| keep(client_id.as_str()));
        self.topic_filter.retain(|_, child| {
            child.retain_clients(keep);
            !child.is_empty()
        });
    }

    fn collect_subscribers(&self, out: &mut AHashMap<String, QoS>) {
        for (client_id, &qos) in &self.qos_map {
            let granted = out.entry(client_id.clone()).or_insert(qos);
            *granted = (*granted).max(qos);
        }
    }

    fn matches(&self, levels: &[&str], at_root: bool, out: &mut AHashMap<String, QoS>) {
        // Wildcards at the first level never match `$` topics
        let wildcards = !(at_root && levels.first().is_some_and(|level| level.starts_with('$')));

        let Some((level, rest)) = levels.split_first() else {
            self.collect_subscribers(out);
            // `a/#` also matches `a`
            if let Some(hash) = self.topic_filter.get(MULTI_LEVEL_WILDCARD) {
                hash.collect_subscribers(out);
            }
            return;
        };

        if wildcards {
            if let Some(hash) = self.topic_filter.get(MULTI_LEVEL_WILDCARD) {
                hash.collect_subscribers(out);
            }
            if let Some(plus) = self.topic_filter.get(SINGLE_LEVEL_WILDCARD) {
                plus.matches(rest, false, out);
            }
        }
        if let Some(child) = self.topic_filter.get(*level) {
            child.matches(rest, false, out);
        }
    }

    /// `filter` is the full filter leading to this node.
    fn filters_of(&self, client_id: &str, filter: &str, out: &mut Vec<(String, QoS)>) {
        if let Some(&qos) = self.qos_map.get(client_id) {
            out.push((filter.to_string(), qos));
        }
        for (level, child) in &self.topic_filter {
            child.filters_of(client_id, &format!("{}/{}", filter, level), out);
        }
    }
}

/// Subscription trie shared by all sessions.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionTree {
    root: TrieNode,
}

impl SubscriptionTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }

    /// Add or replace a subscription. Returns true if it is new.
    pub fn subscribe(&mut self, filter: &str, client_id: &str, qos: QoS) -> bool {
        let levels: Vec<&str> = filter.split('/').collect();
        self.root.insert(&levels, client_id, qos)
    }

    /// Remove a subscription. Returns false if the client was not subscribed.
    pub fn unsubscribe(&mut self, filter: &str, client_id: &str) -> bool {
        let levels: Vec<&str> = filter.split('/').collect();
        self.root.remove(&levels, client_id)
    }

    /// Remove every subscription of a client.
    pub fn unsubscribe_all(&mut self, client_id: &str) {
        self.root.retain_clients(&|id| id != client_id);
    }

    /// Keep only subscriptions of clients accepted by `keep`.
    pub fn retain_clients(&mut self, keep: impl Fn(&str) -> bool) {
        self.root.retain_clients(&keep);
    }

    /// Clients subscribed to filters matching `topic`. A client matched by
    /// several filters appears once, at the highest QoS among them.
    pub fn matches(&self, topic: &str) -> AHashMap<String, QoS> {
        let levels: Vec<&str> = topic.split('/').collect();
        let mut out = AHashMap::new();
        self.root.matches(&levels, true, &mut out);
        out
    }

    /// Filters a client is subscribed to, sorted.
    pub fn subscriptions(&self, client_id: &str) -> Vec<(String, QoS)> {
        let mut out = Vec::new();
        for (level, child) in &self.root.topic_filter {
            child.filters_of(client_id, level, &mut out);
        }
        out.sort();
        out
    }
}
