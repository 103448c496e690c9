//! Retained message store.
//!
//! A trie keyed by topic level holding at most one message per topic.
//! Subscribing walks it with the new filter to replay matching messages.

use ahash::AHashMap;
use brook_core::topic::{MULTI_LEVEL_WILDCARD, SINGLE_LEVEL_WILDCARD};
use brook_core::Message;
use serde::{Deserialize, Serialize};

fn is_empty_map<V>(map: &AHashMap<String, V>) -> bool {
    map.is_empty()
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct RetainNode {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    message: Option<Message>,
    #[serde(default, skip_serializing_if = "is_empty_map")]
    topic_level: AHashMap<String, RetainNode>,
}

impl RetainNode {
    fn is_empty(&self) -> bool {
        self.message.is_none() && self.topic_level.is_empty()
    }

    fn insert(&mut self, levels: &[&str], message: Message) {
        match levels.split_first() {
            None => self.message = Some(message),
            Some((level, rest)) => self
                .topic_level
                .entry(level.to_string())
                .or_default()
                .insert(rest, message),
        }
    }

    fn release(&mut self, levels: &[&str]) -> bool {
        let Some((level, rest)) = levels.split_first() else {
            return self.message.take().is_some();
        };
        let Some(child) = self.topic_level.get_mut(*level) else {
            return false;
        };
        let released = child.release(rest);
        if child.is_empty() {
            self.topic_level.remove(*level);
        }
        released
    }

    /// Every message in this subtree. `skip_dollar` hides `$` children of
    /// this node.
    fn collect_all(&self, skip_dollar: bool, out: &mut Vec<Message>) {
        out.extend(self.message.iter().cloned());
        for (level, child) in &self.topic_level {
            if !(skip_dollar && level.starts_with('$')) {
                child.collect_all(false, out);
            }
        }
    }

    fn matching(&self, filter: &[&str], at_root: bool, out: &mut Vec<Message>) {
        let Some((level, rest)) = filter.split_first() else {
            out.extend(self.message.iter().cloned());
            return;
        };
        match *level {
            MULTI_LEVEL_WILDCARD => {
                // Includes the parent level itself, except at the root
                self.collect_all(at_root, out);
            }
            SINGLE_LEVEL_WILDCARD => {
                for (name, child) in &self.topic_level {
                    if !(at_root && name.starts_with('$')) {
                        child.matching(rest, false, out);
                    }
                }
            }
            literal => {
                if let Some(child) = self.topic_level.get(literal) {
                    child.matching(rest, false, out);
                }
            }
        }
    }
}

/// Retained messages by topic.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RetainTree {
    root: RetainNode,
}

impl RetainTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }

    /// Store `message` as the retained message of its topic. An empty payload
    /// removes the retained message instead (MQTT-3.3.1-10).
    pub fn retain(&mut self, message: Message) {
        let topic = message.topic.clone();
        let levels: Vec<&str> = topic.split('/').collect();
        if message.message.is_empty() {
            self.root.release(&levels);
        } else {
            self.root.insert(&levels, message);
        }
    }

    /// Retained messages whose topic matches `filter`.
    pub fn matching(&self, filter: &str) -> Vec<Message> {
        let levels: Vec<&str> = filter.split('/').collect();
        let mut out = Vec::new();
        self.root.matching(&levels, true, &mut out);
        out
    }

    /// Every retained message, sorted by topic.
    pub fn messages(&self) -> Vec<Message> {
        let mut out = Vec::new();
        self.root.collect_all(false, &mut out);
        out.sort_by(|a, b| a.topic.cmp(&b.topic));
        out
    }
}
