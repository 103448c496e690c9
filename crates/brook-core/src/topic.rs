//! Topic names and topic filters.
//!
//! A topic name (the target of a PUBLISH) is a plain `/`-separated path. A
//! topic filter (the argument of SUBSCRIBE) may additionally contain the `+`
//! single-level and `#` multi-level wildcards.

use crate::error::ProtocolError;

/// Single-level wildcard.
pub const SINGLE_LEVEL_WILDCARD: &str = "+";

/// Multi-level wildcard.
pub const MULTI_LEVEL_WILDCARD: &str = "#";

/// Check a PUBLISH topic name.
///
/// Topic names must be non-empty and must not contain wildcard characters
/// (MQTT-4.7.3-1, MQTT-3.3.2-2).
pub fn validate_topic_name(topic: &str) -> Result<(), ProtocolError> {
    if topic.is_empty() || topic.contains(['+', '#']) {
        return Err(ProtocolError::InvalidTopicName(topic.to_string()));
    }
    Ok(())
}

/// Check a SUBSCRIBE/UNSUBSCRIBE topic filter.
///
/// `+` must occupy a whole level and `#` must occupy the whole last level.
pub fn is_valid_topic_filter(filter: &str) -> bool {
    if filter.is_empty() {
        return false;
    }
    let mut levels = filter.split('/').peekable();
    while let Some(level) = levels.next() {
        let is_last = levels.peek().is_none();
        match level {
            SINGLE_LEVEL_WILDCARD => {}
            MULTI_LEVEL_WILDCARD if is_last => {}
            _ if level.contains(['+', '#']) => return false,
            _ => {}
        }
    }
    true
}

/// True if the filter contains any wildcard level.
pub fn has_wildcard(filter: &str) -> bool {
    filter.contains(['+', '#'])
}

/// Check whether a topic name matches a topic filter.
///
/// `#` also matches the parent level (`a/#` matches `a`). Topics beginning
/// with `$` are never matched by a wildcard in the first level (MQTT-4.7.2-1).
pub fn topic_matches_filter(topic: &str, filter: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut topic_levels = topic.split('/');
    let mut filter_levels = filter.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some(MULTI_LEVEL_WILDCARD), _) => return true,
            (Some(SINGLE_LEVEL_WILDCARD), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
