//! The broker: subscriptions, retained messages and sessions.
//!
//! The broker never touches sockets. Every operation that produces traffic
//! appends [`Delivery`] values to an output vector, and the reactor writes
//! them to the connection named by each delivery's token.

use std::collections::BTreeMap;

use ahash::AHashMap;
use brook_core::topic::is_valid_topic_filter;
use brook_core::{Message, QoS, SUBACK_FAILURE};
use bytes::Bytes;
use log::{debug, info};
use mio::Token;

use crate::config::Config;
use crate::persistence::SessionStore;
use crate::retain::RetainTree;
use crate::session::{Delivery, Session};
use crate::subscription::SubscriptionTree;

/// Broker settings taken from the configuration.
#[derive(Debug, Clone)]
pub struct BrokerOptions {
    pub max_qos: QoS,
    pub retain_available: bool,
    pub reflect: bool,
    pub max_queued_messages: usize,
    pub max_topic_length: usize,
}

impl Default for BrokerOptions {
    fn default() -> Self {
        Self {
            max_qos: QoS::ExactlyOnce,
            retain_available: true,
            reflect: true,
            max_queued_messages: 0,
            max_topic_length: u16::MAX as usize,
        }
    }
}

impl From<&Config> for BrokerOptions {
    fn from(config: &Config) -> Self {
        Self {
            max_qos: config.mqtt.max_qos(),
            retain_available: config.mqtt.retain_available,
            reflect: config.mqtt.reflect,
            max_queued_messages: config.session.max_queued_messages,
            max_topic_length: config.limits.max_topic_length,
        }
    }
}

/// Message broker.
#[derive(Debug, Default)]
pub struct Broker {
    options: BrokerOptions,
    subscriptions: SubscriptionTree,
    retained: RetainTree,
    sessions: AHashMap<String, Session>,
    next_client_id: u64,
}

impl Broker {
    pub fn new(options: BrokerOptions) -> Self {
        Self {
            options,
            ..Default::default()
        }
    }

    /// Rebuild a broker from a saved store. Restored sessions are inactive.
    pub fn restore(options: BrokerOptions, store: SessionStore) -> Self {
        let mut sessions = AHashMap::with_capacity(store.session_store.len());
        for (client_id, mut session) in store.session_store {
            session.retain();
            session.set_max_queued(options.max_queued_messages);
            sessions.insert(client_id, session);
        }
        let mut subscriptions = store.subscription_tree;
        subscriptions.retain_clients(|client_id| sessions.contains_key(client_id));
        info!(
            "Restored {} sessions and {} retained messages",
            sessions.len(),
            store.retain_tree.messages().len()
        );
        Self {
            options,
            subscriptions,
            retained: store.retain_tree,
            sessions,
            next_client_id: 0,
        }
    }

    /// Snapshot of everything worth keeping across a restart: non-clean
    /// sessions, their subscriptions, and retained messages.
    pub fn snapshot(&self) -> serde_json::Result<serde_json::Value> {
        let persistent = |client_id: &str| {
            self.sessions
                .get(client_id)
                .is_some_and(|session| !session.clean_session())
        };
        let mut subscription_tree = self.subscriptions.clone();
        subscription_tree.retain_clients(persistent);

        let sessions: BTreeMap<&str, &Session> = self
            .sessions
            .iter()
            .filter(|(client_id, _)| persistent(client_id.as_str()))
            .map(|(client_id, session)| (client_id.as_str(), session))
            .collect();

        let mut json = serde_json::Map::new();
        if !sessions.is_empty() {
            json.insert("session_store".into(), serde_json::to_value(sessions)?);
        }
        if !self.retained.is_empty() {
            json.insert("retain_tree".into(), serde_json::to_value(&self.retained)?);
        }
        if !subscription_tree.is_empty() {
            json.insert(
                "subscription_tree".into(),
                serde_json::to_value(&subscription_tree)?,
            );
        }
        Ok(serde_json::Value::Object(json))
    }

    pub fn options(&self) -> &BrokerOptions {
        &self.options
    }

    // === Routing ===

    /// Subscribe `client_id` to `filter` and replay matching retained messages.
    ///
    /// Returns the SUBACK return code: the granted QoS, or 0x80 if the filter
    /// is invalid or longer than the configured limit.
    pub fn subscribe(
        &mut self,
        client_id: &str,
        filter: &str,
        qos: QoS,
        out: &mut Vec<Delivery>,
    ) -> u8 {
        if filter.len() > self.options.max_topic_length || !is_valid_topic_filter(filter) {
            debug!("Rejecting invalid topic filter '{}' from {}", filter, client_id);
            return SUBACK_FAILURE;
        }
        let granted = qos.min(self.options.max_qos);
        self.subscriptions.subscribe(filter, client_id, granted);
        debug!("{} subscribed to '{}' at {:?}", client_id, filter, granted);

        self.appear(client_id, filter, granted, out);
        granted.into()
    }

    /// Remove a subscription. Unknown filters are ignored.
    pub fn unsubscribe(&mut self, client_id: &str, filter: &str) {
        if self.subscriptions.unsubscribe(filter, client_id) {
            debug!("{} unsubscribed from '{}'", client_id, filter);
        }
    }

    /// Route a message to every matching subscriber.
    ///
    /// `origin` is the publishing client, if any; with reflection disabled it
    /// does not receive its own message.
    pub fn publish(&mut self, origin: Option<&str>, message: Message, out: &mut Vec<Delivery>) {
        if message.retain && self.options.retain_available {
            self.retained.retain(message.clone());
        }

        for (client_id, qos) in self.subscriptions.matches(&message.topic) {
            if !self.options.reflect && origin == Some(client_id.as_str()) {
                debug!("Suppressing reflection of '{}' to {}", message.topic, client_id);
                continue;
            }
            if let Some(session) = self.sessions.get_mut(&client_id) {
                out.extend(session.send_publish(&message, qos, false));
            }
        }
    }

    /// Send retained messages matching `filter` to one client.
    fn appear(&mut self, client_id: &str, filter: &str, qos: QoS, out: &mut Vec<Delivery>) {
        let Some(session) = self.sessions.get_mut(client_id) else {
            return;
        };
        for message in self.retained.matching(filter) {
            out.extend(session.send_publish(&message, qos, true));
        }
    }

    // === Sessions ===

    pub fn has_session(&self, client_id: &str) -> bool {
        self.sessions.contains_key(client_id)
    }

    /// A session owned by a live connection.
    pub fn has_active_session(&self, client_id: &str) -> bool {
        self.sessions
            .get(client_id)
            .is_some_and(Session::is_active)
    }

    /// A session kept after its connection went away.
    pub fn has_retained_session(&self, client_id: &str) -> bool {
        self.sessions
            .get(client_id)
            .is_some_and(|session| !session.is_active())
    }

    pub fn is_active_session(&self, client_id: &str, owner: Token) -> bool {
        self.sessions
            .get(client_id)
            .is_some_and(|session| session.is_owned_by(owner))
    }

    pub fn session(&self, client_id: &str) -> Option<&Session> {
        self.sessions.get(client_id)
    }

    pub fn session_mut(&mut self, client_id: &str) -> Option<&mut Session> {
        self.sessions.get_mut(client_id)
    }

    /// Generate an identifier for a client that connected without one.
    pub fn assign_client_id(&mut self) -> String {
        loop {
            self.next_client_id += 1;
            let client_id = format!("brook-{}", self.next_client_id);
            if !self.sessions.contains_key(&client_id) {
                return client_id;
            }
        }
    }

    /// Create a fresh session owned by `owner`, replacing any old one.
    pub fn new_session(&mut self, client_id: &str, owner: Token, clean_session: bool) {
        info!(
            "New session for {} (clean_session={})",
            client_id, clean_session
        );
        self.sessions.insert(
            client_id.to_string(),
            Session::new(owner, clean_session, self.options.max_queued_messages),
        );
    }

    /// Attach `owner` to a retained session. Returns false if none exists.
    pub fn renew_session(&mut self, client_id: &str, owner: Token) -> bool {
        let Some(session) = self.sessions.get_mut(client_id) else {
            return false;
        };
        info!("Renewing session for {}", client_id);
        session.renew(owner);
        true
    }

    /// Replay state into a renewed session: retained messages for every
    /// existing subscription, then queued messages in arrival order, then
    /// the in-flight packets that were never acknowledged.
    pub fn restart_session(&mut self, client_id: &str, out: &mut Vec<Delivery>) {
        let Some(session) = self.sessions.get_mut(client_id) else {
            return;
        };
        let Some(owner) = session.owner() else {
            return;
        };
        // Collected before replay so freshly sent messages are not resent
        let resend = session.inflight().resend();
        let queue = session.take_queue();

        for (filter, qos) in self.subscriptions.subscriptions(client_id) {
            self.appear(client_id, &filter, qos, out);
        }

        let Some(session) = self.sessions.get_mut(client_id) else {
            return;
        };
        debug!("Replaying {} queued messages to {}", queue.len(), client_id);
        for message in &queue {
            out.extend(session.send_publish(message, message.qos, false));
        }
        out.extend(resend.into_iter().map(|packet| Delivery {
            token: owner,
            packet,
        }));
    }

    /// Detach the connection but keep the session.
    pub fn retain_session(&mut self, client_id: &str) {
        if let Some(session) = self.sessions.get_mut(client_id) {
            info!("Retaining session for {}", client_id);
            session.retain();
        }
    }

    /// Drop a session and all of its subscriptions.
    pub fn delete_session(&mut self, client_id: &str) {
        if self.sessions.remove(client_id).is_some() {
            info!("Deleting session for {}", client_id);
        }
        self.subscriptions.unsubscribe_all(client_id);
    }

    /// Called when the connection `owner` goes away: clean sessions are
    /// deleted, others are retained. Does nothing if `owner` no longer owns
    /// the session.
    pub fn release_session(&mut self, client_id: &str, owner: Token) {
        let Some(session) = self.sessions.get(client_id) else {
            return;
        };
        if !session.is_owned_by(owner) {
            return;
        }
        if session.clean_session() {
            self.delete_session(client_id);
        } else {
            self.retain_session(client_id);
        }
    }

    // === Queries ===

    /// Filters a client is subscribed to, sorted.
    pub fn subscriptions(&self, client_id: &str) -> Vec<String> {
        self.subscriptions
            .subscriptions(client_id)
            .into_iter()
            .map(|(filter, _)| filter)
            .collect()
    }

    /// Every retained message as (topic, payload, qos), sorted by topic.
    pub fn retained_messages(&self) -> Vec<(String, Bytes, QoS)> {
        self.retained
            .messages()
            .into_iter()
            .map(|message| (message.topic, message.message, message.qos))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use brook_core::Packet;

    fn publishes(out: &[Delivery]) -> Vec<(Token, String, QoS, bool)> {
        out.iter()
            .filter_map(|d| match &d.packet {
                Packet::Publish(p) => Some((
                    d.token,
                    String::from_utf8_lossy(&p.payload).into_owned(),
                    p.qos,
                    p.retain,
                )),
                _ => None,
            })
            .collect()
    }

    fn msg(topic: &str, payload: &str, qos: QoS, retain: bool) -> Message {
        Message::new(topic, payload.to_string(), qos, retain)
    }

    #[test]
    fn test_subscribe_grants_min_of_requested_and_max() {
        let mut broker = Broker::new(BrokerOptions {
            max_qos: QoS::AtLeastOnce,
            ..Default::default()
        });
        broker.new_session("c1", Token(1), true);
        let mut out = Vec::new();
        assert_eq!(broker.subscribe("c1", "a/b", QoS::ExactlyOnce, &mut out), 1);
        assert_eq!(broker.subscribe("c1", "a/c", QoS::AtMostOnce, &mut out), 0);
        assert_eq!(broker.subscribe("c1", "a/#/b", QoS::AtMostOnce, &mut out), 0x80);
        assert_eq!(broker.subscribe("c1", "", QoS::AtMostOnce, &mut out), 0x80);
        assert_eq!(broker.subscriptions("c1"), vec!["a/b", "a/c"]);
    }

    #[test]
    fn test_publish_downgrades_to_subscription_qos() {
        let mut broker = Broker::default();
        broker.new_session("sub", Token(1), true);
        let mut out = Vec::new();
        broker.subscribe("sub", "a/b", QoS::AtLeastOnce, &mut out);
        broker.publish(None, msg("a/b", "x", QoS::ExactlyOnce, false), &mut out);
        assert_eq!(
            publishes(&out),
            vec![(Token(1), "x".to_string(), QoS::AtLeastOnce, false)]
        );
    }

    #[test]
    fn test_publish_without_subscribers_is_noop() {
        let mut broker = Broker::default();
        let mut out = Vec::new();
        broker.publish(None, msg("nobody/listens", "x", QoS::AtLeastOnce, false), &mut out);
        assert!(out.is_empty());
        broker.unsubscribe("ghost", "nobody/listens");
    }

    #[test]
    fn test_retained_replay_on_subscribe() {
        let mut broker = Broker::default();
        let mut out = Vec::new();
        broker.publish(None, msg("a/b", "X", QoS::AtMostOnce, true), &mut out);
        assert!(out.is_empty());

        broker.new_session("late", Token(2), true);
        broker.subscribe("late", "a/b", QoS::ExactlyOnce, &mut out);
        assert_eq!(
            publishes(&out),
            vec![(Token(2), "X".to_string(), QoS::AtMostOnce, true)]
        );
    }

    #[test]
    fn test_live_publish_clears_retain_flag() {
        let mut broker = Broker::default();
        broker.new_session("sub", Token(1), true);
        let mut out = Vec::new();
        broker.subscribe("sub", "a/b", QoS::AtMostOnce, &mut out);
        broker.publish(None, msg("a/b", "X", QoS::AtMostOnce, true), &mut out);
        assert_eq!(publishes(&out)[0].3, false);
        assert_eq!(broker.retained_messages().len(), 1);
    }

    #[test]
    fn test_empty_retained_payload_deletes() {
        let mut broker = Broker::default();
        let mut out = Vec::new();
        broker.publish(None, msg("a/b", "X", QoS::AtMostOnce, true), &mut out);
        broker.publish(None, msg("a/b", "", QoS::AtMostOnce, true), &mut out);
        assert!(broker.retained_messages().is_empty());
    }

    #[test]
    fn test_retain_unavailable_does_not_store() {
        let mut broker = Broker::new(BrokerOptions {
            retain_available: false,
            ..Default::default()
        });
        let mut out = Vec::new();
        broker.publish(None, msg("a/b", "X", QoS::AtMostOnce, true), &mut out);
        assert!(broker.retained_messages().is_empty());
    }

    #[test]
    fn test_reflect_disabled_skips_origin() {
        let mut broker = Broker::new(BrokerOptions {
            reflect: false,
            ..Default::default()
        });
        broker.new_session("a", Token(1), true);
        broker.new_session("b", Token(2), true);
        let mut out = Vec::new();
        broker.subscribe("a", "t", QoS::AtMostOnce, &mut out);
        broker.subscribe("b", "t", QoS::AtMostOnce, &mut out);
        broker.publish(Some("a"), msg("t", "x", QoS::AtMostOnce, false), &mut out);
        let tokens: Vec<_> = out.iter().map(|d| d.token).collect();
        assert_eq!(tokens, vec![Token(2)]);
    }

    #[test]
    fn test_assigned_client_ids_are_unique() {
        let mut broker = Broker::default();
        broker.new_session("brook-1", Token(1), true);
        let first = broker.assign_client_id();
        let second = broker.assign_client_id();
        assert_eq!(first, "brook-2");
        assert_eq!(second, "brook-3");
    }

    #[test]
    fn test_session_lifecycle_queries() {
        let mut broker = Broker::default();
        broker.new_session("c", Token(1), false);
        assert!(broker.has_active_session("c"));
        assert!(broker.is_active_session("c", Token(1)));
        assert!(!broker.is_active_session("c", Token(2)));

        // A stale owner cannot release a renewed session
        broker.retain_session("c");
        assert!(broker.has_retained_session("c"));
        assert!(broker.renew_session("c", Token(2)));
        broker.release_session("c", Token(1));
        assert!(broker.has_active_session("c"));

        broker.release_session("c", Token(2));
        assert!(broker.has_retained_session("c"));
        assert!(!broker.renew_session("missing", Token(3)));
    }

    #[test]
    fn test_release_clean_session_deletes_subscriptions() {
        let mut broker = Broker::default();
        broker.new_session("c", Token(1), true);
        let mut out = Vec::new();
        broker.subscribe("c", "a/#", QoS::AtLeastOnce, &mut out);
        broker.release_session("c", Token(1));
        assert!(!broker.has_session("c"));
        assert!(broker.subscriptions("c").is_empty());
    }

    #[test]
    fn test_offline_queue_replayed_in_order() {
        let mut broker = Broker::default();
        broker.new_session("c", Token(1), false);
        let mut out = Vec::new();
        broker.subscribe("c", "a/+", QoS::AtLeastOnce, &mut out);
        broker.release_session("c", Token(1));

        for payload in ["1", "2", "3"] {
            broker.publish(None, msg("a/b", payload, QoS::AtLeastOnce, false), &mut out);
        }
        assert!(out.is_empty());

        assert!(broker.renew_session("c", Token(5)));
        broker.restart_session("c", &mut out);
        let payloads: Vec<_> = publishes(&out).into_iter().map(|p| p.1).collect();
        assert_eq!(payloads, vec!["1", "2", "3"]);
        assert!(out.iter().all(|d| d.token == Token(5)));
        assert!(broker.session("c").unwrap().message_queue().is_empty());
    }

    #[test]
    fn test_restart_order_retained_then_queue_then_resend() {
        let mut broker = Broker::default();
        broker.new_session("c", Token(1), false);
        let mut out = Vec::new();
        broker.subscribe("c", "t/#", QoS::AtLeastOnce, &mut out);
        // Unacknowledged delivery while connected
        broker.publish(None, msg("t/inflight", "I", QoS::AtLeastOnce, false), &mut out);
        broker.publish(None, msg("t/retained", "R", QoS::AtLeastOnce, true), &mut out);
        broker.release_session("c", Token(1));
        broker.publish(None, msg("t/queued", "Q", QoS::AtLeastOnce, false), &mut out);
        out.clear();

        broker.renew_session("c", Token(2));
        broker.restart_session("c", &mut out);

        let summary: Vec<(String, bool)> = out
            .iter()
            .filter_map(|d| match &d.packet {
                Packet::Publish(p) => Some((String::from_utf8_lossy(&p.payload).into_owned(), p.dup)),
                _ => None,
            })
            .collect();
        // "I" and "R" were both unacknowledged, so they come back as dups last
        assert_eq!(
            summary,
            vec![
                ("R".to_string(), false),
                ("Q".to_string(), false),
                ("I".to_string(), true),
                ("R".to_string(), true),
            ]
        );
    }

    #[test]
    fn test_snapshot_and_restore() {
        let mut broker = Broker::default();
        let mut out = Vec::new();
        broker.new_session("keep", Token(1), false);
        broker.new_session("drop", Token(2), true);
        broker.subscribe("keep", "a/b", QoS::AtLeastOnce, &mut out);
        broker.subscribe("drop", "a/b", QoS::AtLeastOnce, &mut out);
        broker.publish(None, msg("r", "retained", QoS::AtMostOnce, true), &mut out);
        broker.release_session("keep", Token(1));
        broker.publish(None, msg("a/b", "queued", QoS::AtLeastOnce, false), &mut out);

        let json = broker.snapshot().unwrap();
        assert!(json["session_store"].get("keep").is_some());
        assert!(json["session_store"].get("drop").is_none());
        assert_eq!(
            json["session_store"]["keep"]["message_queue"][0]["message"],
            "queued"
        );

        let store: SessionStore = serde_json::from_value(json).unwrap();
        let restored = Broker::restore(BrokerOptions::default(), store);
        assert!(restored.has_retained_session("keep"));
        assert!(!restored.has_session("drop"));
        assert_eq!(restored.subscriptions("keep"), vec!["a/b"]);
        assert!(restored.subscriptions("drop").is_empty());
        assert_eq!(restored.retained_messages().len(), 1);
    }

    #[test]
    fn test_snapshot_of_empty_broker() {
        let broker = Broker::default();
        assert_eq!(broker.snapshot().unwrap(), serde_json::json!({}));
    }
}
