//! QoS 1/2 delivery handshakes.
//!
//! The same state serves both roles; only the direction of the packets that
//! drive it differs. Outbound:
//!
//! ```text
//! QoS 1: PUBLISH(id) ->            <- PUBACK(id)
//! QoS 2: PUBLISH(id) -> <- PUBREC(id)  PUBREL(id) -> <- PUBCOMP(id)
//! ```
//!
//! Inbound QoS 2 identifiers are remembered from PUBLISH until PUBREL so a
//! retransmitted PUBLISH is acknowledged again but delivered only once.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::message::Message;
use crate::packet::{Packet, PacketType, Publish, QoS};

/// Result of receiving a PUBLISH.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inbound {
    /// Hand the message to the application / broker.
    pub deliver: bool,
    /// Acknowledgement to send back, if any.
    pub reply: Option<Packet>,
}

/// Per-session in-flight state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InflightState {
    /// Outbound QoS 1/2 PUBLISHes awaiting PUBACK or PUBREC.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty", with = "publish_map")]
    pub publish_map: BTreeMap<u16, Message>,
    /// Outbound QoS 2 identifiers awaiting PUBCOMP.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub pubrel_packetidentifier_set: BTreeSet<u16>,
    /// Inbound QoS 2 identifiers awaiting PUBREL.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub publish_packetidentifier_set: BTreeSet<u16>,
}

fn require_id(packet_type: PacketType, packet_id: u16) -> Result<u16, ProtocolError> {
    if packet_id == 0 {
        return Err(ProtocolError::MissingPacketId(packet_type));
    }
    Ok(packet_id)
}

impl InflightState {
    pub fn is_empty(&self) -> bool {
        self.publish_map.is_empty()
            && self.pubrel_packetidentifier_set.is_empty()
            && self.publish_packetidentifier_set.is_empty()
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// True if an outbound handshake currently holds `packet_id`.
    pub fn is_in_use(&self, packet_id: u16) -> bool {
        self.publish_map.contains_key(&packet_id)
            || self.pubrel_packetidentifier_set.contains(&packet_id)
    }

    /// Remember an outbound QoS 1/2 message until it is acknowledged.
    pub fn track(&mut self, packet_id: u16, message: Message) {
        debug_assert!(message.qos > QoS::AtMostOnce);
        self.publish_map.insert(packet_id, message);
    }

    /// Handle an inbound PUBLISH.
    pub fn on_publish(&mut self, publish: &Publish) -> Result<Inbound, ProtocolError> {
        if publish.qos == QoS::AtMostOnce {
            return Ok(Inbound {
                deliver: true,
                reply: None,
            });
        }
        let packet_id = require_id(PacketType::Publish, publish.packet_id.unwrap_or(0))?;
        match publish.qos {
            QoS::AtLeastOnce => Ok(Inbound {
                deliver: true,
                reply: Some(Packet::Puback { packet_id }),
            }),
            _ => Ok(Inbound {
                deliver: self.publish_packetidentifier_set.insert(packet_id),
                reply: Some(Packet::Pubrec { packet_id }),
            }),
        }
    }

    /// Handle PUBACK. Returns the acknowledged message if it was in flight.
    pub fn on_puback(&mut self, packet_id: u16) -> Result<Option<Message>, ProtocolError> {
        let packet_id = require_id(PacketType::Puback, packet_id)?;
        Ok(self.publish_map.remove(&packet_id))
    }

    /// Handle PUBREC. Always answers with PUBREL.
    pub fn on_pubrec(&mut self, packet_id: u16) -> Result<Packet, ProtocolError> {
        let packet_id = require_id(PacketType::Pubrec, packet_id)?;
        self.publish_map.remove(&packet_id);
        self.pubrel_packetidentifier_set.insert(packet_id);
        Ok(Packet::Pubrel { packet_id })
    }

    /// Handle PUBREL. Always answers with PUBCOMP.
    pub fn on_pubrel(&mut self, packet_id: u16) -> Result<Packet, ProtocolError> {
        let packet_id = require_id(PacketType::Pubrel, packet_id)?;
        self.publish_packetidentifier_set.remove(&packet_id);
        Ok(Packet::Pubcomp { packet_id })
    }

    /// Handle PUBCOMP. Returns true if the identifier was awaiting it.
    pub fn on_pubcomp(&mut self, packet_id: u16) -> Result<bool, ProtocolError> {
        let packet_id = require_id(PacketType::Pubcomp, packet_id)?;
        self.publish_map.remove(&packet_id);
        Ok(self.pubrel_packetidentifier_set.remove(&packet_id))
    }

    /// Packets to retransmit after a reconnect: every unacknowledged PUBLISH
    /// with `dup` set, then a PUBREL for each identifier awaiting PUBCOMP.
    pub fn resend(&self) -> Vec<Packet> {
        let publishes = self
            .publish_map
            .iter()
            .map(|(&packet_id, message)| Packet::Publish(message.to_publish(packet_id, true)));
        let pubrels = self
            .pubrel_packetidentifier_set
            .iter()
            .map(|&packet_id| Packet::Pubrel { packet_id });
        publishes.chain(pubrels).collect()
    }
}

/// The publish map is stored as a list of entries, each carrying its packet
/// identifier next to the message fields.
mod publish_map {
    use std::collections::BTreeMap;

    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use crate::message::{payload, Message};
    use crate::packet::QoS;

    #[derive(Serialize, Deserialize)]
    struct Entry {
        packet_identifier: u16,
        topic: String,
        #[serde(with = "payload")]
        message: Bytes,
        qos: QoS,
        #[serde(default)]
        retain: bool,
    }

    pub fn serialize<S: Serializer>(
        map: &BTreeMap<u16, Message>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(map.iter().map(|(&packet_identifier, message)| Entry {
            packet_identifier,
            topic: message.topic.clone(),
            message: message.message.clone(),
            qos: message.qos,
            retain: message.retain,
        }))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<u16, Message>, D::Error> {
        let entries = Vec::<Entry>::deserialize(deserializer)?;
        Ok(entries
            .into_iter()
            .map(|entry| {
                let message = Message::new(entry.topic, entry.message, entry.qos, entry.retain);
                (entry.packet_identifier, message)
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn publish(qos: QoS, packet_id: Option<u16>, dup: bool) -> Publish {
        Publish {
            dup,
            qos,
            retain: false,
            topic: "a/b".into(),
            packet_id,
            payload: Bytes::from_static(b"x"),
        }
    }

    #[test]
    fn test_qos0_delivered_without_reply() {
        let mut state = InflightState::default();
        let inbound = state.on_publish(&publish(QoS::AtMostOnce, None, false)).unwrap();
        assert!(inbound.deliver);
        assert_eq!(inbound.reply, None);
    }

    #[test]
    fn test_qos1_duplicates_are_redelivered() {
        let mut state = InflightState::default();
        for dup in [false, true] {
            let inbound = state.on_publish(&publish(QoS::AtLeastOnce, Some(3), dup)).unwrap();
            assert!(inbound.deliver);
            assert_eq!(inbound.reply, Some(Packet::Puback { packet_id: 3 }));
        }
    }

    #[test]
    fn test_qos2_exactly_once() {
        let mut state = InflightState::default();
        let first = state.on_publish(&publish(QoS::ExactlyOnce, Some(5), false)).unwrap();
        let retry = state.on_publish(&publish(QoS::ExactlyOnce, Some(5), true)).unwrap();
        assert!(first.deliver);
        assert!(!retry.deliver);
        assert_eq!(first.reply, Some(Packet::Pubrec { packet_id: 5 }));
        assert_eq!(retry.reply, Some(Packet::Pubrec { packet_id: 5 }));

        assert_eq!(state.on_pubrel(5).unwrap(), Packet::Pubcomp { packet_id: 5 });
        assert!(state.is_empty());

        // Identifier reusable after the handshake completes
        let again = state.on_publish(&publish(QoS::ExactlyOnce, Some(5), false)).unwrap();
        assert!(again.deliver);
    }

    #[test]
    fn test_zero_packet_id_is_fatal() {
        let mut state = InflightState::default();
        assert_eq!(
            state.on_publish(&publish(QoS::AtLeastOnce, Some(0), false)),
            Err(ProtocolError::MissingPacketId(PacketType::Publish))
        );
        assert!(state.on_publish(&publish(QoS::ExactlyOnce, None, false)).is_err());
        assert!(state.on_puback(0).is_err());
        assert!(state.on_pubrec(0).is_err());
        assert!(state.on_pubrel(0).is_err());
        assert!(state.on_pubcomp(0).is_err());
    }

    #[test]
    fn test_outbound_qos1() {
        let mut state = InflightState::default();
        let message = Message::new("a/b", "x", QoS::AtLeastOnce, false);
        state.track(1, message.clone());
        assert!(state.is_in_use(1));
        assert_eq!(state.on_puback(1).unwrap(), Some(message));
        assert_eq!(state.on_puback(1).unwrap(), None);
        assert!(state.is_empty());
    }

    #[test]
    fn test_outbound_qos2() {
        let mut state = InflightState::default();
        state.track(9, Message::new("a/b", "x", QoS::ExactlyOnce, false));
        assert_eq!(state.on_pubrec(9).unwrap(), Packet::Pubrel { packet_id: 9 });
        assert!(state.publish_map.is_empty());
        assert!(state.is_in_use(9));
        assert!(state.on_pubcomp(9).unwrap());
        assert!(!state.is_in_use(9));
    }

    #[test]
    fn test_resend_sets_dup_and_orders_pubrels_last() {
        let mut state = InflightState::default();
        state.track(2, Message::new("a", "1", QoS::AtLeastOnce, false));
        state.track(3, Message::new("b", "2", QoS::ExactlyOnce, false));
        state.on_pubrec(3).unwrap();
        state.track(4, Message::new("c", "3", QoS::ExactlyOnce, false));

        let packets = state.resend();
        assert_eq!(packets.len(), 3);
        match &packets[0] {
            Packet::Publish(p) => {
                assert!(p.dup);
                assert_eq!(p.packet_id, Some(2));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(&packets[1], Packet::Publish(p) if p.packet_id == Some(4)));
        assert_eq!(packets[2], Packet::Pubrel { packet_id: 3 });
    }

    #[test]
    fn test_json_shape() {
        let mut state = InflightState::default();
        state.track(1, Message::new("a", "x", QoS::AtLeastOnce, false));
        state.pubrel_packetidentifier_set.insert(2);
        state.publish_packetidentifier_set.insert(3);

        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["pubrel_packetidentifier_set"], serde_json::json!([2]));
        assert_eq!(json["publish_packetidentifier_set"], serde_json::json!([3]));
        assert_eq!(json["publish_map"][0]["packet_identifier"], 1);
        assert_eq!(json["publish_map"][0]["topic"], "a");

        let back: InflightState = serde_json::from_value(json).unwrap();
        assert_eq!(back, state);

        let empty = serde_json::to_string(&InflightState::default()).unwrap();
        assert_eq!(empty, "{}");
    }
}
