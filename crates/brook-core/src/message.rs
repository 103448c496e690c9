//! Application messages.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::packet::{Publish, QoS, Will};

/// A message as routed by the broker and stored in session state.
///
/// In JSON the payload is written as a string when it is valid UTF-8 and as
/// an array of bytes otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub topic: String,
    #[serde(with = "payload")]
    pub message: Bytes,
    #[serde(default)]
    pub qos: QoS,
    #[serde(default)]
    pub retain: bool,
}

impl Message {
    pub fn new(topic: impl Into<String>, message: impl Into<Bytes>, qos: QoS, retain: bool) -> Self {
        Self {
            topic: topic.into(),
            message: message.into(),
            qos,
            retain,
        }
    }

    /// Build the PUBLISH that carries this message.
    ///
    /// `packet_id` is ignored for QoS 0.
    pub fn to_publish(&self, packet_id: u16, dup: bool) -> Publish {
        let packet_id = (self.qos > QoS::AtMostOnce).then_some(packet_id);
        Publish {
            dup: dup && packet_id.is_some(),
            qos: self.qos,
            retain: self.retain,
            topic: self.topic.clone(),
            packet_id,
            payload: self.message.clone(),
        }
    }
}

impl From<&Publish> for Message {
    fn from(publish: &Publish) -> Self {
        Self {
            topic: publish.topic.clone(),
            message: publish.payload.clone(),
            qos: publish.qos,
            retain: publish.retain,
        }
    }
}

impl From<Will> for Message {
    fn from(will: Will) -> Self {
        Self {
            topic: will.topic,
            message: will.message,
            qos: will.qos,
            retain: will.retain,
        }
    }
}

pub(crate) mod payload {
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Text(String),
        Raw(Vec<u8>),
    }

    pub fn serialize<S: Serializer>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        match std::str::from_utf8(bytes) {
            Ok(text) => serializer.serialize_str(text),
            Err(_) => serializer.collect_seq(bytes.iter()),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        Ok(match Repr::deserialize(deserializer)? {
            Repr::Text(text) => Bytes::from(text),
            Repr::Raw(raw) => Bytes::from(raw),
        })
    }
}
