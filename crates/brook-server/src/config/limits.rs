//! Limits configuration.

use serde::Deserialize;

/// Largest packet the protocol can express: a 268,435,455 byte body plus a
/// five byte fixed header.
pub const DEFAULT_MAX_PACKET_SIZE: usize = 268_435_460;

/// Default maximum topic length in bytes (the UTF-8 string limit).
pub const DEFAULT_MAX_TOPIC_LENGTH: usize = 65535;

/// Limits configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum MQTT packet size in bytes, fixed header included.
    /// Larger packets are a framing error and close the connection.
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: usize,

    /// Maximum topic name / filter length in bytes.
    #[serde(default = "default_max_topic_length")]
    pub max_topic_length: usize,
}

fn default_max_packet_size() -> usize {
    DEFAULT_MAX_PACKET_SIZE
}
fn default_max_topic_length() -> usize {
    DEFAULT_MAX_TOPIC_LENGTH
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            max_topic_length: DEFAULT_MAX_TOPIC_LENGTH,
        }
    }
}

impl LimitsConfig {
    /// Validate the limits configuration.
    pub fn validate(&self) -> Result<(), String> {
        // Smallest packet is a two byte PINGREQ
        if self.max_packet_size < 2 {
            return Err("max_packet_size must be at least 2".into());
        }
        if self.max_packet_size > DEFAULT_MAX_PACKET_SIZE {
            return Err(format!(
                "max_packet_size cannot exceed MQTT protocol maximum ({})",
                DEFAULT_MAX_PACKET_SIZE
            ));
        }
        if self.max_topic_length > 65535 {
            return Err("max_topic_length cannot exceed 65535".into());
        }
        Ok(())
    }
}
