//! MQTT feature configuration.

use brook_core::QoS;
use serde::Deserialize;

/// MQTT feature configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    /// Maximum QoS granted to subscriptions (0, 1, or 2).
    #[serde(default = "default_max_qos")]
    pub max_qos: u8,

    /// Whether retained messages are stored.
    #[serde(default = "default_true")]
    pub retain_available: bool,

    /// Whether a client receives its own publishes on matching subscriptions.
    #[serde(default = "default_true")]
    pub reflect: bool,
}

fn default_max_qos() -> u8 {
    2
}
fn default_true() -> bool {
    true
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            max_qos: 2,
            retain_available: true,
            reflect: true,
        }
    }
}

impl MqttConfig {
    /// Validate the MQTT configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_qos > 2 {
            return Err("max_qos must be 0, 1, or 2".into());
        }
        Ok(())
    }

    /// `max_qos` as a [`QoS`], clamped to 2.
    pub fn max_qos(&self) -> QoS {
        QoS::try_from(self.max_qos.min(2)).unwrap_or(QoS::ExactlyOnce)
    }
}
