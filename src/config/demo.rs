//! What the demo run does once the session is up.

use std::time::Duration;

use relaybee_mqtt_session::QoS;
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

/// Demo run settings.
///
/// ```toml
/// [demo]
/// topic = "relaybee/demo"
/// messages = 10
/// qos = 2
/// run_seconds = 30
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct DemoConfig {
    /// Topic subscribed to and published on.
    #[validate(custom(function = "validate_topic"))]
    pub topic: String,

    /// Number of messages published after subscribing.
    #[validate(range(max = 10000, message = "At most 10000 demo messages"))]
    pub messages: u32,

    /// QoS of the demo publishes: 0, 1 or 2.
    #[validate(range(max = 2, message = "QoS must be 0, 1 or 2"))]
    pub qos: u8,

    /// How long the process loop runs after publishing.
    #[validate(range(min = 1, max = 86400, message = "Run time must be between 1 s and one day"))]
    pub run_seconds: u64,

    /// Prefix of each payload; the message number is appended.
    pub payload_prefix: String,
}

impl Default for DemoConfig {
    fn default() -> Self {
        DemoConfig {
            topic: "relaybee/demo".to_string(),
            messages: 5,
            qos: 1,
            run_seconds: 10,
            payload_prefix: "hello from relaybee".to_string(),
        }
    }
}

impl DemoConfig {
    pub fn qos(&self) -> QoS {
        match self.qos {
            0 => QoS::AtMostOnce,
            1 => QoS::AtLeastOnce,
            _ => QoS::ExactlyOnce,
        }
    }

    pub fn run_time(&self) -> Duration {
        Duration::from_secs(self.run_seconds)
    }

    pub fn payload(&self, n: u32) -> String {
        format!("{} #{}", self.payload_prefix, n)
    }
}

/// Publish topics may not be empty or contain wildcards.
fn validate_topic(topic: &str) -> Result<(), ValidationError> {
    if topic.is_empty() || topic.contains(['+', '#']) {
        let mut err = ValidationError::new("invalid_topic");
        err.message = Some(format!("Invalid publish topic: '{}'", topic).into());
        return Err(err);
    }
    Ok(())
}
