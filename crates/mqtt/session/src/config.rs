//! Session configuration.
//!
//! [`Config`] holds everything a [`Session`](crate::Session) needs: broker
//! endpoint, MQTT identity, timeouts, the size of the in-flight publish table
//! and the reconnect backoff. It deserializes from any serde format with
//! every field optional, and is validated with the `validator` crate before a
//! session is built.
//!
//! # Examples
//!
//! ```ignore
//! let config: Config = toml::from_str(r#"
//!     host = "mqtt.example.com"
//!     client_id = "gateway-01"
//!     max_outgoing_publishes = 10
//!
//!     [backoff]
//!     base_ms = 250
//!     max_delay_ms = 10000
//! "#)?;
//! config.validate()?;
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::{Validate, ValidationError};

use crate::{
    backoff::Backoff,
    codec::ConnectOptions,
    transport::{Credentials, ServerInfo},
};

/// MQTT session configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct Config {
    /// Broker hostname or IP address.
    ///
    /// # Validation
    /// - Length: 1-255 characters
    ///
    /// # Examples
    /// ```toml
    /// host = "mqtt.home.local"
    /// ```
    #[validate(length(
        min = 1,
        max = 255,
        message = "Host must be between 1 and 255 characters"
    ))]
    pub host: String,

    /// Broker port, 1883 for plain MQTT.
    #[validate(range(min = 1, max = 65535, message = "Port must be between 1 and 65535"))]
    pub port: u16,

    /// MQTT client identifier.
    ///
    /// With `clean_session = false` the broker keeps session state under this
    /// identifier, so it must be stable across restarts for resumption to
    /// work. An empty value is replaced by a random UUID when the session is
    /// created.
    ///
    /// # Validation
    /// - Length: 0-36 characters
    ///
    /// # Examples
    /// ```toml
    /// client_id = "gateway-01"
    /// ```
    #[validate(length(max = 36, message = "Client ID must not exceed 36 characters"))]
    pub client_id: String,

    /// Keep-alive interval in seconds, `0` disables keep-alive.
    #[validate(range(max = 65535, message = "Keep alive must not exceed 65535 seconds"))]
    pub keep_alive: u64,

    /// Ask the broker to discard any stored session on connect.
    ///
    /// Defaults to `false`, so in-flight publishes survive a reconnect.
    pub clean_session: bool,

    /// Optional broker login.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// How long to wait for CONNACK after CONNECT, in milliseconds.
    #[validate(range(
        min = 1,
        max = 60000,
        message = "CONNACK timeout must be between 1 and 60000 ms"
    ))]
    pub connack_timeout_ms: u64,

    /// Per-call bound on transport connect, send and receive, in milliseconds.
    #[validate(range(
        min = 1,
        max = 60000,
        message = "Transport timeout must be between 1 and 60000 ms"
    ))]
    pub transport_timeout_ms: u64,

    /// Upper bound on one process-loop step, in milliseconds.
    #[validate(range(
        min = 1,
        max = 60000,
        message = "Process loop timeout must be between 1 and 60000 ms"
    ))]
    pub process_loop_timeout_ms: u64,

    /// How long a request waits for its acknowledgement, in milliseconds.
    #[validate(range(
        min = 1,
        max = 600000,
        message = "Ack timeout must be between 1 and 600000 ms"
    ))]
    pub ack_timeout_ms: u64,

    /// Number of QoS 1/2 publishes that may be unacknowledged at once.
    ///
    /// A publish beyond this limit fails with `ResourceExhausted` until an
    /// acknowledgement frees a slot.
    ///
    /// # Examples
    /// ```toml
    /// max_outgoing_publishes = 5
    /// ```
    #[validate(range(
        min = 1,
        max = 65535,
        message = "Max outgoing publishes must be between 1 and 65535"
    ))]
    pub max_outgoing_publishes: usize,

    /// Largest inbound packet accepted, in bytes.
    #[validate(range(
        min = 64,
        max = 268435455,
        message = "Max packet size must be between 64 and 268435455 bytes"
    ))]
    pub max_packet_size: usize,

    /// Reconnect backoff schedule.
    ///
    /// # Examples
    /// ```toml
    /// [backoff]
    /// base_ms = 500
    /// max_delay_ms = 5000
    /// max_attempts = 5
    /// ```
    #[validate(nested)]
    pub backoff: BackoffConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            host: "localhost".to_string(),
            port: 1883,
            client_id: Uuid::new_v4().to_string(),
            keep_alive: 60,
            clean_session: false,
            username: None,
            password: None,
            connack_timeout_ms: 1000,
            transport_timeout_ms: 1000,
            process_loop_timeout_ms: 1000,
            ack_timeout_ms: 1000,
            max_outgoing_publishes: 5,
            max_packet_size: 1024 * 1024,
            backoff: BackoffConfig::default(),
        }
    }
}

impl Config {
    pub fn server(&self) -> ServerInfo {
        ServerInfo::new(self.host.clone(), self.port)
    }

    pub fn credentials(&self) -> Credentials {
        Credentials {
            username: self.username.clone(),
            password: self.password.clone(),
        }
    }

    /// CONNECT parameters derived from this configuration.
    pub fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            client_id: self.client_id.clone(),
            keep_alive: Duration::from_secs(self.keep_alive),
            clean_session: self.clean_session,
            credentials: self.credentials(),
            connack_timeout: self.connack_timeout(),
        }
    }

    pub fn connack_timeout(&self) -> Duration {
        Duration::from_millis(self.connack_timeout_ms)
    }

    pub fn transport_timeout(&self) -> Duration {
        Duration::from_millis(self.transport_timeout_ms)
    }

    pub fn process_loop_timeout(&self) -> Duration {
        Duration::from_millis(self.process_loop_timeout_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    /// Replaces an empty client identifier with a random UUID.
    pub(crate) fn ensure_client_id(&mut self) {
        if self.client_id.is_empty() {
            self.client_id = Uuid::new_v4().to_string();
        }
    }
}

/// Jittered exponential backoff settings.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
#[validate(schema(function = "validate_backoff_bounds"))]
pub struct BackoffConfig {
    /// Ceiling of the first retry delay, in milliseconds.
    #[validate(range(min = 1, message = "Backoff base must be at least 1 ms"))]
    pub base_ms: u64,

    /// Largest ceiling any retry delay is drawn under, in milliseconds.
    #[validate(range(
        min = 1,
        max = 3600000,
        message = "Backoff max delay must be between 1 ms and one hour"
    ))]
    pub max_delay_ms: u64,

    /// Retry delays before giving up. `0` retries forever.
    pub max_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: 500,
            max_delay_ms: 5000,
            max_attempts: 5,
        }
    }
}

impl BackoffConfig {
    pub fn build(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.base_ms),
            Duration::from_millis(self.max_delay_ms),
            self.max_attempts,
        )
    }
}

fn validate_backoff_bounds(config: &BackoffConfig) -> Result<(), ValidationError> {
    if config.base_ms > config.max_delay_ms {
        return Err(ValidationError::new("backoff_bounds")
            .with_message("Backoff base must not exceed the max delay".into()));
    }
    Ok(())
}
