//! relaybee: demo MQTT client built on `relaybee_mqtt_session`
//!
//! The binary loads a TOML configuration, initialises logging and drives one
//! resumable MQTT session against a broker: subscribe, publish with
//! confirmation, run the process loop, disconnect. Kill it while messages
//! are in flight and start it again with the same `client_id` to watch the
//! unacknowledged publishes get replayed.
//!
//! ## Modules
//!
//! * `config`: configuration file loading and validation (`logger`,
//!   `transport` and `demo` sections) plus the pre-logger print macros.
//! * `logger`: `tracing` subscriber setup with console and journald outputs.
//! * `demo`: the session exchange run by the binary.

pub mod config;
pub mod demo;
pub mod logger;
