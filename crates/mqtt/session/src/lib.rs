//! # relaybee-mqtt-session: MQTT client session layer
//!
//! A session layer that sits between an application and an MQTT codec plus
//! byte transport. It owns the parts of MQTT that outlive a single TCP
//! connection:
//!
//! - **Bounded reconnect**: exponential backoff with full jitter, a retry
//!   budget, and observable connection state
//! - **In-flight tracking**: a fixed-capacity table of unacknowledged QoS 1/2
//!   publishes that is replayed (with DUP) on a resumed session and dropped
//!   on a clean one
//! - **Ack correlation**: every request waits for the acknowledgement that
//!   carries exactly its packet identifier, with a deadline
//!
//! Wire encoding lives behind the [`Codec`] trait and sockets behind the
//! [`Transport`] trait. [`V4Codec`] (MQTT 3.1.1 via `rumqttc`'s packet types)
//! and [`TcpTransport`] are the bundled implementations.
//!
//! # Quick Start
//!
//! ```ignore
//! use relaybee_mqtt_session::{Config, QoS, Session, TcpTransport, V4Codec};
//!
//! #[tokio::main]
//! async fn main() -> relaybee_mqtt_session::Result<()> {
//!     let config = Config::default();
//!     let timeout = config.transport_timeout();
//!     let codec = V4Codec::new(config.max_packet_size);
//!     let mut session = Session::new(config, TcpTransport::new(timeout, timeout, timeout), codec)?;
//!
//!     let state = session.establish(None).await?;
//!     println!("resumed: {}", state.resumed);
//!
//!     session.publish_confirmed("sensors/temp", "21.5", QoS::AtLeastOnce).await?;
//!     session.disconnect().await
//! }
//! ```
//!
//! # Session Resumption
//!
//! With `clean_session = false` (the default) the broker keeps session state
//! between connections. On every successful connect the broker's
//! session-present flag decides what happens to the publish table:
//!
//! ```text
//! session present   -> replay every live record in slot order, DUP set
//! session absent    -> drop every record (the broker forgot them too)
//! ```
//!
//! A QoS 2 record whose PUBREC was already seen is replayed as PUBREL.
//!
//! # Error Handling
//!
//! All operations return [`Result<T>`](Result). See [`SessionError`] for the
//! taxonomy and [`SessionError::is_recoverable`] for retry decisions.

pub mod ack;
pub mod backoff;
pub mod codec;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod packet_id;
pub mod session;
pub mod state;
pub mod tracker;
pub mod transport;
pub mod v4;

pub use ack::{AckCorrelator, AckWaitContext, Acknowledgement, StepDriver};
pub use backoff::{Backoff, BackoffError, ProcessRng};
pub use codec::{
    Codec, CodecError, ConnectOptions, InboundPublish, IncomingEvent, PublishRequest,
};
pub use config::{BackoffConfig, Config};
pub use connection::{Connected, ConnectionManager};
pub use dispatcher::{EventDispatcher, PublishCallback};
pub use error::{AckKind, SessionError};
pub use packet_id::{PacketId, PacketIdGenerator};
pub use session::Session;
pub use state::{ConnectionState, SessionState};
pub use tracker::{DeliveryPhase, PublishRecord, PublishSink, PublishTracker};
pub use transport::{Credentials, ServerInfo, TcpTransport, Transport};
pub use v4::V4Codec;

// Callers name QoS levels without depending on rumqttc directly.
pub use rumqttc::QoS;

/// Result type for session operations.
pub type Result<T> = std::result::Result<T, SessionError>;
