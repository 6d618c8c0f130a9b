//! Error taxonomy for session operations.
//!
//! Every public operation returns `Result<T, SessionError>`. Errors fall into
//! two groups:
//!
//! **Recoverable** (the caller may simply try again later):
//! - `ResourceExhausted`: all publish slots are occupied
//! - `Timeout`: the expected ack did not arrive in time
//! - `Codec` wrapping a "need more bytes" or would-block condition
//!
//! **Fatal** (the session must be re-established):
//! - `Transport` / `Codec`: the connection is unusable
//! - `ProtocolMismatch`: the broker acknowledged the wrong identifier
//! - `RetriesExhausted`: the reconnect backoff gave up
//! - `ResendFailed`: replaying in-flight publishes on a resumed session failed
//!
//! ```ignore
//! match session.publish("telemetry", payload, QoS::AtLeastOnce).await {
//!     Ok(_) => {}
//!     Err(e) if e.is_recoverable() => tracing::warn!(error = %e, "Publish deferred"),
//!     Err(e) => return Err(e),
//! }
//! ```

use std::{fmt, time::Duration};

use rumqttc::QoS;
use thiserror::Error;

use crate::{backoff::BackoffError, codec::CodecError, packet_id::PacketId};

/// Acknowledgement kinds correlated by exact packet identifier.
///
/// Packet identifiers are shared between publishes and subscriptions, so a
/// waiter matches on kind and identifier together.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckKind {
    /// Completes a QoS 1 publish.
    PubAck,
    /// Completes a QoS 2 publish.
    PubComp,
    SubAck,
    UnsubAck,
}

impl AckKind {
    /// The acknowledgement that completes a publish at `qos`, `None` for QoS 0.
    pub fn completing(qos: QoS) -> Option<AckKind> {
        match qos {
            QoS::AtMostOnce => None,
            QoS::AtLeastOnce => Some(AckKind::PubAck),
            QoS::ExactlyOnce => Some(AckKind::PubComp),
        }
    }
}

impl fmt::Display for AckKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AckKind::PubAck => f.write_str("PUBACK"),
            AckKind::PubComp => f.write_str("PUBCOMP"),
            AckKind::SubAck => f.write_str("SUBACK"),
            AckKind::UnsubAck => f.write_str("UNSUBACK"),
        }
    }
}

/// The unified error type for session operations.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Socket level failure outside the codec.
    #[error("Transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// Encoding, decoding or handshake failure reported by the codec.
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// Every publish slot holds an unacknowledged record.
    ///
    /// Recovery: drive the process loop so acks free slots, then retry.
    #[error("No free slot for outgoing publish (capacity {capacity})")]
    ResourceExhausted { capacity: usize },

    /// A SUBACK or UNSUBACK carried an identifier other than the pending one.
    ///
    /// This is a protocol violation and ends the session.
    #[error(
        "{kind} carried packet id {received}, expected {}",
        .expected.map_or_else(|| "none".to_string(), |id| id.to_string())
    )]
    ProtocolMismatch {
        kind: AckKind,
        expected: Option<PacketId>,
        received: PacketId,
    },

    /// The ack for `packet_id` did not arrive before the deadline.
    #[error("Timed out after {waited:?} waiting for ack of packet id {packet_id}")]
    Timeout { packet_id: PacketId, waited: Duration },

    /// The reconnect backoff ran out of attempts.
    #[error("Retry policy error: {0}")]
    RetriesExhausted(#[from] BackoffError),

    /// Replaying in-flight records on a resumed session failed.
    ///
    /// `index` is the slot that failed; later slots were not attempted. The
    /// records stay tracked and are replayed again on the next resumed session.
    #[error("Resend of packet id {packet_id} (slot {index}) failed: {source}")]
    ResendFailed {
        index: usize,
        packet_id: PacketId,
        #[source]
        source: Box<SessionError>,
    },

    /// The operation needs an established session.
    #[error("Session is not established")]
    NotConnected,

    /// Only QoS 1 and QoS 2 publishes are tracked.
    #[error("QoS {0:?} publishes are not tracked")]
    InvalidQoS(QoS),

    /// Session configuration failed validation.
    #[error("Configuration error: {0}")]
    Config(#[from] validator::ValidationErrors),
}

impl SessionError {
    /// Returns `true` for conditions the caller can retry without reconnecting.
    pub fn is_recoverable(&self) -> bool {
        match self {
            SessionError::ResourceExhausted { .. } | SessionError::Timeout { .. } => true,
            SessionError::Codec(err) => err.is_recoverable(),
            _ => false,
        }
    }

    /// Returns `true` when a single process-loop step may simply be retried.
    pub(crate) fn is_transient_step(&self) -> bool {
        matches!(self, SessionError::Codec(err) if err.is_recoverable())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_mismatch_display() {
        let err = SessionError::ProtocolMismatch {
            kind: AckKind::SubAck,
            expected: PacketId::new(3),
            received: PacketId::new(4).unwrap(),
        };
        assert_eq!(err.to_string(), "SUBACK carried packet id 4, expected 3");

        let err = SessionError::ProtocolMismatch {
            kind: AckKind::UnsubAck,
            expected: None,
            received: PacketId::new(9).unwrap(),
        };
        assert_eq!(err.to_string(), "UNSUBACK carried packet id 9, expected none");
    }

    #[test]
    fn test_recoverable_classification() {
        assert!(SessionError::ResourceExhausted { capacity: 5 }.is_recoverable());
        assert!(SessionError::Codec(CodecError::NeedMoreBytes).is_recoverable());
        assert!(!SessionError::Codec(CodecError::Closed).is_recoverable());
        assert!(!SessionError::NotConnected.is_recoverable());
        assert!(!SessionError::RetriesExhausted(BackoffError::Exhausted(5)).is_recoverable());
    }

    #[test]
    fn test_transient_step_excludes_timeouts() {
        let timeout = SessionError::Timeout {
            packet_id: PacketId::new(1).unwrap(),
            waited: Duration::from_secs(1),
        };
        assert!(timeout.is_recoverable());
        assert!(!timeout.is_transient_step());
        assert!(SessionError::Codec(CodecError::NeedMoreBytes).is_transient_step());
    }

    #[test]
    fn test_completing_ack_per_qos() {
        assert_eq!(AckKind::completing(QoS::AtMostOnce), None);
        assert_eq!(AckKind::completing(QoS::AtLeastOnce), Some(AckKind::PubAck));
        assert_eq!(AckKind::completing(QoS::ExactlyOnce), Some(AckKind::PubComp));
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer");
        let err: SessionError = io_err.into();
        assert!(err.to_string().contains("reset by peer"));
    }
}
