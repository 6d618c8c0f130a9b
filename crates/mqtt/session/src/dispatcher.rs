//! Routes decoded inbound events to the tracker, the pending-ack slots and the
//! application callback.

use std::fmt;

use tracing::{debug, error, info, warn};

use crate::{
    ack::Acknowledgement,
    codec::{IncomingEvent, InboundPublish},
    error::{AckKind, SessionError},
    packet_id::PacketId,
    tracker::PublishTracker,
};

/// Application hook invoked for every inbound PUBLISH.
pub type PublishCallback = Box<dyn FnMut(&InboundPublish, Option<PacketId>) + Send>;

/// Inbound event router.
///
/// Holds the identifiers of the outstanding SUBSCRIBE and UNSUBSCRIBE, if any,
/// and remembers the last identifier acknowledged so waiters can correlate.
#[derive(Default)]
pub struct EventDispatcher {
    callback: Option<PublishCallback>,
    pending_subscribe: Option<PacketId>,
    pending_unsubscribe: Option<PacketId>,
    last_acknowledged: Option<PacketId>,
}

impl fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("callback", &self.callback.is_some())
            .field("pending_subscribe", &self.pending_subscribe)
            .field("pending_unsubscribe", &self.pending_unsubscribe)
            .field("last_acknowledged", &self.last_acknowledged)
            .finish()
    }
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_callback(&mut self, callback: PublishCallback) {
        self.callback = Some(callback);
    }

    /// Records the identifier the next SUBACK must carry.
    pub fn expect_subscribe(&mut self, packet_id: PacketId) {
        self.pending_subscribe = Some(packet_id);
    }

    /// Records the identifier the next UNSUBACK must carry.
    pub fn expect_unsubscribe(&mut self, packet_id: PacketId) {
        self.pending_unsubscribe = Some(packet_id);
    }

    /// Drops pending SUBACK/UNSUBACK expectations, e.g. after a reconnect.
    pub fn clear_pending(&mut self) {
        self.pending_subscribe = None;
        self.pending_unsubscribe = None;
        self.last_acknowledged = None;
    }

    pub fn last_acknowledged(&self) -> Option<PacketId> {
        self.last_acknowledged
    }

    /// Whether `packet_id` belongs to an outstanding SUBSCRIBE or UNSUBSCRIBE.
    pub fn is_pending(&self, packet_id: PacketId) -> bool {
        self.pending_subscribe == Some(packet_id) || self.pending_unsubscribe == Some(packet_id)
    }

    /// Handles one inbound event.
    ///
    /// # Returns
    /// The acknowledgement the event carried, if any. Waiters compare its kind
    /// and identifier against the request they are waiting for.
    ///
    /// # Errors
    /// `ProtocolMismatch` when a SUBACK or UNSUBACK carries an identifier other
    /// than the pending one. Unknown packet types are logged and ignored.
    pub fn dispatch(
        &mut self,
        event: IncomingEvent,
        tracker: &mut PublishTracker,
    ) -> Result<Option<Acknowledgement>, SessionError> {
        let completed = match event {
            IncomingEvent::Publish { publish, packet_id } => {
                debug!(topic = %publish.topic, qos = ?publish.qos, bytes = publish.payload.len(), "Inbound publish");
                match self.callback.as_mut() {
                    Some(callback) => callback(&publish, packet_id),
                    None => warn!(topic = %publish.topic, "Inbound publish dropped: no callback registered"),
                }
                None
            }
            IncomingEvent::SubAck(received) => {
                let expected = self.pending_subscribe.take();
                Self::check(AckKind::SubAck, expected, received)?;
                info!(packet_id = %received, "Subscription acknowledged");
                Some(Acknowledgement::new(AckKind::SubAck, received))
            }
            IncomingEvent::UnsubAck(received) => {
                let expected = self.pending_unsubscribe.take();
                Self::check(AckKind::UnsubAck, expected, received)?;
                info!(packet_id = %received, "Unsubscription acknowledged");
                Some(Acknowledgement::new(AckKind::UnsubAck, received))
            }
            IncomingEvent::PubAck(packet_id) => Some(Self::release(AckKind::PubAck, packet_id, tracker)),
            IncomingEvent::PubComp(packet_id) => Some(Self::release(AckKind::PubComp, packet_id, tracker)),
            IncomingEvent::PubRec(packet_id) => {
                if !tracker.mark_received(packet_id) {
                    warn!(packet_id = %packet_id, "PUBREC for untracked publish ignored");
                }
                None
            }
            IncomingEvent::PingResp => {
                warn!("PINGRESP reached the session; keep-alive is handled by the codec");
                None
            }
            IncomingEvent::Unknown(packet_type) => {
                error!(packet_type = format_args!("{packet_type:#04x}"), "Unknown packet type received");
                None
            }
        };

        if let Some(ack) = completed {
            self.last_acknowledged = Some(ack.packet_id);
        }
        Ok(completed)
    }

    fn release(kind: AckKind, packet_id: PacketId, tracker: &mut PublishTracker) -> Acknowledgement {
        if tracker.release(packet_id).is_none() {
            warn!(%kind, packet_id = %packet_id, "Ack for untracked publish ignored");
        }
        Acknowledgement::new(kind, packet_id)
    }

    fn check(
        kind: AckKind,
        expected: Option<PacketId>,
        received: PacketId,
    ) -> Result<(), SessionError> {
        if expected == Some(received) {
            return Ok(());
        }
        error!(%kind, packet_id = %received, ?expected, "Acknowledgement for unexpected packet id");
        Err(SessionError::ProtocolMismatch {
            kind,
            expected,
            received,
        })
    }
}
