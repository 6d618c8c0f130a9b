//! Fixed-capacity table of outgoing QoS 1/2 publishes awaiting acknowledgement.
//!
//! Each live slot owns one [`PublishRecord`]. Records leave the table when the
//! broker completes the handshake (PUBACK for QoS 1, PUBCOMP for QoS 2), when
//! a clean session is started, or when the session is abandoned.
//!
//! On a resumed session every live record is replayed in slot order with the
//! DUP flag set. Records whose PUBREC was already seen are replayed as PUBREL.
//! The scan always starts from slot 0, so a replay that failed halfway is
//! retried in full on the next resumed session.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::QoS;
use tracing::{debug, error, info, warn};

use crate::{
    codec::PublishRequest,
    error::SessionError,
    packet_id::{PacketId, PacketIdGenerator},
};

/// Where an outgoing publish is in its acknowledgement handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryPhase {
    /// Waiting for PUBACK (QoS 1) or PUBREC (QoS 2).
    AwaitingAck,
    /// PUBREC seen, PUBREL sent, waiting for PUBCOMP.
    AwaitingComplete,
}

/// An outgoing publish held until the broker acknowledges it.
///
/// Topic and payload are reference counted, so a replay never copies the
/// message body.
#[derive(Debug, Clone)]
pub struct PublishRecord {
    packet_id: PacketId,
    topic: Arc<str>,
    payload: Bytes,
    qos: QoS,
    retain: bool,
    duplicate: bool,
    phase: DeliveryPhase,
}

impl PublishRecord {
    pub fn packet_id(&self) -> PacketId {
        self.packet_id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn qos(&self) -> QoS {
        self.qos
    }

    pub fn retain(&self) -> bool {
        self.retain
    }

    /// `true` once the record has been replayed at least once.
    pub fn duplicate(&self) -> bool {
        self.duplicate
    }

    pub fn phase(&self) -> DeliveryPhase {
        self.phase
    }

    /// Borrowed view handed to the codec.
    pub fn as_request(&self) -> PublishRequest<'_> {
        PublishRequest {
            topic: &self.topic,
            payload: &self.payload,
            qos: self.qos,
            retain: self.retain,
            duplicate: self.duplicate,
            packet_id: Some(self.packet_id),
        }
    }
}

/// Destination for replayed records.
#[async_trait]
pub trait PublishSink: Send {
    async fn send_publish(&mut self, record: &PublishRecord) -> Result<(), SessionError>;

    async fn send_release(&mut self, packet_id: PacketId) -> Result<(), SessionError>;
}

/// Fixed-capacity table of in-flight publishes.
#[derive(Debug, Clone)]
pub struct PublishTracker {
    slots: Vec<Option<PublishRecord>>,
}

impl PublishTracker {
    /// Creates a table with `capacity` slots, all free.
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: vec![None; capacity],
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }

    pub fn is_full(&self) -> bool {
        self.slots.iter().all(Option::is_some)
    }

    /// Stores a new outgoing publish in the lowest free slot.
    ///
    /// The packet identifier is drawn from `ids`, skipping any identifier
    /// still held by a live record.
    ///
    /// # Errors
    /// - `InvalidQoS` for QoS 0
    /// - `ResourceExhausted` when every slot is live; nothing is modified
    pub fn reserve(
        &mut self,
        topic: impl Into<Arc<str>>,
        payload: impl Into<Bytes>,
        qos: QoS,
        retain: bool,
        ids: &mut PacketIdGenerator,
    ) -> Result<&PublishRecord, SessionError> {
        if qos == QoS::AtMostOnce {
            return Err(SessionError::InvalidQoS(qos));
        }

        let Some(index) = self.slots.iter().position(Option::is_none) else {
            warn!(capacity = self.capacity(), "Publish table is full");
            return Err(SessionError::ResourceExhausted {
                capacity: self.capacity(),
            });
        };

        // At least one slot is free, so at most capacity - 1 identifiers are taken.
        let packet_id = loop {
            let candidate = ids.next_id();
            if self.get(candidate).is_none() {
                break candidate;
            }
        };

        debug!(slot = index, packet_id = %packet_id, "Reserved publish slot");
        Ok(self.slots[index].insert(PublishRecord {
            packet_id,
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retain,
            duplicate: false,
            phase: DeliveryPhase::AwaitingAck,
        }))
    }

    /// Frees the slot holding `packet_id`.
    ///
    /// Releasing an identifier that is not tracked is a no-op returning `None`.
    pub fn release(&mut self, packet_id: PacketId) -> Option<PublishRecord> {
        let slot = self
            .slots
            .iter_mut()
            .find(|slot| matches!(slot, Some(record) if record.packet_id == packet_id))?;
        let record = slot.take();
        debug!(packet_id = %packet_id, "Released publish slot");
        record
    }

    /// Moves a QoS 2 record to [`DeliveryPhase::AwaitingComplete`].
    ///
    /// Returns `false` when `packet_id` is not tracked.
    pub fn mark_received(&mut self, packet_id: PacketId) -> bool {
        match self.get_mut(packet_id) {
            Some(record) => {
                record.phase = DeliveryPhase::AwaitingComplete;
                true
            }
            None => false,
        }
    }

    pub fn get(&self, packet_id: PacketId) -> Option<&PublishRecord> {
        self.slots
            .iter()
            .flatten()
            .find(|record| record.packet_id == packet_id)
    }

    fn get_mut(&mut self, packet_id: PacketId) -> Option<&mut PublishRecord> {
        self.slots
            .iter_mut()
            .flatten()
            .find(|record| record.packet_id == packet_id)
    }

    /// Live records with their slot index, in slot order.
    pub fn live(&self) -> impl Iterator<Item = (usize, &PublishRecord)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.as_ref().map(|record| (index, record)))
    }

    /// Drops every record.
    pub fn clear_all(&mut self) {
        let dropped = self.len();
        self.slots.iter_mut().for_each(|slot| *slot = None);
        if dropped > 0 {
            info!(dropped, "Cleared in-flight publishes");
        }
    }

    /// Reconciles the table with a freshly established session.
    ///
    /// A clean session (`resumed == false`) drops every record. A resumed
    /// session replays every live record through `sink` in slot order, with
    /// the DUP flag set, stopping at the first failure.
    ///
    /// # Returns
    /// The number of records replayed.
    ///
    /// # Errors
    /// `ResendFailed` naming the slot whose replay failed. The failed record
    /// and every later record stay tracked.
    pub async fn on_session_established<S>(
        &mut self,
        resumed: bool,
        sink: &mut S,
    ) -> Result<usize, SessionError>
    where
        S: PublishSink + ?Sized,
    {
        if !resumed {
            self.clear_all();
            return Ok(0);
        }

        let mut resent = 0;
        for (index, slot) in self.slots.iter_mut().enumerate() {
            let Some(record) = slot.as_mut() else {
                continue;
            };
            record.duplicate = true;

            let result = match record.phase {
                DeliveryPhase::AwaitingAck => sink.send_publish(record).await,
                DeliveryPhase::AwaitingComplete => sink.send_release(record.packet_id).await,
            };

            if let Err(e) = result {
                error!(slot = index, packet_id = %record.packet_id, error = %e, "Replay of in-flight publish failed");
                return Err(SessionError::ResendFailed {
                    index,
                    packet_id: record.packet_id,
                    source: Box::new(e),
                });
            }
            debug!(slot = index, packet_id = %record.packet_id, "Replayed in-flight publish");
            resent += 1;
        }

        if resent > 0 {
            info!(resent, "Replayed in-flight publishes on resumed session");
        }
        Ok(resent)
    }
}
