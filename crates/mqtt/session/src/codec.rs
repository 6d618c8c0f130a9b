//! The seam between the session and MQTT wire encoding.
//!
//! A [`Codec`] turns session intents (connect, publish, release, subscribe)
//! into packets written to a [`Transport`], and turns inbound bytes into
//! [`IncomingEvent`]s. Keep-alive pings and the broker side of inbound QoS
//! handshakes are the codec's business, so the session only ever sees events
//! it has to act on.
//!
//! [`V4Codec`](crate::V4Codec) implements MQTT 3.1.1.

use std::{io, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::QoS;
use thiserror::Error;

use crate::{
    packet_id::PacketId,
    transport::{Credentials, Transport},
};

/// Application message delivered by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundPublish {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub duplicate: bool,
}

/// Decoded inbound packet, reduced to what the session acts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IncomingEvent {
    /// Application message. `packet_id` is `None` for QoS 0.
    Publish {
        publish: InboundPublish,
        packet_id: Option<PacketId>,
    },
    SubAck(PacketId),
    UnsubAck(PacketId),
    PubAck(PacketId),
    PubRec(PacketId),
    PubComp(PacketId),
    PingResp,
    /// A packet a client never expects. Carries the fixed-header type byte.
    Unknown(u8),
}

impl IncomingEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            IncomingEvent::Publish { .. } => "PUBLISH",
            IncomingEvent::SubAck(_) => "SUBACK",
            IncomingEvent::UnsubAck(_) => "UNSUBACK",
            IncomingEvent::PubAck(_) => "PUBACK",
            IncomingEvent::PubRec(_) => "PUBREC",
            IncomingEvent::PubComp(_) => "PUBCOMP",
            IncomingEvent::PingResp => "PINGRESP",
            IncomingEvent::Unknown(_) => "UNKNOWN",
        }
    }
}

/// Outgoing PUBLISH as seen by the codec.
#[derive(Debug, Clone, Copy)]
pub struct PublishRequest<'a> {
    pub topic: &'a str,
    pub payload: &'a Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub duplicate: bool,
    /// `None` only for QoS 0.
    pub packet_id: Option<PacketId>,
}

/// Parameters of the CONNECT packet.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub client_id: String,
    pub keep_alive: Duration,
    pub clean_session: bool,
    pub credentials: Credentials,
    /// How long to wait for CONNACK.
    pub connack_timeout: Duration,
}

/// Codec failures.
#[derive(Debug, Error)]
pub enum CodecError {
    /// A partial packet is buffered; more bytes are needed.
    #[error("Need more bytes to decode a packet")]
    NeedMoreBytes,

    #[error("Transport error: {0}")]
    Io(#[from] io::Error),

    #[error("Malformed packet: {0}")]
    Malformed(String),

    /// CONNACK carried a non-success return code.
    #[error("Connection refused by broker: {0}")]
    ConnectionRefused(String),

    /// The first packet after CONNECT was not a CONNACK.
    #[error("Expected CONNACK, received {0}")]
    UnexpectedPacket(String),

    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("Connection closed by peer")]
    Closed,

    /// The transport failed after part of a packet was sent; the stream can
    /// no longer be framed.
    #[error("Send failed after {written} of {total} bytes: {source}")]
    PartialWrite {
        written: usize,
        total: usize,
        #[source]
        source: io::Error,
    },

    /// A PINGREQ went unanswered for a whole keep-alive interval.
    #[error("Keep-alive timeout: no PINGRESP from broker")]
    KeepAliveTimeout,
}

impl From<rumqttc::mqttbytes::Error> for CodecError {
    fn from(err: rumqttc::mqttbytes::Error) -> Self {
        CodecError::Malformed(err.to_string())
    }
}

impl CodecError {
    /// Returns `true` when the same operation can be retried on this connection.
    pub fn is_recoverable(&self) -> bool {
        match self {
            CodecError::NeedMoreBytes => true,
            CodecError::Io(err) => matches!(
                err.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
            ),
            _ => false,
        }
    }
}

/// MQTT packet encoder and decoder bound to a transport per call.
#[async_trait]
pub trait Codec: Send {
    /// Sends CONNECT and waits for CONNACK.
    ///
    /// # Returns
    /// The broker's session-present flag.
    async fn connect(
        &mut self,
        io: &mut dyn Transport,
        options: &ConnectOptions,
    ) -> Result<bool, CodecError>;

    async fn publish(
        &mut self,
        io: &mut dyn Transport,
        request: &PublishRequest<'_>,
    ) -> Result<(), CodecError>;

    /// Sends PUBREL for an outgoing QoS 2 publish.
    async fn release(&mut self, io: &mut dyn Transport, packet_id: PacketId)
        -> Result<(), CodecError>;

    async fn subscribe(
        &mut self,
        io: &mut dyn Transport,
        filters: &[String],
        qos: QoS,
        packet_id: PacketId,
    ) -> Result<(), CodecError>;

    async fn unsubscribe(
        &mut self,
        io: &mut dyn Transport,
        filters: &[String],
        packet_id: PacketId,
    ) -> Result<(), CodecError>;

    /// Runs one bounded receive cycle.
    ///
    /// Returns every complete event decoded within `timeout`, possibly none.
    async fn step(
        &mut self,
        io: &mut dyn Transport,
        timeout: Duration,
    ) -> Result<Vec<IncomingEvent>, CodecError>;

    /// Sends DISCONNECT. Closing the transport is the caller's job.
    async fn disconnect(&mut self, io: &mut dyn Transport) -> Result<(), CodecError>;
}
