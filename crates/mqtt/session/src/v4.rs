//! MQTT 3.1.1 codec on top of `rumqttc`'s packet types.
//!
//! All packet encoding and decoding is done by `rumqttc::mqttbytes::v4`; this
//! module frames those calls over a [`Transport`] and answers the packets a
//! client must answer on its own:
//!
//! - PINGREQ when the connection has been idle for a keep-alive interval
//! - PUBACK for inbound QoS 1, PUBREC/PUBCOMP for inbound QoS 2
//! - PUBREL when the broker sends PUBREC for one of our QoS 2 publishes

use std::{collections::HashSet, io, time::Duration};

use async_trait::async_trait;
use bytes::BytesMut;
use rumqttc::{
    mqttbytes::{self, v4},
    ConnectReturnCode, Packet, QoS,
};
use tokio::time::{timeout, Instant};
use tracing::{debug, trace, warn};

use crate::{
    codec::{Codec, CodecError, ConnectOptions, InboundPublish, IncomingEvent, PublishRequest},
    packet_id::PacketId,
    transport::Transport,
};

const READ_CHUNK: usize = 1024;

/// MQTT 3.1.1 codec.
#[derive(Debug)]
pub struct V4Codec {
    read_buf: BytesMut,
    write_buf: BytesMut,
    max_packet_size: usize,
    keep_alive: Duration,
    last_outgoing: Instant,
    ping_sent_at: Option<Instant>,
    /// Inbound QoS 2 identifiers answered with PUBREC and awaiting PUBREL.
    incoming_qos2: HashSet<u16>,
}

impl V4Codec {
    /// # Arguments
    /// - `max_packet_size`: largest inbound packet accepted, in bytes
    pub fn new(max_packet_size: usize) -> Self {
        Self {
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            write_buf: BytesMut::with_capacity(READ_CHUNK),
            max_packet_size,
            keep_alive: Duration::ZERO,
            last_outgoing: Instant::now(),
            ping_sent_at: None,
            incoming_qos2: HashSet::new(),
        }
    }

    /// Writes the encoded `write_buf` to the transport in full.
    ///
    /// `write_buf` is empty again on every exit, so a failed packet is never
    /// resent in front of the next one. A failure before the first byte is
    /// returned as is; a failure after it is `PartialWrite`.
    async fn flush(&mut self, io: &mut dyn Transport) -> Result<(), CodecError> {
        let total = self.write_buf.len();
        let mut written = 0;
        while written < total {
            let n = match io.send(&self.write_buf[written..]).await {
                Ok(n) => n,
                Err(e) if written == 0 => {
                    self.write_buf.clear();
                    return Err(e.into());
                }
                Err(source) => {
                    self.write_buf.clear();
                    warn!(written, total, error = %source, "Send failed mid-packet");
                    return Err(CodecError::PartialWrite {
                        written,
                        total,
                        source,
                    });
                }
            };
            if n == 0 {
                self.write_buf.clear();
                return Err(CodecError::Closed);
            }
            written += n;
        }
        self.write_buf.clear();
        self.last_outgoing = Instant::now();
        Ok(())
    }

    /// Reads once from the transport into `read_buf`.
    ///
    /// Returns `Ok(false)` when the read timed out without data.
    async fn fill(&mut self, io: &mut dyn Transport, limit: Duration) -> Result<bool, CodecError> {
        let mut chunk = [0u8; READ_CHUNK];
        let read = match timeout(limit, io.recv(&mut chunk)).await {
            Err(_) => return Ok(false),
            Ok(Err(e)) if e.kind() == io::ErrorKind::TimedOut => return Ok(false),
            Ok(result) => result?,
        };
        if read == 0 {
            return Err(CodecError::Closed);
        }
        self.read_buf.extend_from_slice(&chunk[..read]);
        Ok(true)
    }

    /// Decodes one complete packet from `read_buf`, if there is one.
    fn decode(&mut self) -> Result<Option<Packet>, CodecError> {
        if self.read_buf.is_empty() {
            return Ok(None);
        }
        match v4::read(&mut self.read_buf, self.max_packet_size) {
            Ok(packet) => Ok(Some(packet)),
            Err(mqttbytes::Error::InsufficientBytes(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn maybe_ping(&mut self, io: &mut dyn Transport) -> Result<(), CodecError> {
        if self.keep_alive.is_zero() {
            return Ok(());
        }
        if let Some(sent_at) = self.ping_sent_at {
            if sent_at.elapsed() >= self.keep_alive {
                warn!(keep_alive = ?self.keep_alive, "PINGRESP not received in time");
                return Err(CodecError::KeepAliveTimeout);
            }
            return Ok(());
        }
        if self.last_outgoing.elapsed() >= self.keep_alive {
            trace!("Sending PINGREQ");
            v4::PingReq.write(&mut self.write_buf)?;
            self.flush(io).await?;
            self.ping_sent_at = Some(Instant::now());
        }
        Ok(())
    }

    /// Answers `packet` where the protocol requires it and converts it to an event.
    async fn handle(
        &mut self,
        io: &mut dyn Transport,
        packet: Packet,
    ) -> Result<Option<IncomingEvent>, CodecError> {
        let event = match packet {
            Packet::Publish(publish) => {
                let packet_id = PacketId::new(publish.pkid);
                let fresh = match publish.qos {
                    QoS::AtMostOnce => true,
                    QoS::AtLeastOnce => {
                        v4::PubAck::new(publish.pkid).write(&mut self.write_buf)?;
                        self.flush(io).await?;
                        true
                    }
                    QoS::ExactlyOnce => {
                        let fresh = self.incoming_qos2.insert(publish.pkid);
                        v4::PubRec::new(publish.pkid).write(&mut self.write_buf)?;
                        self.flush(io).await?;
                        fresh
                    }
                };
                if !fresh {
                    debug!(packet_id = publish.pkid, "Duplicate QoS 2 publish suppressed");
                    return Ok(None);
                }
                IncomingEvent::Publish {
                    publish: InboundPublish {
                        topic: publish.topic,
                        payload: publish.payload,
                        qos: publish.qos,
                        retain: publish.retain,
                        duplicate: publish.dup,
                    },
                    packet_id,
                }
            }
            Packet::PubRel(rel) => {
                self.incoming_qos2.remove(&rel.pkid);
                v4::PubComp::new(rel.pkid).write(&mut self.write_buf)?;
                self.flush(io).await?;
                return Ok(None);
            }
            Packet::PubRec(rec) => {
                let packet_id = ack_id("PUBREC", rec.pkid)?;
                v4::PubRel::new(rec.pkid).write(&mut self.write_buf)?;
                self.flush(io).await?;
                IncomingEvent::PubRec(packet_id)
            }
            Packet::PubAck(ack) => IncomingEvent::PubAck(ack_id("PUBACK", ack.pkid)?),
            Packet::PubComp(comp) => IncomingEvent::PubComp(ack_id("PUBCOMP", comp.pkid)?),
            Packet::SubAck(ack) => IncomingEvent::SubAck(ack_id("SUBACK", ack.pkid)?),
            Packet::UnsubAck(ack) => IncomingEvent::UnsubAck(ack_id("UNSUBACK", ack.pkid)?),
            Packet::PingResp => {
                trace!("PINGRESP received");
                self.ping_sent_at = None;
                return Ok(None);
            }
            other => IncomingEvent::Unknown(packet_type(&other)),
        };
        Ok(Some(event))
    }
}

fn ack_id(kind: &str, raw: u16) -> Result<PacketId, CodecError> {
    PacketId::new(raw).ok_or_else(|| CodecError::Malformed(format!("{kind} with packet id 0")))
}

/// Fixed-header type byte of packets a client never expects to receive.
fn packet_type(packet: &Packet) -> u8 {
    match packet {
        Packet::Connect(_) => 0x10,
        Packet::ConnAck(_) => 0x20,
        Packet::Subscribe(_) => 0x82,
        Packet::Unsubscribe(_) => 0xA2,
        Packet::PingReq => 0xC0,
        Packet::Disconnect => 0xE0,
        _ => 0x00,
    }
}

#[async_trait]
impl Codec for V4Codec {
    async fn connect(
        &mut self,
        io: &mut dyn Transport,
        options: &ConnectOptions,
    ) -> Result<bool, CodecError> {
        self.read_buf.clear();
        self.write_buf.clear();
        self.ping_sent_at = None;
        self.incoming_qos2.clear();
        self.keep_alive = options.keep_alive;

        let mut connect = v4::Connect::new(options.client_id.as_str());
        connect.keep_alive = u16::try_from(options.keep_alive.as_secs()).unwrap_or(u16::MAX);
        connect.clean_session = options.clean_session;
        if let Some(username) = &options.credentials.username {
            let password = options.credentials.password.clone().unwrap_or_default();
            connect.set_login(username.as_str(), password);
        }
        connect.write(&mut self.write_buf)?;
        self.flush(io).await?;
        debug!(client_id = %options.client_id, clean_session = options.clean_session, "CONNECT sent");

        let deadline = Instant::now() + options.connack_timeout;
        loop {
            if let Some(packet) = self.decode()? {
                return match packet {
                    Packet::ConnAck(ack) if ack.code == ConnectReturnCode::Success => {
                        debug!(session_present = ack.session_present, "CONNACK accepted");
                        Ok(ack.session_present)
                    }
                    Packet::ConnAck(ack) => Err(CodecError::ConnectionRefused(format!("{:?}", ack.code))),
                    other => Err(CodecError::UnexpectedPacket(format!("{other:?}"))),
                };
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() || !self.fill(io, remaining).await? {
                return Err(CodecError::Timeout("CONNACK"));
            }
        }
    }

    async fn publish(
        &mut self,
        io: &mut dyn Transport,
        request: &PublishRequest<'_>,
    ) -> Result<(), CodecError> {
        let mut publish = v4::Publish::new(request.topic, request.qos, request.payload.to_vec());
        publish.pkid = request.packet_id.map_or(0, PacketId::get);
        publish.dup = request.duplicate;
        publish.retain = request.retain;
        publish.write(&mut self.write_buf)?;
        self.flush(io).await
    }

    async fn release(
        &mut self,
        io: &mut dyn Transport,
        packet_id: PacketId,
    ) -> Result<(), CodecError> {
        v4::PubRel::new(packet_id.get()).write(&mut self.write_buf)?;
        self.flush(io).await
    }

    async fn subscribe(
        &mut self,
        io: &mut dyn Transport,
        filters: &[String],
        qos: QoS,
        packet_id: PacketId,
    ) -> Result<(), CodecError> {
        let mut subscribe = v4::Subscribe::new_many(
            filters
                .iter()
                .map(|filter| v4::SubscribeFilter::new(filter.clone(), qos)),
        );
        subscribe.pkid = packet_id.get();
        subscribe.write(&mut self.write_buf)?;
        self.flush(io).await
    }

    async fn unsubscribe(
        &mut self,
        io: &mut dyn Transport,
        filters: &[String],
        packet_id: PacketId,
    ) -> Result<(), CodecError> {
        let unsubscribe = v4::Unsubscribe {
            pkid: packet_id.get(),
            topics: filters.to_vec(),
        };
        unsubscribe.write(&mut self.write_buf)?;
        self.flush(io).await
    }

    async fn step(
        &mut self,
        io: &mut dyn Transport,
        limit: Duration,
    ) -> Result<Vec<IncomingEvent>, CodecError> {
        self.maybe_ping(io).await?;

        let mut events = Vec::new();
        let mut read_once = false;
        loop {
            while let Some(packet) = self.decode()? {
                if let Some(event) = self.handle(io, packet).await? {
                    events.push(event);
                }
            }
            if !events.is_empty() || read_once {
                break;
            }
            read_once = true;
            if !self.fill(io, limit).await? {
                break;
            }
        }

        if events.is_empty() && !self.read_buf.is_empty() {
            return Err(CodecError::NeedMoreBytes);
        }
        Ok(events)
    }

    async fn disconnect(&mut self, io: &mut dyn Transport) -> Result<(), CodecError> {
        v4::Disconnect.write(&mut self.write_buf)?;
        self.flush(io).await?;
        debug!("DISCONNECT sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use bytes::Bytes;

    use super::*;
    use crate::transport::{Credentials, ServerInfo};

    /// In-memory transport: `inbound` chunks are handed to `recv` in order.
    ///
    /// Each `send` pops one entry of `sends`: `Some(n)` accepts at most `n`
    /// bytes, `None` fails with WouldBlock. Once empty, every send is accepted.
    #[derive(Default)]
    struct Loopback {
        inbound: VecDeque<Vec<u8>>,
        outbound: Vec<u8>,
        sends: VecDeque<Option<usize>>,
    }

    impl Loopback {
        fn with(chunks: &[&[u8]]) -> Self {
            Self {
                inbound: chunks.iter().map(|c| c.to_vec()).collect(),
                ..Default::default()
            }
        }

        fn sending(sends: &[Option<usize>]) -> Self {
            Self {
                sends: sends.iter().copied().collect(),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl Transport for Loopback {
        async fn connect(&mut self, _: &ServerInfo, _: &Credentials) -> io::Result<()> {
            Ok(())
        }

        async fn disconnect(&mut self) {}

        async fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
            let n = match self.sends.pop_front() {
                Some(None) => return Err(io::Error::from(io::ErrorKind::WouldBlock)),
                Some(Some(limit)) => limit.min(buf.len()),
                None => buf.len(),
            };
            self.outbound.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        async fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.inbound.pop_front() {
                Some(chunk) => {
                    buf[..chunk.len()].copy_from_slice(&chunk);
                    Ok(chunk.len())
                }
                None => Err(io::Error::from(io::ErrorKind::TimedOut)),
            }
        }

        fn is_connected(&self) -> bool {
            true
        }
    }

    fn options() -> ConnectOptions {
        ConnectOptions {
            client_id: "relaybee-test".into(),
            keep_alive: Duration::from_secs(60),
            clean_session: false,
            credentials: Credentials::default(),
            connack_timeout: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn test_connect_reports_session_present() {
        let mut io = Loopback::with(&[&[0x20, 0x02, 0x01, 0x00]]);
        let mut codec = V4Codec::new(1024);
        let resumed = codec.connect(&mut io, &options()).await.unwrap();
        assert!(resumed);
        assert_eq!(io.outbound[0], 0x10);
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let mut io = Loopback::with(&[&[0x20, 0x02, 0x00, 0x05]]);
        let mut codec = V4Codec::new(1024);
        let err = codec.connect(&mut io, &options()).await.unwrap_err();
        assert!(matches!(err, CodecError::ConnectionRefused(_)));
    }

    #[tokio::test]
    async fn test_connect_times_out_without_connack() {
        let mut io = Loopback::default();
        let mut codec = V4Codec::new(1024);
        let err = codec.connect(&mut io, &options()).await.unwrap_err();
        assert!(matches!(err, CodecError::Timeout("CONNACK")));
    }

    #[tokio::test]
    async fn test_step_decodes_puback() {
        let mut io = Loopback::with(&[&[0x40, 0x02, 0x00, 0x2A]]);
        let mut codec = V4Codec::new(1024);
        let events = codec.step(&mut io, Duration::from_millis(10)).await.unwrap();
        assert_eq!(events, vec![IncomingEvent::PubAck(PacketId::new(42).unwrap())]);
    }

    #[tokio::test]
    async fn test_step_with_partial_packet_needs_more_bytes() {
        let mut io = Loopback::with(&[&[0x40, 0x02, 0x00], &[0x2A]]);
        let mut codec = V4Codec::new(1024);
        let err = codec.step(&mut io, Duration::from_millis(10)).await.unwrap_err();
        assert!(err.is_recoverable());

        let events = codec.step(&mut io, Duration::from_millis(10)).await.unwrap();
        assert_eq!(events, vec![IncomingEvent::PubAck(PacketId::new(42).unwrap())]);
    }

    #[tokio::test]
    async fn test_step_without_data_is_empty() {
        let mut io = Loopback::default();
        let mut codec = V4Codec::new(1024);
        let events = codec.step(&mut io, Duration::from_millis(10)).await.unwrap();
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn test_inbound_qos1_publish_is_acked() {
        // PUBLISH QoS 1, topic "a/b", packet id 7, payload "hi"
        let publish = [
            0x32, 0x09, 0x00, 0x03, b'a', b'/', b'b', 0x00, 0x07, b'h', b'i',
        ];
        let mut io = Loopback::with(&[&publish]);
        let mut codec = V4Codec::new(1024);
        let events = codec.step(&mut io, Duration::from_millis(10)).await.unwrap();

        assert_eq!(events.len(), 1);
        match &events[0] {
            IncomingEvent::Publish { publish, packet_id } => {
                assert_eq!(publish.topic, "a/b");
                assert_eq!(&publish.payload[..], b"hi");
                assert_eq!(publish.qos, QoS::AtLeastOnce);
                assert_eq!(*packet_id, PacketId::new(7));
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(io.outbound, vec![0x40, 0x02, 0x00, 0x07]);
    }

    #[tokio::test]
    async fn test_pubrec_is_answered_with_pubrel() {
        let mut io = Loopback::with(&[&[0x50, 0x02, 0x00, 0x03]]);
        let mut codec = V4Codec::new(1024);
        let events = codec.step(&mut io, Duration::from_millis(10)).await.unwrap();
        assert_eq!(events, vec![IncomingEvent::PubRec(PacketId::new(3).unwrap())]);
        assert_eq!(io.outbound, vec![0x62, 0x02, 0x00, 0x03]);
    }

    #[tokio::test]
    async fn test_closed_stream_is_fatal() {
        struct Closed;

        #[async_trait]
        impl Transport for Closed {
            async fn connect(&mut self, _: &ServerInfo, _: &Credentials) -> io::Result<()> {
                Ok(())
            }
            async fn disconnect(&mut self) {}
            async fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
                Ok(buf.len())
            }
            async fn recv(&mut self, _: &mut [u8]) -> io::Result<usize> {
                Ok(0)
            }
            fn is_connected(&self) -> bool {
                false
            }
        }

        let mut codec = V4Codec::new(1024);
        let err = codec.step(&mut Closed, Duration::from_millis(10)).await.unwrap_err();
        assert!(matches!(err, CodecError::Closed));
        assert!(!err.is_recoverable());
    }

    fn qos0(payload: &Bytes) -> PublishRequest<'_> {
        PublishRequest {
            topic: "t",
            payload,
            qos: QoS::AtMostOnce,
            retain: false,
            duplicate: false,
            packet_id: None,
        }
    }

    #[tokio::test]
    async fn test_would_block_before_first_byte_drops_packet() {
        let mut io = Loopback::sending(&[None]);
        let mut codec = V4Codec::new(1024);

        let first = Bytes::from_static(b"A");
        let err = codec.publish(&mut io, &qos0(&first)).await.unwrap_err();
        assert!(err.is_recoverable());
        assert!(io.outbound.is_empty());

        let second = Bytes::from_static(b"B");
        codec.publish(&mut io, &qos0(&second)).await.unwrap();
        assert_eq!(io.outbound, vec![0x30, 0x04, 0x00, 0x01, b't', b'B']);
    }

    #[tokio::test]
    async fn test_send_failure_mid_packet_is_fatal() {
        let mut io = Loopback::sending(&[Some(2), None]);
        let mut codec = V4Codec::new(1024);

        let first = Bytes::from_static(b"A");
        let err = codec.publish(&mut io, &qos0(&first)).await.unwrap_err();
        assert!(matches!(
            err,
            CodecError::PartialWrite {
                written: 2,
                total: 6,
                ..
            }
        ));
        assert!(!err.is_recoverable());

        // Nothing of the failed packet is sent again.
        let second = Bytes::from_static(b"B");
        codec.publish(&mut io, &qos0(&second)).await.unwrap();
        assert_eq!(
            io.outbound,
            vec![0x30, 0x04, 0x30, 0x04, 0x00, 0x01, b't', b'B']
        );
    }

    #[tokio::test]
    async fn test_disconnect_writes_packet() {
        let mut io = Loopback::default();
        let mut codec = V4Codec::new(1024);
        codec.disconnect(&mut io).await.unwrap();
        assert_eq!(io.outbound, vec![0xE0, 0x00]);
    }
}
