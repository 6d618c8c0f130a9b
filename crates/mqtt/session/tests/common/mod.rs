//! In-memory transport and scripted codec shared by the scenario tests.
//!
//! Both doubles write into one [`Broker`] record so a test can inspect what
//! went over the "wire" after handing ownership to the session.

#![allow(dead_code)]

use std::{
    collections::VecDeque,
    io,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use async_trait::async_trait;
use relaybee_mqtt_session::{
    BackoffConfig, Codec, CodecError, Config, ConnectOptions, Credentials, IncomingEvent,
    PacketId, PublishRequest, QoS, ServerInfo, Transport,
};

/// A frame the codec was asked to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Connect { clean_session: bool },
    Publish { packet_id: Option<u16>, topic: String, qos: QoS, duplicate: bool },
    PubRel(u16),
    Subscribe { packet_id: u16, filters: Vec<String> },
    Unsubscribe { packet_id: u16, filters: Vec<String> },
    Disconnect,
}

#[derive(Debug, Default)]
pub struct BrokerState {
    /// Transport connect calls that still fail.
    pub connect_failures: u32,
    pub connect_calls: u32,
    pub transport_disconnects: u32,
    pub session_present: bool,
    /// Answer publishes and subscriptions automatically.
    pub auto_ack: bool,
    /// Send a SUBACK with this id instead of the requested one.
    pub wrong_suback: Option<u16>,
    /// Fail every publish send with a broken pipe.
    pub fail_publish: bool,
    /// Fail every codec step as if the broker closed the connection.
    pub fail_step: bool,
    pub frames: Vec<Frame>,
    /// Events returned by the next codec step.
    pub inbound: VecDeque<IncomingEvent>,
}

#[derive(Debug, Clone, Default)]
pub struct Broker(Arc<Mutex<BrokerState>>);

impl Broker {
    pub fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.0.lock().unwrap()
    }

    pub fn frames(&self) -> Vec<Frame> {
        self.lock().frames.clone()
    }

    pub fn take_frames(&self) -> Vec<Frame> {
        std::mem::take(&mut self.lock().frames)
    }

    pub fn push(&self, event: IncomingEvent) {
        self.lock().inbound.push_back(event);
    }

    pub fn transport(&self) -> MockTransport {
        MockTransport {
            broker: self.clone(),
            connected: false,
        }
    }

    pub fn codec(&self) -> MockCodec {
        MockCodec {
            broker: self.clone(),
        }
    }
}

pub struct MockTransport {
    broker: Broker,
    connected: bool,
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&mut self, _server: &ServerInfo, _credentials: &Credentials) -> io::Result<()> {
        let mut broker = self.broker.lock();
        broker.connect_calls += 1;
        if broker.connect_failures > 0 {
            broker.connect_failures -= 1;
            return Err(io::Error::from(io::ErrorKind::ConnectionRefused));
        }
        self.connected = true;
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.broker.lock().transport_disconnects += 1;
        self.connected = false;
    }

    async fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(buf.len())
    }

    async fn recv(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        Err(io::Error::from(io::ErrorKind::TimedOut))
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

pub struct MockCodec {
    broker: Broker,
}

fn id(value: u16) -> PacketId {
    PacketId::new(value).unwrap()
}

#[async_trait]
impl Codec for MockCodec {
    async fn connect(
        &mut self,
        _io: &mut dyn Transport,
        options: &ConnectOptions,
    ) -> Result<bool, CodecError> {
        let mut broker = self.broker.lock();
        broker.frames.push(Frame::Connect {
            clean_session: options.clean_session,
        });
        broker.inbound.clear();
        Ok(broker.session_present)
    }

    async fn publish(
        &mut self,
        _io: &mut dyn Transport,
        request: &PublishRequest<'_>,
    ) -> Result<(), CodecError> {
        let mut broker = self.broker.lock();
        if broker.fail_publish {
            return Err(CodecError::Io(io::Error::from(io::ErrorKind::BrokenPipe)));
        }
        let packet_id = request.packet_id.map(PacketId::get);
        broker.frames.push(Frame::Publish {
            packet_id,
            topic: request.topic.to_string(),
            qos: request.qos,
            duplicate: request.duplicate,
        });
        if broker.auto_ack {
            match (request.qos, packet_id) {
                (QoS::AtLeastOnce, Some(raw)) => broker.inbound.push_back(IncomingEvent::PubAck(id(raw))),
                (QoS::ExactlyOnce, Some(raw)) => broker.inbound.push_back(IncomingEvent::PubRec(id(raw))),
                _ => {}
            }
        }
        Ok(())
    }

    async fn release(
        &mut self,
        _io: &mut dyn Transport,
        packet_id: PacketId,
    ) -> Result<(), CodecError> {
        let mut broker = self.broker.lock();
        broker.frames.push(Frame::PubRel(packet_id.get()));
        if broker.auto_ack {
            broker.inbound.push_back(IncomingEvent::PubComp(packet_id));
        }
        Ok(())
    }

    async fn subscribe(
        &mut self,
        _io: &mut dyn Transport,
        filters: &[String],
        _qos: QoS,
        packet_id: PacketId,
    ) -> Result<(), CodecError> {
        let mut broker = self.broker.lock();
        broker.frames.push(Frame::Subscribe {
            packet_id: packet_id.get(),
            filters: filters.to_vec(),
        });
        if let Some(wrong) = broker.wrong_suback {
            broker.inbound.push_back(IncomingEvent::SubAck(id(wrong)));
        } else if broker.auto_ack {
            broker.inbound.push_back(IncomingEvent::SubAck(packet_id));
        }
        Ok(())
    }

    async fn unsubscribe(
        &mut self,
        _io: &mut dyn Transport,
        filters: &[String],
        packet_id: PacketId,
    ) -> Result<(), CodecError> {
        let mut broker = self.broker.lock();
        broker.frames.push(Frame::Unsubscribe {
            packet_id: packet_id.get(),
            filters: filters.to_vec(),
        });
        if broker.auto_ack {
            broker.inbound.push_back(IncomingEvent::UnsubAck(packet_id));
        }
        Ok(())
    }

    async fn step(
        &mut self,
        _io: &mut dyn Transport,
        timeout: Duration,
    ) -> Result<Vec<IncomingEvent>, CodecError> {
        let events: Vec<IncomingEvent> = {
            let mut broker = self.broker.lock();
            if broker.fail_step {
                return Err(CodecError::Closed);
            }
            // The real codec answers PUBREC with PUBREL inside the step.
            let events: Vec<IncomingEvent> = broker.inbound.drain(..).collect();
            for event in &events {
                if let IncomingEvent::PubRec(packet_id) = event {
                    broker.frames.push(Frame::PubRel(packet_id.get()));
                    if broker.auto_ack {
                        broker.inbound.push_back(IncomingEvent::PubComp(*packet_id));
                    }
                }
            }
            events
        };
        if events.is_empty() {
            tokio::time::sleep(timeout).await;
        }
        Ok(events)
    }

    async fn disconnect(&mut self, _io: &mut dyn Transport) -> Result<(), CodecError> {
        self.broker.lock().frames.push(Frame::Disconnect);
        Ok(())
    }
}

/// Test configuration: capacity 5, 500 ms / 5 s backoff, 5 attempts.
pub fn config() -> Config {
    Config {
        host: "broker.test".into(),
        client_id: "relaybee-test".into(),
        max_outgoing_publishes: 5,
        ack_timeout_ms: 1000,
        process_loop_timeout_ms: 100,
        backoff: BackoffConfig::default(),
        ..Default::default()
    }
}
