//! The application-facing MQTT session.
//!
//! [`Session`] owns the transport, the codec and every piece of session state:
//! the publish table, the dispatcher, the packet identifier generator and the
//! reconnect backoff. All mutation goes through `&mut self`, so a session is
//! driven from one task at a time.
//!
//! # Lifecycle
//!
//! ```text
//! establish() ──► subscribe() / publish() / run_loop() ──► disconnect()
//!      ▲                          │ fatal error
//!      └──────────────────────────┘
//! ```
//!
//! `establish` connects the transport with backoff, performs the CONNECT
//! handshake and then either replays in-flight publishes (session resumed)
//! or drops them (clean session).
//!
//! # Examples
//!
//! ```ignore
//! let config = Config::default();
//! let transport = TcpTransport::new(timeout, timeout, timeout);
//! let codec = V4Codec::new(config.max_packet_size);
//! let mut session = Session::new(config, transport, codec)?;
//!
//! session.establish(Some(Box::new(|publish, _| {
//!     tracing::info!(topic = %publish.topic, "Message received");
//! }))).await?;
//! session.subscribe("sensors/#").await?;
//! session.publish_confirmed("sensors/temp", "21.5", QoS::AtLeastOnce).await?;
//! session.run_loop(Duration::from_secs(10)).await?;
//! session.disconnect().await?;
//! ```

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::QoS;
use tokio::{sync::watch, time::Instant};
use tracing::{debug, error, info, instrument, warn};
use validator::Validate;

use crate::{
    ack::{AckCorrelator, AckWaitContext, Acknowledgement, StepDriver},
    codec::{Codec, CodecError, PublishRequest},
    config::Config,
    connection::ConnectionManager,
    dispatcher::{EventDispatcher, PublishCallback},
    error::{AckKind, SessionError},
    packet_id::{PacketId, PacketIdGenerator},
    state::{update_state, ConnectionState, SessionState},
    tracker::{PublishRecord, PublishSink, PublishTracker},
    transport::Transport,
};

/// One MQTT client session over a transport and a codec.
pub struct Session<T, C> {
    config: Config,
    transport: T,
    codec: C,
    connection: ConnectionManager,
    tracker: PublishTracker,
    dispatcher: EventDispatcher,
    correlator: AckCorrelator,
    ids: PacketIdGenerator,
    state: SessionState,
    state_tx: watch::Sender<ConnectionState>,
}

/// Replays records straight onto the wire.
struct Wire<'a, T, C> {
    transport: &'a mut T,
    codec: &'a mut C,
}

#[async_trait]
impl<'a, T, C> PublishSink for Wire<'a, T, C>
where
    T: Transport + 'static,
    C: Codec + 'static,
{
    async fn send_publish(&mut self, record: &PublishRecord) -> Result<(), SessionError> {
        self.codec
            .publish(&mut *self.transport, &record.as_request())
            .await
            .map_err(SessionError::from)
    }

    async fn send_release(&mut self, packet_id: PacketId) -> Result<(), SessionError> {
        self.codec
            .release(&mut *self.transport, packet_id)
            .await
            .map_err(SessionError::from)
    }
}

impl<T, C> Session<T, C>
where
    T: Transport + 'static,
    C: Codec + 'static,
{
    /// Validates `config` and builds a disconnected session.
    ///
    /// An empty `client_id` is replaced by a random UUID here, once, so every
    /// reconnect of this session presents the same identifier.
    pub fn new(mut config: Config, transport: T, codec: C) -> Result<Self, SessionError> {
        config.validate()?;
        config.ensure_client_id();

        let (state_tx, _) = watch::channel(ConnectionState::Disconnected("not connected".into()));
        Ok(Self {
            connection: ConnectionManager::new(config.backoff.build()),
            tracker: PublishTracker::new(config.max_outgoing_publishes),
            correlator: AckCorrelator::new(config.process_loop_timeout()),
            dispatcher: EventDispatcher::new(),
            ids: PacketIdGenerator::new(),
            state: SessionState::default(),
            state_tx,
            config,
            transport,
            codec,
        })
    }

    /// Continues packet identifiers from `ids` instead of starting at 1.
    pub fn with_packet_ids(mut self, ids: PacketIdGenerator) -> Self {
        self.ids = ids;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn tracker(&self) -> &PublishTracker {
        &self.tracker
    }

    /// Watch channel carrying the connection lifecycle.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Connects, performs the MQTT handshake and reconciles in-flight publishes.
    ///
    /// `callback`, when given, replaces the inbound publish handler.
    ///
    /// # Returns
    /// The new session state; `resumed` is the broker's session-present flag.
    ///
    /// # Errors
    /// - `RetriesExhausted` when the transport never connected
    /// - `Codec` when CONNECT/CONNACK failed; the transport is closed again
    /// - `ResendFailed` when replay on a resumed session failed; the session
    ///   stays established and the records stay tracked
    #[instrument(skip_all, fields(client_id = %self.config.client_id))]
    pub async fn establish(
        &mut self,
        callback: Option<PublishCallback>,
    ) -> Result<SessionState, SessionError> {
        if self.state.established || self.transport.is_connected() {
            warn!("Establishing over an open connection, closing it first");
            self.transport.disconnect().await;
            self.state.established = false;
        }

        if let Some(callback) = callback {
            self.dispatcher.set_callback(callback);
        }
        self.dispatcher.clear_pending();

        let server = self.config.server();
        let credentials = self.config.credentials();
        self.connection
            .connect(&mut self.transport, &server, &credentials, &self.state_tx)
            .await?;

        let options = self.config.connect_options();
        let resumed = match self.codec.connect(&mut self.transport, &options).await {
            Ok(resumed) => resumed,
            Err(e) => {
                error!(error = %e, "MQTT handshake failed");
                self.transport.disconnect().await;
                update_state(&self.state_tx, ConnectionState::Disconnected(e.to_string()));
                return Err(e.into());
            }
        };

        self.state = SessionState {
            established: true,
            resumed,
        };
        update_state(&self.state_tx, ConnectionState::Connected { resumed });
        info!(resumed, in_flight = self.tracker.len(), "MQTT session established");

        let mut wire = Wire {
            transport: &mut self.transport,
            codec: &mut self.codec,
        };
        self.tracker.on_session_established(resumed, &mut wire).await?;

        Ok(self.state)
    }

    /// Sends DISCONNECT if a session is established, then always closes the
    /// transport.
    ///
    /// # Errors
    /// `NotConnected` when no session was established, or the codec error
    /// if DISCONNECT could not be sent.
    pub async fn disconnect(&mut self) -> Result<(), SessionError> {
        let result = if self.state.established {
            self.codec
                .disconnect(&mut self.transport)
                .await
                .map_err(SessionError::from)
        } else {
            Err(SessionError::NotConnected)
        };

        self.transport.disconnect().await;
        self.state.established = false;
        update_state(
            &self.state_tx,
            ConnectionState::Disconnected("client disconnect".into()),
        );

        match &result {
            Ok(()) => info!("MQTT session closed"),
            Err(e) => warn!(error = %e, "MQTT session closed without DISCONNECT"),
        }
        result
    }

    /// Drops every in-flight publish and restarts packet identifiers, e.g.
    /// before giving up on a session after a fatal error.
    pub fn abandon(&mut self) {
        self.tracker.clear_all();
        self.dispatcher.clear_pending();
        self.ids.reset();
    }

    /// Subscribes to `topic` at QoS 1 and waits for the matching SUBACK.
    pub async fn subscribe(&mut self, topic: &str) -> Result<(), SessionError> {
        self.ensure_established()?;
        let packet_id = self.next_request_id()?;
        self.dispatcher.expect_subscribe(packet_id);

        if let Err(e) = self
            .codec
            .subscribe(
                &mut self.transport,
                &[topic.to_owned()],
                QoS::AtLeastOnce,
                packet_id,
            )
            .await
        {
            return Err(self.on_wire_error(e));
        }
        debug!(topic, packet_id = %packet_id, "SUBSCRIBE sent");

        self.wait_for_ack(AckKind::SubAck, packet_id).await
    }

    /// Unsubscribes from `topic` and waits for the matching UNSUBACK.
    pub async fn unsubscribe(&mut self, topic: &str) -> Result<(), SessionError> {
        self.ensure_established()?;
        let packet_id = self.next_request_id()?;
        self.dispatcher.expect_unsubscribe(packet_id);

        if let Err(e) = self
            .codec
            .unsubscribe(&mut self.transport, &[topic.to_owned()], packet_id)
            .await
        {
            return Err(self.on_wire_error(e));
        }
        debug!(topic, packet_id = %packet_id, "UNSUBSCRIBE sent");

        self.wait_for_ack(AckKind::UnsubAck, packet_id).await
    }

    /// Publishes `payload` to `topic`.
    ///
    /// QoS 0 is sent untracked and returns `None`. QoS 1/2 takes a slot in
    /// the publish table and returns its packet identifier; the slot is freed
    /// when the acknowledgement arrives, or immediately if the send fails.
    ///
    /// # Errors
    /// `ResourceExhausted` when every slot is in flight.
    pub async fn publish(
        &mut self,
        topic: &str,
        payload: impl Into<Bytes>,
        qos: QoS,
    ) -> Result<Option<PacketId>, SessionError> {
        self.ensure_established()?;
        let payload = payload.into();

        if qos == QoS::AtMostOnce {
            let request = PublishRequest {
                topic,
                payload: &payload,
                qos,
                retain: false,
                duplicate: false,
                packet_id: None,
            };
            if let Err(e) = self.codec.publish(&mut self.transport, &request).await {
                return Err(self.on_wire_error(e));
            }
            debug!(topic, bytes = payload.len(), "QoS 0 publish sent");
            return Ok(None);
        }

        let record = self
            .tracker
            .reserve(topic, payload, qos, false, &mut self.ids)?;
        let packet_id = record.packet_id();
        let sent = self
            .codec
            .publish(&mut self.transport, &record.as_request())
            .await;

        if let Err(e) = sent {
            self.tracker.release(packet_id);
            return Err(self.on_wire_error(e));
        }
        debug!(topic, packet_id = %packet_id, ?qos, "Publish sent");
        Ok(Some(packet_id))
    }

    /// Publishes and waits until the broker completes the handshake
    /// (PUBACK for QoS 1, PUBCOMP for QoS 2).
    ///
    /// On `Timeout` the record stays tracked and may still complete later or
    /// be replayed on the next resumed session.
    pub async fn publish_confirmed(
        &mut self,
        topic: &str,
        payload: impl Into<Bytes>,
        qos: QoS,
    ) -> Result<Option<PacketId>, SessionError> {
        let packet_id = self.publish(topic, payload, qos).await?;
        if let (Some(packet_id), Some(kind)) = (packet_id, AckKind::completing(qos)) {
            self.wait_for_ack(kind, packet_id).await?;
        }
        Ok(packet_id)
    }

    /// Drives the process loop for `duration`, dispatching every inbound event.
    pub async fn run_loop(&mut self, duration: Duration) -> Result<(), SessionError> {
        self.ensure_established()?;
        let deadline = Instant::now() + duration;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(());
            }
            let budget = remaining.min(self.config.process_loop_timeout());
            match self.step(budget).await {
                Ok(_) => {}
                Err(e) if e.is_transient_step() => {}
                Err(e) => {
                    error!(error = %e, "Process loop failed");
                    return Err(e);
                }
            }
        }
    }

    /// Next identifier for a SUBSCRIBE or UNSUBSCRIBE.
    ///
    /// Skips identifiers held by in-flight publishes or by the other pending
    /// request, so a late ack for one of them cannot be taken for this one.
    fn next_request_id(&mut self) -> Result<PacketId, SessionError> {
        for _ in 0..u16::MAX {
            let candidate = self.ids.next_id();
            if self.tracker.get(candidate).is_none() && !self.dispatcher.is_pending(candidate) {
                return Ok(candidate);
            }
        }
        warn!(in_flight = self.tracker.len(), "No free packet identifier");
        Err(SessionError::ResourceExhausted {
            capacity: self.tracker.capacity(),
        })
    }

    async fn wait_for_ack(&mut self, kind: AckKind, packet_id: PacketId) -> Result<(), SessionError> {
        let correlator = self.correlator;
        let timeout = self.config.ack_timeout();
        correlator
            .wait_for_ack(self, Acknowledgement::new(kind, packet_id), timeout)
            .await
    }

    /// One bounded codec step. Returns the acknowledgements it carried.
    async fn step(&mut self, budget: Duration) -> Result<Vec<Acknowledgement>, SessionError> {
        let events = match self.codec.step(&mut self.transport, budget).await {
            Ok(events) => events,
            Err(e) => return Err(self.on_wire_error(e)),
        };

        let mut completed = Vec::new();
        for event in events {
            match self.dispatcher.dispatch(event, &mut self.tracker) {
                Ok(Some(ack)) => completed.push(ack),
                Ok(None) => {}
                Err(e) => {
                    self.mark_down(&e);
                    return Err(e);
                }
            }
        }
        Ok(completed)
    }

    fn ensure_established(&self) -> Result<(), SessionError> {
        if self.state.established {
            Ok(())
        } else {
            Err(SessionError::NotConnected)
        }
    }

    /// Converts a codec error, marking the session down when it is fatal.
    fn on_wire_error(&mut self, err: CodecError) -> SessionError {
        let err = SessionError::from(err);
        if !err.is_transient_step() {
            self.mark_down(&err);
        }
        err
    }

    fn mark_down(&mut self, err: &SessionError) {
        if self.state.established {
            warn!(error = %err, "MQTT session lost");
        }
        self.state.established = false;
        update_state(&self.state_tx, ConnectionState::Disconnected(err.to_string()));
    }
}

#[async_trait]
impl<T, C> StepDriver for Session<T, C>
where
    T: Transport + 'static,
    C: Codec + 'static,
{
    async fn step_once(
        &mut self,
        budget: Duration,
        wait: &mut AckWaitContext,
    ) -> Result<(), SessionError> {
        for ack in self.step(budget).await? {
            wait.observe(ack);
        }
        Ok(())
    }
}
