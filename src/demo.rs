//! The demo run: one session against the configured broker.
//!
//! Subscribes to the demo topic, publishes the configured number of messages
//! (each echoed back through the subscription), drives the process loop for
//! the configured time or until Ctrl-C, then unsubscribes and disconnects.

use std::future::Future;

use relaybee_mqtt_session::{
    Codec, ConnectionState, PublishCallback, Session, SessionError, TcpTransport,
    Transport, V4Codec,
};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::{demo::DemoConfig, Config};

#[derive(Error, Debug)]
pub enum DemoError {
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Ack for message {n} not received: {source}")]
    Unconfirmed {
        n: u32,
        #[source]
        source: SessionError,
    },
}

/// Builds the TCP session described by `config`.
pub fn build_session(config: &Config) -> Result<Session<TcpTransport, V4Codec>, DemoError> {
    let timeout = config.transport.transport_timeout();
    let transport = TcpTransport::new(timeout, timeout, timeout);
    let codec = V4Codec::new(config.transport.max_packet_size);
    Ok(Session::new(config.transport.clone(), transport, codec)?)
}

/// Logs every inbound message.
pub fn log_messages() -> PublishCallback {
    Box::new(|publish, packet_id| {
        info!(
            topic = %publish.topic,
            qos = ?publish.qos,
            packet_id = packet_id.map(|id| id.get()),
            payload = %String::from_utf8_lossy(&publish.payload),
            "Message received"
        );
    })
}

/// Logs connection state changes until the session is dropped.
pub fn watch_state(mut state_rx: watch::Receiver<ConnectionState>) {
    tokio::spawn(async move {
        while state_rx.changed().await.is_ok() {
            let state = state_rx.borrow_and_update().clone();
            match state {
                ConnectionState::Disconnected(_) => warn!(%state, "Connection state changed"),
                _ => info!(%state, "Connection state changed"),
            }
        }
    });
}

/// Establishes `session`, runs the exchange and always disconnects.
///
/// `shutdown` resolving ends the process loop early.
pub async fn run<T, C>(
    session: &mut Session<T, C>,
    demo: &DemoConfig,
    shutdown: impl Future<Output = ()>,
) -> Result<(), DemoError>
where
    T: Transport + 'static,
    C: Codec + 'static,
{
    let result = exchange(session, demo, shutdown).await;
    if let Err(e) = &result {
        error!(error = %e, "Demo run failed");
    }

    match session.disconnect().await {
        Ok(()) | Err(SessionError::NotConnected) => {}
        Err(e) => warn!(error = %e, "Disconnect failed"),
    }
    result
}

async fn exchange<T, C>(
    session: &mut Session<T, C>,
    demo: &DemoConfig,
    shutdown: impl Future<Output = ()>,
) -> Result<(), DemoError>
where
    T: Transport + 'static,
    C: Codec + 'static,
{
    let state = session.establish(Some(log_messages())).await?;
    info!(
        resumed = state.resumed,
        replayed = session.tracker().len(),
        "Session ready"
    );

    session.subscribe(&demo.topic).await?;
    info!(topic = %demo.topic, "Subscribed");

    let qos = demo.qos();
    for n in 1..=demo.messages {
        let packet_id = session
            .publish_confirmed(&demo.topic, demo.payload(n), qos)
            .await
            .map_err(|source| DemoError::Unconfirmed { n, source })?;
        match packet_id {
            Some(id) => debug!(n, packet_id = %id, "Publish confirmed"),
            None => debug!(n, "Publish sent"),
        }
    }
    info!(messages = demo.messages, ?qos, "Published");

    tokio::select! {
        result = session.run_loop(demo.run_time()) => result?,
        _ = shutdown => info!("Shutdown requested, stopping process loop"),
    }

    session.unsubscribe(&demo.topic).await?;
    info!(topic = %demo.topic, "Unsubscribed");
    Ok(())
}
