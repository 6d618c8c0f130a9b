//! Connection and session state.
//!
//! [`ConnectionState`] is what observers see through the watch channel returned
//! by [`Session::subscribe_state`](crate::Session::subscribe_state).
//! [`SessionState`] is the session's own bookkeeping: whether an MQTT session
//! is established and whether the broker resumed a previous one.
//!
//! # Examples
//!
//! ```ignore
//! use relaybee_mqtt_session::ConnectionState;
//!
//! let state = ConnectionState::Reconnecting(1.5);
//! println!("Status: {}", state);  // "Reconnecting (in 1.5 seconds)"
//! ```

use std::fmt;

use tokio::sync::watch;

/// Observable lifecycle of the broker connection.
///
/// - `Connecting` -> `Connected` once CONNACK is accepted
/// - `Connecting` -> `Reconnecting` -> `Connecting` while the backoff has attempts left
/// - any state -> `Disconnected` on exhaustion, fatal error or explicit disconnect
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// Transport connect or CONNECT/CONNACK handshake in progress.
    Connecting,

    /// MQTT session established.
    ///
    /// `resumed` is the broker's session-present flag.
    Connected { resumed: bool },

    /// Connection closed. Carries the reason.
    Disconnected(String),

    /// Sleeping before the next transport attempt. Carries the delay in seconds.
    Reconnecting(f64),
}

impl ConnectionState {
    /// Short identifier for logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Connected { .. } => "Connected",
            ConnectionState::Disconnected(_) => "Disconnected",
            ConnectionState::Reconnecting(_) => "Reconnecting",
        }
    }

    /// Context for the state, empty when there is none.
    pub fn details(&self) -> String {
        match self {
            ConnectionState::Connecting => String::new(),
            ConnectionState::Connected { resumed: true } => "session resumed".to_string(),
            ConnectionState::Connected { resumed: false } => String::new(),
            ConnectionState::Disconnected(reason) => reason.clone(),
            ConnectionState::Reconnecting(seconds) => format!("in {seconds} seconds"),
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected { .. })
    }

    pub fn is_connecting(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Reconnecting(_)
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())?;
        let details = self.details();
        if !details.is_empty() {
            write!(f, " ({details})")?;
        }
        Ok(())
    }
}

/// Session bookkeeping owned by [`Session`](crate::Session).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionState {
    /// CONNACK accepted and no DISCONNECT sent since.
    pub established: bool,

    /// Broker reported session-present on the last CONNACK.
    pub resumed: bool,
}

/// Stores `state` in the watch channel, notifying receivers only on change.
///
/// The value is updated even when no receiver is alive, so late subscribers
/// still observe the current state.
pub(crate) fn update_state(state_tx: &watch::Sender<ConnectionState>, state: ConnectionState) {
    state_tx.send_if_modified(|current| {
        if *current == state {
            false
        } else {
            tracing::debug!(from = %current, to = %state, "Connection state changed");
            *current = state;
            true
        }
    });
}
