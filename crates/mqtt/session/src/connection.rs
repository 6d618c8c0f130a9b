//! Bounded transport (re)connection.
//!
//! [`ConnectionManager`] repeatedly asks the [`Transport`] to connect, sleeping
//! a jittered backoff delay between failures, until either a connection is
//! made or the backoff is exhausted. Every failed attempt closes the
//! transport first so no half-open socket survives into the next attempt.
//!
//! Progress is published on the session's [`ConnectionState`] watch channel:
//!
//! ```text
//! Connecting -> Reconnecting(0.42) -> Connecting -> ... -> (caller) Connected
//!                                                    \-> Disconnected(reason)
//! ```

use rand::RngCore;
use tokio::sync::watch;
use tracing::{error, info, instrument, warn};

use crate::{
    backoff::{Backoff, ProcessRng},
    error::SessionError,
    state::{update_state, ConnectionState},
    transport::{Credentials, ServerInfo, Transport},
};

/// Outcome of a successful [`ConnectionManager::connect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Connected {
    /// Transport connect calls made, including the successful one.
    pub attempts: u32,
}

/// Drives transport connection attempts through a [`Backoff`].
#[derive(Debug)]
pub struct ConnectionManager<R = ProcessRng> {
    backoff: Backoff<R>,
}

impl<R: RngCore + Send> ConnectionManager<R> {
    pub fn new(backoff: Backoff<R>) -> Self {
        Self { backoff }
    }

    pub fn backoff(&self) -> &Backoff<R> {
        &self.backoff
    }

    /// Connects `transport` to `server`, retrying with backoff.
    ///
    /// Returns as soon as one attempt succeeds; no backoff delay is consumed
    /// after a success. The backoff is reset on both success and exhaustion so
    /// the next call starts a fresh schedule.
    ///
    /// # Errors
    /// `RetriesExhausted` once the backoff gives up. The last transport error
    /// is logged, not returned.
    #[instrument(skip_all, fields(server = %server))]
    pub async fn connect<T>(
        &mut self,
        transport: &mut T,
        server: &ServerInfo,
        credentials: &Credentials,
        state_tx: &watch::Sender<ConnectionState>,
    ) -> Result<Connected, SessionError>
    where
        T: Transport + ?Sized,
    {
        let mut attempts = 0u32;

        loop {
            attempts = attempts.saturating_add(1);
            update_state(state_tx, ConnectionState::Connecting);

            let err = match transport.connect(server, credentials).await {
                Ok(()) => {
                    self.backoff.reset();
                    info!(attempts, "Transport connected");
                    return Ok(Connected { attempts });
                }
                Err(err) => err,
            };

            transport.disconnect().await;

            match self.backoff.next_delay() {
                Ok(delay) => {
                    warn!(
                        attempt = attempts,
                        error = %root_cause(&err),
                        "Connection to broker failed. Retrying in {:.3} seconds",
                        delay.as_secs_f64()
                    );
                    update_state(state_tx, ConnectionState::Reconnecting(delay.as_secs_f64()));
                    tokio::time::sleep(delay).await;
                }
                Err(exhausted) => {
                    error!(
                        attempts,
                        error = %root_cause(&err),
                        "Connection to broker failed, all retry attempts exhausted"
                    );
                    self.backoff.reset();
                    update_state(state_tx, ConnectionState::Disconnected(exhausted.to_string()));
                    return Err(SessionError::RetriesExhausted(exhausted));
                }
            }
        }
    }
}

impl Default for ConnectionManager<ProcessRng> {
    fn default() -> Self {
        Self::new(Backoff::default())
    }
}

/// Innermost message of an error chain, without surrounding quotes.
fn root_cause(e: &(dyn std::error::Error + 'static)) -> String {
    let mut current = e;
    while let Some(source) = current.source() {
        current = source;
    }
    current.to_string().trim_matches('"').to_string()
}
