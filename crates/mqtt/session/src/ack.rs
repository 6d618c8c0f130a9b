//! Waiting for the acknowledgement of one specific request.
//!
//! Each wait owns an [`AckWaitContext`], so there is no shared "last acked id"
//! that two waits could race on. The wait drives the process loop through a
//! [`StepDriver`] until the expected [`Acknowledgement`] is observed, the
//! deadline passes, or a step fails with a non-transient error.
//!
//! An acknowledgement is identified by its kind and its packet identifier
//! together: a PUBACK for id 7 never completes a wait for the SUBACK of id 7.

use std::{fmt, time::Duration};

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, error, trace, warn};

use crate::{
    error::{AckKind, SessionError},
    packet_id::PacketId,
};

/// One acknowledgement received from the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Acknowledgement {
    pub kind: AckKind,
    pub packet_id: PacketId,
}

impl Acknowledgement {
    pub fn new(kind: AckKind, packet_id: PacketId) -> Self {
        Self { kind, packet_id }
    }
}

impl fmt::Display for Acknowledgement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.packet_id)
    }
}

/// State of one in-progress wait.
#[derive(Debug, Clone)]
pub struct AckWaitContext {
    expected: Acknowledgement,
    deadline: Instant,
    observed: bool,
}

impl AckWaitContext {
    pub fn new(expected: Acknowledgement, timeout: Duration) -> Self {
        Self {
            expected,
            deadline: Instant::now() + timeout,
            observed: false,
        }
    }

    pub fn expected(&self) -> Acknowledgement {
        self.expected
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn is_observed(&self) -> bool {
        self.observed
    }

    /// Time left before the deadline, zero once it has passed.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Reports a received acknowledgement.
    ///
    /// Only an exact match of kind and identifier satisfies the wait. Returns
    /// whether it matched.
    pub fn observe(&mut self, ack: Acknowledgement) -> bool {
        if ack == self.expected {
            self.observed = true;
            return true;
        }
        warn!(
            received = %ack,
            expected = %self.expected,
            "Acknowledgement does not match the awaited request"
        );
        false
    }
}

/// Something that can run one bounded process-loop iteration.
#[async_trait]
pub trait StepDriver: Send {
    /// Runs at most `budget` of receive work, reporting every acknowledgement
    /// to `wait`.
    async fn step_once(
        &mut self,
        budget: Duration,
        wait: &mut AckWaitContext,
    ) -> Result<(), SessionError>;
}

/// Correlates acknowledgements with the request that is waiting for them.
#[derive(Debug, Clone, Copy)]
pub struct AckCorrelator {
    step_timeout: Duration,
}

impl AckCorrelator {
    /// # Arguments
    /// - `step_timeout`: upper bound on a single process-loop step
    pub fn new(step_timeout: Duration) -> Self {
        Self { step_timeout }
    }

    /// Drives `driver` until `expected` is acknowledged or `timeout` elapses.
    ///
    /// Transient step errors (partial packets, would-block) keep the loop
    /// going. Any other step error ends the wait and is returned as is.
    ///
    /// # Errors
    /// `Timeout` if the deadline passes first.
    pub async fn wait_for_ack<D>(
        &self,
        driver: &mut D,
        expected: Acknowledgement,
        timeout: Duration,
    ) -> Result<(), SessionError>
    where
        D: StepDriver + ?Sized,
    {
        let started = Instant::now();
        let mut wait = AckWaitContext::new(expected, timeout);

        loop {
            if wait.is_observed() {
                debug!(ack = %expected, elapsed = ?started.elapsed(), "Acknowledgement received");
                return Ok(());
            }

            let remaining = wait.remaining();
            if remaining.is_zero() {
                error!(ack = %expected, ?timeout, "Timed out waiting for acknowledgement");
                return Err(SessionError::Timeout {
                    packet_id: expected.packet_id,
                    waited: started.elapsed(),
                });
            }

            let budget = remaining.min(self.step_timeout);
            match driver.step_once(budget, &mut wait).await {
                Ok(()) => {}
                Err(e) if e.is_transient_step() => {
                    trace!(error = %e, "Transient step error while waiting for ack");
                }
                Err(e) => {
                    error!(ack = %expected, error = %e, "Process loop failed while waiting for ack");
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;
    use crate::codec::CodecError;

    enum Step {
        Acks(Vec<(AckKind, u16)>),
        Transient,
        Fatal,
    }

    #[derive(Default)]
    struct ScriptedDriver {
        script: VecDeque<Step>,
        steps: usize,
    }

    impl ScriptedDriver {
        fn new(script: Vec<Step>) -> Self {
            Self {
                script: script.into(),
                steps: 0,
            }
        }
    }

    #[async_trait]
    impl StepDriver for ScriptedDriver {
        async fn step_once(
            &mut self,
            budget: Duration,
            wait: &mut AckWaitContext,
        ) -> Result<(), SessionError> {
            self.steps += 1;
            match self.script.pop_front() {
                Some(Step::Acks(ids)) => {
                    for (kind, id) in ids {
                        wait.observe(Acknowledgement::new(kind, PacketId::new(id).unwrap()));
                    }
                    Ok(())
                }
                Some(Step::Transient) => Err(SessionError::Codec(CodecError::NeedMoreBytes)),
                Some(Step::Fatal) => Err(SessionError::Codec(CodecError::Closed)),
                None => {
                    tokio::time::sleep(budget).await;
                    Ok(())
                }
            }
        }
    }

    fn id(value: u16) -> PacketId {
        PacketId::new(value).unwrap()
    }

    fn suback(value: u16) -> Acknowledgement {
        Acknowledgement::new(AckKind::SubAck, id(value))
    }

    #[tokio::test(start_paused = true)]
    async fn test_exact_ack_completes_wait() {
        let correlator = AckCorrelator::new(Duration::from_millis(100));
        let mut driver = ScriptedDriver::new(vec![Step::Acks(vec![(AckKind::SubAck, 5)])]);
        correlator
            .wait_for_ack(&mut driver, suback(5), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(driver.steps, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mismatched_ack_does_not_satisfy() {
        let correlator = AckCorrelator::new(Duration::from_millis(100));
        let mut driver = ScriptedDriver::new(vec![Step::Acks(vec![
            (AckKind::SubAck, 4),
            (AckKind::SubAck, 6),
        ])]);
        let err = correlator
            .wait_for_ack(&mut driver, suback(5), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Timeout { packet_id, .. } if packet_id == id(5)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_among_others_completes_wait() {
        let correlator = AckCorrelator::new(Duration::from_millis(100));
        let mut driver = ScriptedDriver::new(vec![
            Step::Acks(vec![(AckKind::SubAck, 4)]),
            Step::Acks(vec![(AckKind::PubAck, 6), (AckKind::SubAck, 5)]),
        ]);
        correlator
            .wait_for_ack(&mut driver, suback(5), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(driver.steps, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_keep_waiting() {
        let correlator = AckCorrelator::new(Duration::from_millis(100));
        let mut driver = ScriptedDriver::new(vec![
            Step::Transient,
            Step::Transient,
            Step::Acks(vec![(AckKind::SubAck, 5)]),
        ]);
        correlator
            .wait_for_ack(&mut driver, suback(5), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(driver.steps, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_error_ends_wait() {
        let correlator = AckCorrelator::new(Duration::from_millis(100));
        let mut driver = ScriptedDriver::new(vec![
            Step::Fatal,
            Step::Acks(vec![(AckKind::SubAck, 5)]),
        ]);
        let err = correlator
            .wait_for_ack(&mut driver, suback(5), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Codec(CodecError::Closed)));
        assert_eq!(driver.steps, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_respects_deadline() {
        let correlator = AckCorrelator::new(Duration::from_millis(300));
        let mut driver = ScriptedDriver::default();
        let started = Instant::now();
        let err = correlator
            .wait_for_ack(&mut driver, suback(1), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Timeout { .. }));
        assert!(started.elapsed() >= Duration::from_secs(1));
        // 300 + 300 + 300 + 100
        assert!(driver.steps >= 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_id_of_another_kind_does_not_satisfy() {
        let correlator = AckCorrelator::new(Duration::from_millis(100));
        let mut driver = ScriptedDriver::new(vec![Step::Acks(vec![
            (AckKind::PubAck, 5),
            (AckKind::UnsubAck, 5),
        ])]);
        let err = correlator
            .wait_for_ack(&mut driver, suback(5), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Timeout { packet_id, .. } if packet_id == id(5)));
    }

    #[tokio::test]
    async fn test_context_observe() {
        let expected = Acknowledgement::new(AckKind::PubComp, id(2));
        let mut wait = AckWaitContext::new(expected, Duration::from_secs(1));
        assert!(!wait.observe(Acknowledgement::new(AckKind::PubComp, id(3))));
        assert!(!wait.observe(Acknowledgement::new(AckKind::PubAck, id(2))));
        assert!(!wait.is_observed());
        assert!(wait.observe(expected));
        assert!(wait.is_observed());
    }
}
