//! Exponential backoff with full jitter for connection retry logic.
//!
//! When a broker connection fails the client waits before trying again. The
//! wait is drawn uniformly from `[0, ceiling]`, where the ceiling doubles on
//! every attempt until it reaches a cap:
//!
//! ```text
//! ceiling[n] = min(base * 2^n, cap)
//! delay[n]   = uniform(0 ..= ceiling[n])
//! ```
//!
//! With the defaults (base 500 ms, cap 5 s, 5 attempts) the ceilings are
//! 500, 1000, 2000, 4000 and 5000 ms, after which the backoff is exhausted.
//!
//! Randomising the whole interval spreads reconnecting clients apart so a
//! recovering broker is not hit by all of them at the same instant.
//!
//! # Examples
//!
//! ```ignore
//! use std::time::Duration;
//! use relaybee_mqtt_session::Backoff;
//!
//! let mut backoff = Backoff::default();
//!
//! while let Ok(delay) = backoff.next_delay() {
//!     tokio::time::sleep(delay).await;
//!     // try again
//! }
//! ```

use std::{
    sync::{Mutex, OnceLock},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use rand::{rngs::StdRng, Rng, RngCore, SeedableRng};
use thiserror::Error;

/// Error returned once the retry budget is spent.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackoffError {
    /// No attempts remain. The field carries the configured limit.
    #[error("Retries exhausted after {0} attempts")]
    Exhausted(u32),
}

static PROCESS_RNG: OnceLock<Mutex<StdRng>> = OnceLock::new();

fn with_process_rng<T>(f: impl FnOnce(&mut StdRng) -> T) -> T {
    let rng = PROCESS_RNG.get_or_init(|| {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_nanos() as u64)
            .unwrap_or_default();
        Mutex::new(StdRng::seed_from_u64(seed))
    });
    let mut guard = rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    f(&mut guard)
}

/// Process-wide random source used for jitter.
///
/// The underlying generator is seeded exactly once, from the nanosecond part
/// of the wall clock, the first time any backoff draws from it. Every
/// [`Backoff`] built with [`Backoff::new`] shares it.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRng;

impl RngCore for ProcessRng {
    fn next_u32(&mut self) -> u32 {
        with_process_rng(|rng| rng.next_u32())
    }

    fn next_u64(&mut self) -> u64 {
        with_process_rng(|rng| rng.next_u64())
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        with_process_rng(|rng| rng.fill_bytes(dest))
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
        self.fill_bytes(dest);
        Ok(())
    }
}

/// Jittered exponential backoff controller.
///
/// Each call to [`next_delay`](Self::next_delay) consumes one attempt. Call
/// [`reset`](Self::reset) after a successful connection so the next outage
/// starts again from the base delay.
///
/// The random source is a type parameter so tests can inject a seeded
/// generator and get reproducible delays.
#[derive(Debug, Clone)]
pub struct Backoff<R = ProcessRng> {
    /// Ceiling for the first retry.
    base: Duration,

    /// Upper bound for every ceiling.
    cap: Duration,

    /// Maximum number of delays handed out. `0` retries forever.
    max_attempts: u32,

    /// Attempts consumed so far.
    attempt: u32,

    rng: R,
}

impl Backoff<ProcessRng> {
    /// Creates a backoff drawing jitter from the shared process generator.
    ///
    /// # Arguments
    /// - `base`: ceiling for the first retry
    /// - `cap`: largest ceiling ever used
    /// - `max_attempts`: number of delays before exhaustion, `0` for unbounded
    pub fn new(base: Duration, cap: Duration, max_attempts: u32) -> Self {
        Self::with_rng(base, cap, max_attempts, ProcessRng)
    }
}

impl<R: RngCore> Backoff<R> {
    /// Creates a backoff with an explicit random source.
    pub fn with_rng(base: Duration, cap: Duration, max_attempts: u32, rng: R) -> Self {
        Self {
            base,
            cap,
            max_attempts,
            attempt: 0,
            rng,
        }
    }

    /// Ceiling the next call to [`next_delay`](Self::next_delay) will draw under.
    ///
    /// Doubling saturates at the cap instead of overflowing, no matter how
    /// many attempts have been consumed.
    pub fn candidate_ceiling(&self) -> Duration {
        let factor = 1u32.checked_shl(self.attempt).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .map_or(self.cap, |ceiling| ceiling.min(self.cap))
    }

    /// Returns the next jittered delay and advances the attempt counter.
    ///
    /// # Returns
    /// - `Ok(Duration)`: a delay in `[0, candidate_ceiling()]`
    /// - `Err(BackoffError::Exhausted)`: once `max_attempts` delays were handed out
    pub fn next_delay(&mut self) -> Result<Duration, BackoffError> {
        if self.is_exhausted() {
            return Err(BackoffError::Exhausted(self.max_attempts));
        }

        let ceiling_ms = u64::try_from(self.candidate_ceiling().as_millis()).unwrap_or(u64::MAX);
        let delay = Duration::from_millis(self.rng.gen_range(0..=ceiling_ms));
        self.attempt = self.attempt.saturating_add(1);

        Ok(delay)
    }

    /// Returns `true` when no further delays will be handed out.
    pub fn is_exhausted(&self) -> bool {
        self.max_attempts != 0 && self.attempt >= self.max_attempts
    }

    /// Starts the schedule over from the base delay.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Attempts consumed since creation or the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Configured attempt limit, `0` meaning unbounded.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn cap(&self) -> Duration {
        self.cap
    }
}

impl Default for Backoff<ProcessRng> {
    /// Base 500 ms, cap 5 s, five attempts.
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_millis(5000), 5)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded(max_attempts: u32) -> Backoff<StdRng> {
        Backoff::with_rng(
            Duration::from_millis(500),
            Duration::from_millis(5000),
            max_attempts,
            StdRng::seed_from_u64(7),
        )
    }

    #[test]
    fn test_backoff_default_creation() {
        let backoff = Backoff::default();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.base(), Duration::from_millis(500));
        assert_eq!(backoff.cap(), Duration::from_millis(5000));
        assert_eq!(backoff.max_attempts(), 5);
    }

    #[test]
    fn test_backoff_ceiling_progression_then_exhausted() {
        let mut backoff = seeded(5);
        let expected = [500, 1000, 2000, 4000, 5000];

        for ceiling_ms in expected {
            assert_eq!(backoff.candidate_ceiling(), Duration::from_millis(ceiling_ms));
            let delay = backoff.next_delay().unwrap();
            assert!(delay <= Duration::from_millis(ceiling_ms));
        }

        assert_eq!(backoff.next_delay(), Err(BackoffError::Exhausted(5)));
        assert_eq!(backoff.next_delay(), Err(BackoffError::Exhausted(5)));
        assert_eq!(backoff.attempt(), 5);
    }

    #[test]
    fn test_backoff_reset() {
        let mut backoff = seeded(5);
        backoff.next_delay().unwrap();
        backoff.next_delay().unwrap();
        assert_eq!(backoff.candidate_ceiling(), Duration::from_millis(2000));

        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.candidate_ceiling(), Duration::from_millis(500));
    }

    #[test]
    fn test_backoff_zero_attempts_retries_forever() {
        let mut backoff = seeded(0);
        for _ in 0..100 {
            let delay = backoff.next_delay().unwrap();
            assert!(delay <= Duration::from_millis(5000));
        }
        assert!(!backoff.is_exhausted());
        assert_eq!(backoff.candidate_ceiling(), Duration::from_millis(5000));
    }

    #[test]
    fn test_backoff_ceiling_saturates_at_cap() {
        let mut backoff = Backoff::with_rng(
            Duration::from_secs(u64::MAX / 4),
            Duration::from_secs(10),
            0,
            StdRng::seed_from_u64(1),
        );
        assert_eq!(backoff.candidate_ceiling(), Duration::from_secs(10));
        for _ in 0..40 {
            backoff.next_delay().unwrap();
        }
        assert_eq!(backoff.candidate_ceiling(), Duration::from_secs(10));
    }

    #[test]
    fn test_backoff_same_seed_same_delays() {
        let mut a = seeded(5);
        let mut b = seeded(5);
        for _ in 0..5 {
            assert_eq!(a.next_delay(), b.next_delay());
        }
    }

    #[test]
    fn test_process_rng_draws_within_ceiling() {
        let mut backoff = Backoff::new(Duration::from_millis(10), Duration::from_millis(20), 3);
        for _ in 0..3 {
            assert!(backoff.next_delay().unwrap() <= Duration::from_millis(20));
        }
        assert!(backoff.is_exhausted());
    }
}
