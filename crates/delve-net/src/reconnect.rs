//! Connection attempts with exponential backoff.
//!
//! [`ReconnectState`] hands out the wait before each retry;
//! [`connect_with_backoff`] drives [`Transport::connect`] with it.

use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::transport::{ConnectError, Endpoint, Transport};

/// Retry schedule for the initial connection.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Wait after the first failure.
    pub initial_delay: Duration,
    /// Growth factor per failure.
    pub growth: f64,
    /// Ceiling on any single wait, jitter included.
    pub max_delay: Duration,
    /// Connect attempts in total, counting the first.
    pub max_attempts: u32,
    /// Each wait is scaled by a uniform factor in `1 ± jitter_ratio`.
    pub jitter_ratio: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            growth: 2.0,
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
            jitter_ratio: 0.25,
        }
    }
}

/// Counts failures and derives the next wait from that count.
#[derive(Debug, Clone)]
pub struct ReconnectState {
    config: ReconnectConfig,
    failures: u32,
}

impl ReconnectState {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            failures: 0,
        }
    }

    /// Unjittered wait after `failures` failures.
    fn base_delay(&self, failures: u32) -> Duration {
        let exp = i32::try_from(failures.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.config.initial_delay.as_secs_f64() * self.config.growth.powi(exp);
        if secs.is_finite() && secs < self.config.max_delay.as_secs_f64() {
            Duration::from_secs_f64(secs)
        } else {
            self.config.max_delay
        }
    }

    /// Record a failure and return the wait before the next try, or `None`
    /// once the retry budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.failures >= self.config.max_attempts {
            return None;
        }
        self.failures += 1;

        let base = self.base_delay(self.failures);
        let ratio = self.config.jitter_ratio.clamp(0.0, 1.0);
        let delay = if ratio > 0.0 {
            base.mul_f64(rand::rng().random_range(1.0 - ratio..=1.0 + ratio))
        } else {
            base
        };
        Some(delay.min(self.config.max_delay))
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }

    /// Failures recorded since construction or the last [`reset`](Self::reset).
    pub fn attempts(&self) -> u32 {
        self.failures
    }
}

/// Errors produced by [`connect_with_backoff`].
#[derive(Debug, thiserror::Error)]
pub enum ReconnectError {
    /// All configured attempts failed.
    #[error("gave up after {attempts} attempts: {last}")]
    MaxAttemptsExhausted {
        attempts: u32,
        /// Error of the final attempt.
        #[source]
        last: ConnectError,
    },
    /// The caller cancelled between or during attempts.
    #[error("reconnect cancelled")]
    Cancelled,
}

/// Connect `transport` to `endpoint`, retrying with backoff.
///
/// The first attempt is immediate; every failure waits for the next delay.
/// Returns the number of attempts it took.
pub async fn connect_with_backoff(
    transport: &Transport,
    endpoint: &Endpoint,
    connect_timeout: Duration,
    config: ReconnectConfig,
    cancel: &CancellationToken,
) -> Result<u32, ReconnectError> {
    let max_attempts = config.max_attempts.max(1);
    let mut state = ReconnectState::new(ReconnectConfig {
        max_attempts,
        ..config
    });
    let mut attempt = 0;

    loop {
        attempt += 1;
        let last = match transport.connect(endpoint, connect_timeout, cancel).await {
            Ok(()) => {
                if attempt > 1 {
                    tracing::info!(attempt, "reconnected");
                }
                return Ok(attempt);
            }
            Err(ConnectError::Cancelled) => return Err(ReconnectError::Cancelled),
            Err(ConnectError::AlreadyConnected) => return Ok(attempt),
            Err(e) => e,
        };

        let Some(delay) = state.next_delay().filter(|_| attempt < max_attempts) else {
            return Err(ReconnectError::MaxAttemptsExhausted {
                attempts: attempt,
                last,
            });
        };
        tracing::warn!(attempt, error = %last, ?delay, "connect failed, retrying");

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ReconnectError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
