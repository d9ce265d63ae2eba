//! Reconnect Supervisor
//!
//! Bounded retry with exponential backoff after an unsolicited tunnel drop.
//!
//! # Policy
//!
//! ```text
//! delay(n) = min(base * factor^(n-1), max_delay) + U(0, jitter * that)
//! ```
//!
//! With the defaults (5 attempts, 1s base, factor 2, 30s cap, 20% jitter)
//! the un-jittered schedule is 1s, 2s, 4s, 8s, 16s.
//!
//! The supervisor is owned by the session task and only ever touched from
//! it. It schedules at most one retry timer at a time; the timer delivers a
//! caller-supplied message when it fires and is cancelled when the
//! supervisor is reset or dropped.

use crate::config::duration_ms;
use crate::session::RetryProgress;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

/// Backoff parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries allowed after a drop before giving up
    pub max_attempts: u32,
    #[serde(rename = "base_delay_ms", with = "duration_ms")]
    pub base_delay: Duration,
    pub factor: f64,
    #[serde(rename = "max_delay_ms", with = "duration_ms")]
    pub max_delay: Duration,
    /// Extra random delay as a fraction of the computed delay (0.0-1.0)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            factor: 2.0,
            max_delay: Duration::from_secs(30),
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Policy without jitter, for predictable schedules
    pub fn fixed(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            jitter: 0.0,
            ..Self::default()
        }
    }

    /// Un-jittered delay before 1-based `attempt`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.base_delay.as_secs_f64() * self.factor.powi(exponent);
        let cap = self.max_delay.as_secs_f64();

        if !secs.is_finite() || secs >= cap {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs.max(0.0))
        }
    }

    /// Delay before `attempt` with up to `jitter` extra on top
    pub fn jittered_delay(&self, attempt: u32, rng: &mut impl Rng) -> Duration {
        let base = self.delay_for(attempt);
        // Also rejects NaN, which `gen_range` would panic on
        if !(self.jitter > 0.0) {
            return base;
        }
        let fraction = rng.gen_range(0.0..=self.jitter.min(1.0));
        base + base.mul_f64(fraction)
    }
}

/// Bookkeeping since the last successful connection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryState {
    pub attempt: u32,
    pub next_delay: Duration,
    pub last_failure_at: Option<SystemTime>,
}

/// Where a transport failure happened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOrigin {
    /// First open requested by the user; surfaced, never retried
    Connecting,
    /// Established tunnel dropped
    Lost,
    /// A supervisor-issued retry failed
    Retry,
}

/// What the supervisor decided to do about a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    NotRetried,
    Scheduled(RetryProgress),
    Exhausted { attempts: u32 },
}

/// Retry scheduler
pub struct ReconnectSupervisor {
    policy: RetryPolicy,
    state: RetryState,
    rng: StdRng,
    pending: Option<(RetryProgress, DropGuard)>,
}

impl ReconnectSupervisor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            state: RetryState::default(),
            rng: StdRng::from_entropy(),
            pending: None,
        }
    }

    /// Deterministic jitter
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn state(&self) -> &RetryState {
        &self.state
    }

    /// Progress of the scheduled (or running) retry, if any
    pub fn progress(&self) -> Option<RetryProgress> {
        self.pending.as_ref().map(|(progress, _)| *progress)
    }

    /// React to a transport failure.
    ///
    /// For retryable failures, either schedules a timer that sends `due`
    /// on `tx` after the backoff delay, or reports exhaustion and resets.
    pub fn on_failure<T: Send + 'static>(
        &mut self,
        origin: FailureOrigin,
        tx: &mpsc::UnboundedSender<T>,
        due: T,
    ) -> RetryDecision {
        if origin == FailureOrigin::Connecting {
            debug!("Initial connect failure, not retrying");
            return RetryDecision::NotRetried;
        }

        self.pending = None;
        self.state.last_failure_at = Some(SystemTime::now());

        if self.state.attempt >= self.policy.max_attempts {
            let attempts = self.state.attempt;
            warn!("Reconnect attempts exhausted ({})", attempts);
            self.reset();
            return RetryDecision::Exhausted { attempts };
        }

        self.state.attempt += 1;
        let delay = self.policy.jittered_delay(self.state.attempt, &mut self.rng);
        self.state.next_delay = delay;

        let progress = RetryProgress {
            attempt: self.state.attempt,
            max_attempts: self.policy.max_attempts,
            next_delay: delay,
        };

        info!(
            "Reconnect attempt {}/{} in {:?}",
            progress.attempt, progress.max_attempts, delay
        );

        let token = CancellationToken::new();
        let cancelled = token.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = cancelled.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = tx.send(due);
                }
            }
        });

        self.pending = Some((progress, token.drop_guard()));
        RetryDecision::Scheduled(progress)
    }

    /// Session reached `Connected`
    pub fn on_connected(&mut self) {
        if self.state.attempt > 0 {
            info!("Reconnected after {} attempt(s)", self.state.attempt);
        }
        self.reset();
    }

    /// Drop any pending retry and zero the counters
    pub fn reset(&mut self) {
        if self.pending.take().is_some() {
            debug!("Pending reconnect cancelled");
        }
        self.state = RetryState::default();
    }
}
