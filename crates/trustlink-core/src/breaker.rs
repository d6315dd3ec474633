//! Per-destination circuit breaker.
//!
//! ```text
//!   Closed --(N consecutive failures within window)--> Open
//!   Open   --(cooldown elapsed, next admission)------> HalfOpen (one trial)
//!   HalfOpen --trial succeeds--> Closed
//!   HalfOpen --trial fails-----> Open (cooldown restarts)
//! ```
//!
//! The breaker is a plain state machine. Callers pass the current instant,
//! which keeps it deterministic under test, and hold it behind the
//! destination's lock.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Breaker thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerConfig {
    /// Consecutive failures that open the breaker.
    pub failure_threshold: u32,
    /// How long the breaker stays open before a trial is allowed.
    pub cooldown: Duration,
    /// Failures further apart than this do not accumulate.
    pub failure_window: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
            failure_window: Duration::from_secs(60),
        }
    }
}

/// Externally visible breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// How a call was let through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Breaker closed; normal call.
    Normal,
    /// The single half-open trial.
    Trial,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    state: BreakerState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            state: BreakerState::Closed,
            consecutive_failures: 0,
            last_failure: None,
            opened_at: None,
            trial_in_flight: false,
        }
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn last_failure(&self) -> Option<Instant> {
        self.last_failure
    }

    /// Ask to make a call at `now`.
    ///
    /// Returns the admission kind, or the time left until a trial becomes
    /// possible when the call must be refused.
    pub fn try_admit(&mut self, now: Instant) -> Result<Admission, Duration> {
        match self.state {
            BreakerState::Closed => Ok(Admission::Normal),
            BreakerState::Open => {
                let opened_at = self.opened_at.unwrap_or(now);
                let elapsed = now.saturating_duration_since(opened_at);
                if elapsed >= self.config.cooldown {
                    self.state = BreakerState::HalfOpen;
                    self.trial_in_flight = true;
                    Ok(Admission::Trial)
                } else {
                    Err(self.config.cooldown - elapsed)
                }
            }
            BreakerState::HalfOpen => {
                if self.trial_in_flight {
                    Err(Duration::ZERO)
                } else {
                    self.trial_in_flight = true;
                    Ok(Admission::Trial)
                }
            }
        }
    }

    /// Record a successful exchange made under `admission`.
    pub fn on_success(&mut self, admission: Admission) {
        match (self.state, admission) {
            (BreakerState::Closed, _) | (BreakerState::HalfOpen, Admission::Trial) => {
                self.close();
            }
            // A straggler admitted before the breaker opened proves nothing
            // about the current window.
            _ => {}
        }
    }

    /// Record a transport failure made under `admission` at `now`.
    pub fn on_failure(&mut self, admission: Admission, now: Instant) {
        match (self.state, admission) {
            (BreakerState::HalfOpen, Admission::Trial) => self.open(now),
            (BreakerState::Closed, _) => {
                if let Some(last) = self.last_failure {
                    if now.saturating_duration_since(last) > self.config.failure_window {
                        self.consecutive_failures = 0;
                    }
                }
                self.consecutive_failures += 1;
                self.last_failure = Some(now);
                if self.consecutive_failures >= self.config.failure_threshold {
                    self.open(now);
                }
            }
            _ => {
                self.last_failure = Some(now);
            }
        }
    }

    /// Give back an unused trial slot (the trial never reached the peer).
    pub fn release_trial(&mut self) {
        if self.state == BreakerState::HalfOpen {
            self.trial_in_flight = false;
        }
    }

    /// True when nothing about this breaker is worth remembering.
    pub fn is_pristine(&self) -> bool {
        self.state == BreakerState::Closed && self.consecutive_failures == 0
    }

    fn open(&mut self, now: Instant) {
        self.state = BreakerState::Open;
        self.opened_at = Some(now);
        self.last_failure = Some(now);
        self.trial_in_flight = false;
    }

    fn close(&mut self) {
        self.state = BreakerState::Closed;
        self.consecutive_failures = 0;
        self.last_failure = None;
        self.opened_at = None;
        self.trial_in_flight = false;
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
