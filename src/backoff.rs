//! Restart backoff for supervised workers.
//!
//! Each restart doubles the previous delay, capped at `max_backoff`, with
//! up to `random_factor` of extra jitter so many supervisors that crashed
//! together do not restart in lockstep. A restart count inside a sliding
//! window bounds how often a child may crash before the supervisor gives
//! up and escalates.

use std::collections::VecDeque;
use std::time::Duration;

use rand::Rng;
use serde::Deserialize;
use tokio::time::Instant;

/// Tuning for [`ExponentialBackoff`].
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use twinfold::BackoffConfig;
///
/// let config = BackoffConfig {
///     min_backoff: Duration::from_millis(200),
///     ..BackoffConfig::default()
/// };
/// assert_eq!(config.max_backoff, Duration::from_secs(10));
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Delay before the first restart.
    ///
    /// Default: 1 second.
    pub min_backoff: Duration,

    /// Upper bound for the doubling delay, before jitter.
    ///
    /// Default: 10 seconds.
    pub max_backoff: Duration,

    /// Fraction of the delay added as random jitter, in `[0, 1]`.
    /// Values outside the range are clamped; NaN and infinities disable
    /// jitter.
    ///
    /// Default: 0.2.
    pub random_factor: f64,

    /// Restarts allowed inside `restart_window` before escalating.
    ///
    /// Default: 10.
    pub max_restarts: u32,

    /// Sliding window over which restarts are counted.
    ///
    /// Default: 60 seconds.
    pub restart_window: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            min_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(10),
            random_factor: 0.2,
            max_restarts: 10,
            restart_window: Duration::from_secs(60),
        }
    }
}

impl BackoffConfig {
    /// `random_factor` as actually applied: clamped to `[0, 1]`, and `0`
    /// when it is not a finite number.
    pub fn jitter_factor(&self) -> f64 {
        if self.random_factor.is_finite() {
            self.random_factor.clamp(0.0, 1.0)
        } else {
            0.0
        }
    }
}

/// What a supervisor should do after its child exited abnormally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    /// Restart the child after this delay.
    Restart(Duration),
    /// Too many restarts inside the window: give up and escalate.
    Escalate,
}

/// Exponential backoff with jitter and a restart budget.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    config: BackoffConfig,
    current: Duration,
    restarts: VecDeque<Instant>,
}

impl ExponentialBackoff {
    pub fn new(config: BackoffConfig) -> Self {
        if !config.random_factor.is_finite() {
            tracing::warn!(
                random_factor = config.random_factor,
                "backoff random_factor is not finite, jitter disabled"
            );
        }
        Self {
            current: config.min_backoff,
            config,
            restarts: VecDeque::new(),
        }
    }

    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }

    /// The un-jittered delay the next restart would use.
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Return the next delay and double the one after it.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.current = self.current.saturating_mul(2).min(self.config.max_backoff);
        self.jittered(base)
    }

    /// Back to `min_backoff`. Called once the child has served a request.
    pub fn reset(&mut self) {
        self.current = self.config.min_backoff;
    }

    /// Record a restart at `now` and decide whether it may go ahead.
    pub fn record_restart(&mut self, now: Instant) -> RestartDecision {
        let window = self.config.restart_window;
        while let Some(&oldest) = self.restarts.front() {
            if now.saturating_duration_since(oldest) > window {
                self.restarts.pop_front();
            } else {
                break;
            }
        }

        if self.restarts.len() >= self.config.max_restarts as usize {
            return RestartDecision::Escalate;
        }
        self.restarts.push_back(now);
        RestartDecision::Restart(self.next_delay())
    }

    /// Restarts counted inside the current window.
    pub fn restarts_in_window(&self) -> usize {
        self.restarts.len()
    }

    fn jittered(&self, base: Duration) -> Duration {
        let factor = self.config.jitter_factor();
        if factor == 0.0 {
            return base;
        }
        let jitter: f64 = rand::rng().random::<f64>() * factor;
        let extra = Duration::try_from_secs_f64(base.as_secs_f64() * jitter).unwrap_or(Duration::MAX);
        base.saturating_add(extra)
    }
}
