//! Retry and quarantine policy for failed deliveries.
//!
//! The crawler consults this policy after a dispatch cycle in which at
//! least one handler failed. The policy cannot tell a transient failure
//! (provider 5xx) from a permanent one (payload the handler will never
//! accept); quarantine-after-N-attempts bounds the cost either way.
//!
//! # Example
//!
//! ```rust
//! use courier_crawler::retry::RetryPolicy;
//! use std::time::Duration;
//!
//! let policy = RetryPolicy::builder()
//!     .max_attempts(5)
//!     .initial_delay(Duration::from_secs(2))
//!     .max_delay(Duration::from_secs(600))
//!     .multiplier(2.0)
//!     .build();
//!
//! assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
//! assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(8));
//! ```

use chrono::{DateTime, Utc};
use courier_core::event::OutboxEvent;
use std::time::Duration;

/// What to do with an event whose dispatch cycle left failures behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry: the event becomes due again at this instant.
    RetryAt(DateTime<Utc>),
    /// Give up: move the event to the terminal quarantined state and alert
    /// an operator.
    Quarantine,
}

/// Exponential backoff with a ceiling and a bounded attempt budget.
///
/// # Default values
///
/// - `max_attempts`: 3
/// - `initial_delay`: 1 second
/// - `max_delay`: 1 hour
/// - `multiplier`: 2.0 (delay doubles each attempt)
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts after which a still-failing event is quarantined.
    pub max_attempts: u32,
    /// Delay after the first failed attempt.
    pub initial_delay: Duration,
    /// Ceiling for the exponential backoff.
    pub max_delay: Duration,
    /// Multiplier applied per additional attempt.
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(3600),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Create a new policy builder.
    #[must_use]
    pub const fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder {
            max_attempts: None,
            initial_delay: None,
            max_delay: None,
            multiplier: None,
        }
    }

    /// Backoff delay following the `attempt`-th failure (1-based).
    ///
    /// Uses exponential backoff: `initial_delay * multiplier ^ (attempt - 1)`,
    /// capped at `max_delay`.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return self.initial_delay.min(self.max_delay);
        }

        #[allow(clippy::cast_possible_wrap)]
        let exponent = attempt.saturating_sub(1) as i32;
        #[allow(clippy::cast_precision_loss)]
        let delay_ms = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent);

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let delay = Duration::from_millis(delay_ms as u64);

        delay.min(self.max_delay)
    }

    /// Decide the fate of `event` after a cycle with failures.
    ///
    /// The attempt count is derived from the event's publication log: the
    /// highest failure count among handlers that have not yet succeeded in
    /// the current attempt cycle. At `max_attempts` the event is
    /// quarantined; below it, the next attempt is scheduled at
    /// `now + delay_for_attempt(attempts)`.
    #[must_use]
    pub fn decide(&self, event: &OutboxEvent, now: DateTime<Utc>) -> RetryDecision {
        let attempts = event.failing_attempt_count();
        if attempts >= self.max_attempts {
            RetryDecision::Quarantine
        } else {
            RetryDecision::RetryAt(now + self.delay_for_attempt(attempts))
        }
    }
}

/// Builder for [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryPolicyBuilder {
    max_attempts: Option<u32>,
    initial_delay: Option<Duration>,
    max_delay: Option<Duration>,
    multiplier: Option<f64>,
}

impl RetryPolicyBuilder {
    /// Set the attempt budget before quarantine.
    #[must_use]
    pub const fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Set the delay after the first failed attempt.
    #[must_use]
    pub const fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = Some(delay);
        self
    }

    /// Set the backoff ceiling.
    #[must_use]
    pub const fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = Some(delay);
        self
    }

    /// Set the backoff multiplier.
    #[must_use]
    pub const fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = Some(multiplier);
        self
    }

    /// Build the [`RetryPolicy`], filling unset fields with defaults.
    #[must_use]
    pub fn build(self) -> RetryPolicy {
        let defaults = RetryPolicy::default();
        RetryPolicy {
            max_attempts: self.max_attempts.unwrap_or(defaults.max_attempts),
            initial_delay: self.initial_delay.unwrap_or(defaults.initial_delay),
            max_delay: self.max_delay.unwrap_or(defaults.max_delay),
            multiplier: self.multiplier.unwrap_or(defaults.multiplier),
        }
    }
}
