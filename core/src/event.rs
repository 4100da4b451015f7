//! Event data model for the transactional outbox.
//!
//! An [`OutboxEvent`] is an immutable record of something that happened in
//! the business domain, plus a growing delivery log. The event itself
//! (`id`, `topic`, `payload`, `occurred_at`) never changes after creation;
//! only its delivery bookkeeping (`publications`, `status`, `retry_at`)
//! evolves as the crawler attempts to hand it to subscribed handlers.
//!
//! # Invariants
//!
//! - `publications` only grows. Past attempts are never rewritten; an
//!   operator replay stamps `last_requeued_at` instead of erasing history,
//!   and all attempt/success bookkeeping only counts publications strictly
//!   after that stamp.
//! - `status` follows `pending → published`, `pending → failed-retrying`,
//!   `failed-retrying → failed-retrying | published | quarantined`.
//!   `quarantined` is terminal until [`OutboxEvent::reset_for_replay`].
//! - `was_quarantined` is sticky for audit: once set it survives replays.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Unique identifier of an outbox event, assigned at creation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId(Uuid);

impl EventId {
    /// Wrap an existing UUID.
    #[must_use]
    pub const fn new(id: Uuid) -> Self {
        Self(id)
    }

    /// The underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// String tag identifying the kind of occurrence (e.g. `"ConventionSigned"`).
///
/// The topic selects which handlers run for an event. The set of emittable
/// topics is closed at startup when the
/// [`SubscriptionRegistry`](crate::registry::SubscriptionRegistry) is built.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Topic(String);

impl Topic {
    /// Create a topic from its string name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The topic name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Outcome of a single handler invocation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublicationOutcome {
    /// The handler completed without error.
    Success,
    /// The handler returned an error or timed out.
    Failure {
        /// Error detail recorded for triage.
        error: String,
    },
}

impl PublicationOutcome {
    /// Whether this outcome is a success.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// One recorded delivery attempt for one handler.
///
/// Publications are append-only: the crawler adds one entry per handler
/// invocation and never rewrites past entries.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Publication {
    /// Name of the handler that was invoked.
    pub handler_name: String,
    /// When the invocation happened (delivery time, not business time).
    pub attempted_at: DateTime<Utc>,
    /// What came of it.
    pub outcome: PublicationOutcome,
}

/// Delivery status of an outbox event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventStatus {
    /// Created, no delivery cycle has concluded yet.
    Pending,
    /// Every subscribed handler has succeeded at least once.
    Published,
    /// At least one handler failed and retries remain.
    FailedRetrying,
    /// Retry budget exhausted; terminal until an operator replay.
    Quarantined,
}

/// Error returned when parsing an unknown status string.
#[derive(Debug, Error)]
#[error("invalid event status: {0}")]
pub struct InvalidStatus(pub String);

impl EventStatus {
    /// Convert status to its storage string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Published => "published",
            Self::FailedRetrying => "failed-retrying",
            Self::Quarantined => "quarantined",
        }
    }

    /// Parse a status from its storage string.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidStatus`] if the string doesn't match a known status.
    pub fn parse(s: &str) -> Result<Self, InvalidStatus> {
        match s {
            "pending" => Ok(Self::Pending),
            "published" => Ok(Self::Published),
            "failed-retrying" => Ok(Self::FailedRetrying),
            "quarantined" => Ok(Self::Quarantined),
            _ => Err(InvalidStatus(s.to_string())),
        }
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A domain event recorded in the outbox, with its delivery log.
///
/// Created exactly once, inside the same transaction as the business
/// mutation it describes. Terminates (published or quarantined) solely
/// through crawler activity or manual operator replay; never deleted by
/// the core.
#[derive(Clone, Debug)]
pub struct OutboxEvent {
    /// Unique identifier, immutable after creation.
    pub id: EventId,
    /// Selects which handlers run.
    pub topic: Topic,
    /// Topic-specific data needed by handlers; opaque to the crawler.
    pub payload: serde_json::Value,
    /// Timestamp of the business fact (not of any delivery attempt).
    pub occurred_at: DateTime<Utc>,
    /// Append-only log of delivery attempts.
    pub publications: Vec<Publication>,
    /// Current delivery status.
    pub status: EventStatus,
    /// Sticky audit flag: set when the event is first quarantined and
    /// retained even after a successful replay.
    pub was_quarantined: bool,
    /// Next time this event is eligible for a retry; `None` means due now.
    pub retry_at: Option<DateTime<Utc>>,
    /// Stamp of the most recent operator replay. Attempt and success
    /// bookkeeping only counts publications strictly after this instant.
    pub last_requeued_at: Option<DateTime<Utc>>,
    /// Optimistic concurrency token, bumped by the store on every save.
    pub version: u64,
}

impl OutboxEvent {
    /// Create a fresh, pending event.
    #[must_use]
    pub const fn new(
        id: EventId,
        topic: Topic,
        payload: serde_json::Value,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            topic,
            payload,
            occurred_at,
            publications: Vec::new(),
            status: EventStatus::Pending,
            was_quarantined: false,
            retry_at: None,
            last_requeued_at: None,
            version: 0,
        }
    }

    /// Publications belonging to the current attempt cycle.
    ///
    /// After an operator replay, earlier publications remain on record for
    /// audit but no longer count towards attempt or success bookkeeping.
    /// The boundary is strict: an attempt stamped at exactly the replay
    /// instant belongs to the previous cycle.
    fn current_cycle(&self) -> impl Iterator<Item = &Publication> {
        let since = self.last_requeued_at;
        self.publications
            .iter()
            .filter(move |p| since.is_none_or(|s| p.attempted_at > s))
    }

    /// Whether the named handler has a recorded success in the current
    /// attempt cycle. A handler that already succeeded is never re-invoked
    /// on a later retry of this event.
    #[must_use]
    pub fn handler_succeeded(&self, handler_name: &str) -> bool {
        self.current_cycle()
            .any(|p| p.handler_name == handler_name && p.outcome.is_success())
    }

    /// Number of recorded failures for the named handler in the current
    /// attempt cycle.
    #[must_use]
    pub fn failure_count(&self, handler_name: &str) -> u32 {
        let count = self
            .current_cycle()
            .filter(|p| p.handler_name == handler_name && !p.outcome.is_success())
            .count();
        u32::try_from(count).unwrap_or(u32::MAX)
    }

    /// The attempt count that drives the retry/quarantine decision: the
    /// highest failure count among handlers that have not yet succeeded.
    #[must_use]
    pub fn failing_attempt_count(&self) -> u32 {
        self.current_cycle()
            .filter(|p| !p.outcome.is_success())
            .map(|p| p.handler_name.as_str())
            .filter(|name| !self.handler_succeeded(name))
            .map(|name| self.failure_count(name))
            .max()
            .unwrap_or(0)
    }

    /// Append a delivery attempt to the publication log.
    pub fn record_publication(&mut self, publication: Publication) {
        self.publications.push(publication);
    }

    /// Mark the event fully delivered: every subscribed handler succeeded.
    pub const fn mark_published(&mut self) {
        self.status = EventStatus::Published;
        self.retry_at = None;
    }

    /// Mark the event failed with retries remaining, due again at `retry_at`.
    pub const fn mark_failed_retrying(&mut self, retry_at: DateTime<Utc>) {
        self.status = EventStatus::FailedRetrying;
        self.retry_at = Some(retry_at);
    }

    /// Move the event to the terminal quarantined state.
    pub const fn mark_quarantined(&mut self) {
        self.status = EventStatus::Quarantined;
        self.was_quarantined = true;
        self.retry_at = None;
    }

    /// Operator replay: reset to `pending` with a fresh attempt cycle.
    ///
    /// The publication log is preserved for audit; bookkeeping restarts
    /// from `now`. `was_quarantined` stays set.
    pub const fn reset_for_replay(&mut self, now: DateTime<Utc>) {
        self.status = EventStatus::Pending;
        self.retry_at = None;
        self.last_requeued_at = Some(now);
    }
}
