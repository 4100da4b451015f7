//! Outbox store contract.
//!
//! The outbox store is the single shared mutable resource of the subsystem:
//! a durable record of every domain event and its delivery log. Business
//! code inserts events through a backend-specific publisher (inside the
//! business transaction); the crawler claims due events, dispatches them
//! and records the outcome through [`OutboxStore::save`].
//!
//! # Implementations
//!
//! - `PostgresOutbox` (in `courier-postgres`): production implementation,
//!   row claiming via `FOR UPDATE SKIP LOCKED`.
//! - `InMemoryOutbox` (in `courier-testing`): fast, deterministic testing.
//!
//! # Concurrency
//!
//! Two mechanisms keep concurrent crawler instances (or a crawler racing an
//! operator replay) from double-counting or losing attempts:
//!
//! - **Claiming**: [`OutboxStore::load_due_events`] atomically stamps a
//!   claim deadline on the events it returns, so a second poller skips them
//!   until the claim lapses. A crawler crash between claim and record
//!   simply lets the claim expire; the event becomes due again as if the
//!   attempt had failed.
//! - **Optimistic versioning**: every event carries a version token;
//!   [`OutboxStore::save`] refuses a write whose version no longer matches
//!   the stored row and reports [`OutboxStoreError::ConcurrencyConflict`].
//!
//! # Dyn compatibility
//!
//! The trait uses explicit `Pin<Box<dyn Future>>` returns instead of
//! `async fn` so it can be used as a trait object (`Arc<dyn OutboxStore>`)
//! shared between the crawler, the replay operation and tests.

use crate::event::{EventId, OutboxEvent};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during outbox store operations.
#[derive(Error, Debug)]
pub enum OutboxStoreError {
    /// Optimistic concurrency conflict: the event was modified by another
    /// writer between load and save.
    #[error("concurrency conflict on event {event_id}: expected version {expected}, found {actual}")]
    ConcurrencyConflict {
        /// The event the conflict occurred on.
        event_id: EventId,
        /// The version the writer expected.
        expected: u64,
        /// The version actually stored.
        actual: u64,
    },

    /// No event with the given id exists.
    #[error("event not found: {0}")]
    EventNotFound(EventId),

    /// Backend connection or query error.
    #[error("database error: {0}")]
    DatabaseError(String),

    /// Failed to (de)serialize a payload or publication log.
    #[error("serialization error: {0}")]
    SerializationError(String),
}

/// Durable store for outbox events.
///
/// Implementations must be `Send + Sync`; the store is shared between the
/// crawler loop, the operator replay operation and, through the
/// backend-specific publisher, every business use case.
pub trait OutboxStore: Send + Sync {
    /// Persist the delivery state of an existing event.
    ///
    /// Atomic read-modify-write: the write only lands if the stored version
    /// matches `event.version`; the store bumps the version and releases
    /// any claim. Safe for concurrent callers on *different* events;
    /// concurrent writes to the same event are serialized by the version
    /// check, with exactly one winner.
    ///
    /// Event *creation* is not part of this trait: it must happen inside
    /// the business transaction, through the backend's publisher.
    ///
    /// # Errors
    ///
    /// - [`OutboxStoreError::ConcurrencyConflict`]: another writer won.
    /// - [`OutboxStoreError::EventNotFound`]: the event does not exist.
    /// - [`OutboxStoreError::DatabaseError`]: backend failure.
    fn save(
        &self,
        event: OutboxEvent,
    ) -> Pin<Box<dyn Future<Output = Result<(), OutboxStoreError>> + Send + '_>>;

    /// Fetch and claim the next batch of events due for delivery.
    ///
    /// Returns events with status `pending` or `failed-retrying` whose
    /// `retry_at` is absent or `<= now` and that are not currently claimed,
    /// ordered oldest-`occurred_at`-first (best-effort fairness, not a
    /// global ordering guarantee), capped at `limit`.
    ///
    /// Returned events are atomically claimed until `now + claim_ttl`: a
    /// concurrent poller will not see them again before the deadline
    /// passes. [`OutboxStore::save`] releases the claim early.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxStoreError::DatabaseError`] on backend failure.
    fn load_due_events(
        &self,
        limit: usize,
        now: DateTime<Utc>,
        claim_ttl: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<OutboxEvent>, OutboxStoreError>> + Send + '_>>;

    /// Look up a single event by id.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxStoreError::DatabaseError`] on backend failure.
    fn find(
        &self,
        id: EventId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<OutboxEvent>, OutboxStoreError>> + Send + '_>>;
}
