//! `PostgreSQL`-backed outbox store and transactional publisher.
//!
//! Two concurrency mechanisms work together here:
//!
//! - [`PostgresOutbox::load_due_events`](courier_core::outbox::OutboxStore::load_due_events)
//!   selects due rows with `FOR UPDATE SKIP LOCKED` and stamps
//!   `claimed_until` in the same transaction, so a second poller skips them
//!   until the claim lapses.
//! - [`PostgresOutbox::save`](courier_core::outbox::OutboxStore::save)
//!   guards the `UPDATE` with `AND version = $n`; zero affected rows means
//!   another writer got there first.

use chrono::{DateTime, Utc};
use courier_core::event::{EventId, EventStatus, OutboxEvent, Publication, Topic};
use courier_core::outbox::{OutboxStore, OutboxStoreError};
use courier_core::publisher::EventFactory;
use serde_json::Value;
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use uuid::Uuid;

fn db_error(e: sqlx::Error) -> OutboxStoreError {
    OutboxStoreError::DatabaseError(e.to_string())
}

fn version_to_db(version: u64) -> Result<i64, OutboxStoreError> {
    i64::try_from(version)
        .map_err(|_| OutboxStoreError::DatabaseError(format!("version out of range: {version}")))
}

fn version_from_db(version: i64) -> u64 {
    u64::try_from(version).unwrap_or(0)
}

fn row_to_event(row: &sqlx::postgres::PgRow) -> Result<OutboxEvent, OutboxStoreError> {
    let id: Uuid = row.get("id");
    let topic: String = row.get("topic");
    let publications_json: Value = row.get("publications");
    let publications: Vec<Publication> = serde_json::from_value(publications_json)
        .map_err(|e| OutboxStoreError::SerializationError(e.to_string()))?;
    let status_str: String = row.get("status");
    let status = EventStatus::parse(&status_str)
        .map_err(|e| OutboxStoreError::SerializationError(e.to_string()))?;
    let version: i64 = row.get("version");

    Ok(OutboxEvent {
        id: EventId::new(id),
        topic: Topic::new(topic),
        payload: row.get("payload"),
        occurred_at: row.get("occurred_at"),
        publications,
        status,
        was_quarantined: row.get("was_quarantined"),
        retry_at: row.get("retry_at"),
        last_requeued_at: row.get("last_requeued_at"),
        version: version_from_db(version),
    })
}

/// `PostgreSQL` implementation of [`OutboxStore`].
///
/// Clones share the underlying connection pool.
#[derive(Clone, Debug)]
pub struct PostgresOutbox {
    pool: PgPool,
}

impl PostgresOutbox {
    /// Create a store on an existing connection pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying connection pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn save_inner(&self, event: OutboxEvent) -> Result<(), OutboxStoreError> {
        let publications = serde_json::to_value(&event.publications)
            .map_err(|e| OutboxStoreError::SerializationError(e.to_string()))?;
        let expected = version_to_db(event.version)?;

        let result = sqlx::query(
            r"
            UPDATE outbox_events
            SET publications = $1,
                status = $2,
                was_quarantined = $3,
                retry_at = $4,
                last_requeued_at = $5,
                claimed_until = NULL,
                version = version + 1
            WHERE id = $6 AND version = $7
            ",
        )
        .bind(&publications)
        .bind(event.status.as_str())
        .bind(event.was_quarantined)
        .bind(event.retry_at)
        .bind(event.last_requeued_at)
        .bind(event.id.as_uuid())
        .bind(expected)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        if result.rows_affected() == 0 {
            // Distinguish a lost race from a missing row.
            let actual: Option<(i64,)> =
                sqlx::query_as("SELECT version FROM outbox_events WHERE id = $1")
                    .bind(event.id.as_uuid())
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(db_error)?;
            return match actual {
                Some((actual,)) => Err(OutboxStoreError::ConcurrencyConflict {
                    event_id: event.id,
                    expected: event.version,
                    actual: version_from_db(actual),
                }),
                None => Err(OutboxStoreError::EventNotFound(event.id)),
            };
        }

        Ok(())
    }

    async fn load_due_inner(
        &self,
        limit: usize,
        now: DateTime<Utc>,
        claim_ttl: Duration,
    ) -> Result<Vec<OutboxEvent>, OutboxStoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let deadline = now + claim_ttl;

        let mut tx = self.pool.begin().await.map_err(db_error)?;

        let rows = sqlx::query(
            r"
            SELECT id, topic, payload, occurred_at, publications, status,
                   was_quarantined, retry_at, last_requeued_at, version
            FROM outbox_events
            WHERE status IN ('pending', 'failed-retrying')
              AND (retry_at IS NULL OR retry_at <= $1)
              AND (claimed_until IS NULL OR claimed_until <= $1)
            ORDER BY occurred_at ASC
            LIMIT $2
            FOR UPDATE SKIP LOCKED
            ",
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&mut *tx)
        .await
        .map_err(db_error)?;

        let events: Vec<OutboxEvent> = rows
            .iter()
            .map(row_to_event)
            .collect::<Result<_, _>>()?;

        if !events.is_empty() {
            let ids: Vec<Uuid> = events.iter().map(|e| e.id.as_uuid()).collect();
            sqlx::query("UPDATE outbox_events SET claimed_until = $1 WHERE id = ANY($2)")
                .bind(deadline)
                .bind(&ids)
                .execute(&mut *tx)
                .await
                .map_err(db_error)?;
        }

        tx.commit().await.map_err(db_error)?;

        Ok(events)
    }

    async fn find_inner(&self, id: EventId) -> Result<Option<OutboxEvent>, OutboxStoreError> {
        let row = sqlx::query(
            r"
            SELECT id, topic, payload, occurred_at, publications, status,
                   was_quarantined, retry_at, last_requeued_at, version
            FROM outbox_events
            WHERE id = $1
            ",
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        row.as_ref().map(row_to_event).transpose()
    }
}

impl OutboxStore for PostgresOutbox {
    fn save(
        &self,
        event: OutboxEvent,
    ) -> Pin<Box<dyn Future<Output = Result<(), OutboxStoreError>> + Send + '_>> {
        Box::pin(self.save_inner(event))
    }

    fn load_due_events(
        &self,
        limit: usize,
        now: DateTime<Utc>,
        claim_ttl: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<OutboxEvent>, OutboxStoreError>> + Send + '_>> {
        Box::pin(self.load_due_inner(limit, now, claim_ttl))
    }

    fn find(
        &self,
        id: EventId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<OutboxEvent>, OutboxStoreError>> + Send + '_>>
    {
        Box::pin(self.find_inner(id))
    }
}

/// Appends outbox events inside a caller-owned database transaction.
///
/// Taking `&mut Transaction` makes atomicity a compile-time property: an
/// event can only be appended through an open transaction, and it becomes
/// visible to the crawler exactly when the business writes do. There is no
/// way to publish an event whose business mutation rolled back.
pub struct PostgresPublisher {
    factory: EventFactory,
}

impl PostgresPublisher {
    /// Create a publisher that stamps events via `factory`.
    #[must_use]
    pub const fn new(factory: EventFactory) -> Self {
        Self { factory }
    }

    /// Append a pending event for `topic` to the outbox, inside `tx`.
    ///
    /// Never invokes handlers; delivery happens later, on the crawler's
    /// schedule. Returns the new event's id so the caller can correlate it
    /// in logs or tests.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxStoreError::DatabaseError`] if the insert fails.
    pub async fn append(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        topic: Topic,
        payload: Value,
    ) -> Result<EventId, OutboxStoreError> {
        let event = self.factory.create(topic, payload);

        sqlx::query(
            r"
            INSERT INTO outbox_events (id, topic, payload, occurred_at)
            VALUES ($1, $2, $3, $4)
            ",
        )
        .bind(event.id.as_uuid())
        .bind(event.topic.as_str())
        .bind(&event.payload)
        .bind(event.occurred_at)
        .execute(&mut **tx)
        .await
        .map_err(db_error)?;

        tracing::debug!(
            event_id = %event.id,
            topic = %event.topic,
            "Outbox event appended"
        );
        metrics::counter!("outbox.events.appended", "topic" => event.topic.as_str().to_string())
            .increment(1);

        Ok(event.id)
    }
}

impl std::fmt::Debug for PostgresPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresPublisher").finish_non_exhaustive()
    }
}
