//! Schema for the `outbox_events` table.

use courier_core::outbox::OutboxStoreError;
use sqlx::PgPool;

/// DDL for the `outbox_events` table and its indexes.
///
/// Idempotent: every statement is `IF NOT EXISTS`, so it can run at every
/// process start or be pasted into a migration.
///
/// `claimed_until` is poller bookkeeping, not part of the event model: a
/// non-null value in the future means some crawler instance currently holds
/// the row.
pub const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS outbox_events (
    id UUID PRIMARY KEY,
    topic TEXT NOT NULL,
    payload JSONB NOT NULL,
    occurred_at TIMESTAMPTZ NOT NULL,
    publications JSONB NOT NULL DEFAULT '[]'::jsonb,
    status TEXT NOT NULL DEFAULT 'pending',
    was_quarantined BOOLEAN NOT NULL DEFAULT FALSE,
    retry_at TIMESTAMPTZ,
    last_requeued_at TIMESTAMPTZ,
    claimed_until TIMESTAMPTZ,
    version BIGINT NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_outbox_events_due
    ON outbox_events (status, retry_at)
    WHERE status IN ('pending', 'failed-retrying');

CREATE INDEX IF NOT EXISTS idx_outbox_events_occurred_at
    ON outbox_events (occurred_at);
";

/// Apply [`SCHEMA`] to the database.
///
/// # Errors
///
/// Returns [`OutboxStoreError::DatabaseError`] if the DDL fails.
pub async fn ensure_schema(pool: &PgPool) -> Result<(), OutboxStoreError> {
    sqlx::raw_sql(SCHEMA)
        .execute(pool)
        .await
        .map_err(|e| OutboxStoreError::DatabaseError(e.to_string()))?;
    tracing::debug!("Outbox schema ensured");
    Ok(())
}
