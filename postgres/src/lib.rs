//! # Courier Postgres
//!
//! `PostgreSQL` implementation of the Courier outbox: a durable
//! [`OutboxStore`](courier_core::outbox::OutboxStore) backed by a single
//! `outbox_events` table, plus the transactional publisher business code
//! uses to append events atomically with its own writes.
//!
//! Concurrent pollers are kept apart with `FOR UPDATE SKIP LOCKED` row
//! claiming; lost-update races on delivery bookkeeping are rejected with an
//! optimistic version check.
//!
//! # Example
//!
//! ```ignore
//! use courier_postgres::{PostgresOutbox, PostgresPublisher, ensure_schema};
//!
//! async fn example(pool: sqlx::PgPool) -> Result<(), Box<dyn std::error::Error>> {
//!     ensure_schema(&pool).await?;
//!     let store = PostgresOutbox::new(pool.clone());
//!
//!     let publisher = PostgresPublisher::new(factory);
//!     let mut tx = pool.begin().await?;
//!     // ... business writes on `tx` ...
//!     publisher.append(&mut tx, topic, payload).await?;
//!     tx.commit().await?;
//!     Ok(())
//! }
//! ```

pub mod outbox;
pub mod schema;

pub use outbox::{PostgresOutbox, PostgresPublisher};
pub use schema::{SCHEMA, ensure_schema};
