//! # Courier Core
//!
//! Core types and contracts for the Courier transactional outbox and
//! event-crawler subsystem.
//!
//! Every meaningful state change in the host application (a convention
//! signed, an agency validated, a discussion message received) is recorded
//! as a domain event in the same database transaction as the mutation that
//! produced it. A separate crawler process later delivers those events to
//! their subscribed handlers, at least once, with bounded retries and
//! poison-message quarantine.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐
//! │  Business use    │
//! │  case (in tx)    │
//! └────────┬─────────┘
//!          │ Publisher::append (same transaction)
//!          ▼
//! ┌──────────────────┐       ┌──────────────────┐
//! │   Outbox Store   │◄──────│     Crawler      │ (timer-driven poll)
//! │  (source of      │ claim │                  │
//! │   truth)         │ /save └────────┬─────────┘
//! └──────────────────┘                │ dispatch
//!                               ┌─────┴──────┐
//!                               ▼            ▼
//!                          ┌────────┐   ┌────────┐
//!                          │ Email  │   │  PDF   │  ... handlers
//!                          └────────┘   └────────┘
//! ```
//!
//! ## Key principles
//!
//! - **Outbox first**: event creation and the business mutation share one
//!   transaction; if the transaction rolls back the event never existed.
//! - **At-least-once delivery**: handlers may be invoked more than once for
//!   the same event and must be idempotent.
//! - **Independent handlers**: one failing handler never blocks the others
//!   subscribed to the same topic.
//! - **Bounded retries**: a handler that keeps failing moves the event to a
//!   terminal quarantined state instead of retrying forever.
//!
//! This crate defines the data model ([`event`]), the durable store
//! contract ([`outbox`]), the immutable topic-to-handler mapping
//! ([`registry`]), event construction ([`publisher`]) and the injected
//! dependency traits ([`environment`]). Production and test backends live
//! in `courier-postgres` and `courier-testing`; the polling loop lives in
//! `courier-crawler`.

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};

pub mod environment;
pub mod event;
pub mod outbox;
pub mod publisher;
pub mod registry;
