//! # Courier Testing
//!
//! Testing utilities for the Courier transactional outbox.
//!
//! This crate provides:
//! - [`InMemoryOutbox`]: a deterministic, in-memory
//!   [`OutboxStore`](courier_core::outbox::OutboxStore) implementation with
//!   a closure-based unit of work for exercising the
//!   create-inside-a-transaction contract without a database
//! - [`FixedClock`] and [`SteppingClock`]: controllable time sources
//! - [`SequentialIds`]: predictable event ids
//! - Scripted handlers ([`RecordingHandler`], [`FlakyHandler`],
//!   [`FailingHandler`], [`SlowHandler`]) for driving the crawler through
//!   success, retry, quarantine and timeout paths
//!
//! ## Example
//!
//! ```
//! use courier_core::event::Topic;
//! use courier_core::publisher::EventFactory;
//! use courier_testing::{InMemoryOutbox, SequentialIds, test_clock};
//! use std::sync::Arc;
//!
//! let clock = Arc::new(test_clock());
//! let factory = EventFactory::new(clock, Arc::new(SequentialIds::new()));
//! let outbox = InMemoryOutbox::new();
//!
//! let appended: Result<(), &str> = outbox.run_in_transaction(|tx| {
//!     // ... business mutations would happen here ...
//!     tx.append(factory.create(Topic::new("ConventionSigned"), serde_json::json!({"id": "C1"})));
//!     Ok(())
//! });
//! assert!(appended.is_ok());
//! assert_eq!(outbox.len(), 1);
//! ```

pub mod clock;
pub mod handlers;
pub mod ids;
pub mod store;

pub use clock::{FixedClock, SteppingClock, test_clock};
pub use handlers::{FailingHandler, FlakyHandler, RecordingHandler, SlowHandler};
pub use ids::SequentialIds;
pub use store::{InMemoryOutbox, OutboxTransaction};
