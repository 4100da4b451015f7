//! Event construction for publishers.
//!
//! The publisher is the component business use cases call, synchronously
//! inside their transaction, to append new events. It never invokes
//! handlers: creation and delivery are deliberately decoupled, which is
//! what keeps business transactions immune to handler slowness or
//! downstream outages.
//!
//! The transactional half of the contract is backend-specific and enforced
//! by the type system rather than a runtime check: `PostgresPublisher` (in
//! `courier-postgres`) takes `&mut Transaction<'_, Postgres>`, which cannot
//! exist outside an open transaction, and the in-memory unit of work in
//! `courier-testing` only hands out its staging context inside
//! `run_in_transaction`. This crate contributes the shared piece: building
//! a well-formed pending event from injected time and id sources.

use crate::environment::{Clock, IdGenerator};
use crate::event::{OutboxEvent, Topic};
use serde_json::Value;
use std::sync::Arc;

/// Builds fresh pending events from injected clock and id generator.
///
/// `occurred_at` is the business-fact timestamp: it is taken at creation,
/// inside the business transaction, never at delivery.
#[derive(Clone)]
pub struct EventFactory {
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
}

impl EventFactory {
    /// Create a factory with the given time and id sources.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>, ids: Arc<dyn IdGenerator>) -> Self {
        Self { clock, ids }
    }

    /// Build a pending event for `topic` carrying `payload`.
    #[must_use]
    pub fn create(&self, topic: Topic, payload: Value) -> OutboxEvent {
        OutboxEvent::new(self.ids.next_id(), topic, payload, self.clock.now())
    }
}

impl std::fmt::Debug for EventFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventFactory").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::{SystemClock, UuidGenerator};
    use crate::event::EventStatus;

    #[test]
    fn created_events_are_pending_and_unique() {
        let factory = EventFactory::new(Arc::new(SystemClock), Arc::new(UuidGenerator));
        let a = factory.create(Topic::new("ConventionSigned"), serde_json::json!({"id": "C1"}));
        let b = factory.create(Topic::new("ConventionSigned"), serde_json::json!({"id": "C1"}));

        assert_eq!(a.status, EventStatus::Pending);
        assert!(a.publications.is_empty());
        assert_eq!(a.version, 0);
        assert_ne!(a.id, b.id);
    }
}
