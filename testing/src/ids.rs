//! Predictable id generation for tests.

use courier_core::environment::IdGenerator;
use courier_core::event::EventId;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Id generator that counts up from 1, yielding stable, readable UUIDs.
#[derive(Debug, Default)]
pub struct SequentialIds {
    next: AtomicU64,
}

impl SequentialIds {
    /// Create a generator starting at 1.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            next: AtomicU64::new(0),
        }
    }

    /// The id that position `n` (1-based) in the sequence maps to.
    #[must_use]
    pub const fn nth(n: u64) -> EventId {
        EventId::new(Uuid::from_u128(n as u128))
    }
}

impl IdGenerator for SequentialIds {
    fn next_id(&self) -> EventId {
        let n = self.next.fetch_add(1, Ordering::SeqCst) + 1;
        Self::nth(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_sequential_and_predictable() {
        let ids = SequentialIds::new();
        assert_eq!(ids.next_id(), SequentialIds::nth(1));
        assert_eq!(ids.next_id(), SequentialIds::nth(2));
    }
}
