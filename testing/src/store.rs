//! In-memory outbox store and unit of work.
//!
//! Mirrors the semantics of the Postgres backend closely enough that the
//! crawler's behaviour can be verified without a database: optimistic
//! version checks on save, claim deadlines on `load_due_events`, and
//! all-or-nothing event creation through [`InMemoryOutbox::run_in_transaction`].

use chrono::{DateTime, Utc};
use courier_core::event::{EventId, EventStatus, OutboxEvent};
use courier_core::outbox::{OutboxStore, OutboxStoreError};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[derive(Clone, Debug)]
struct Stored {
    event: OutboxEvent,
    claimed_until: Option<DateTime<Utc>>,
}

/// Staging context handed to the closure of
/// [`InMemoryOutbox::run_in_transaction`].
///
/// Appends are buffered here and only become visible in the store when the
/// closure returns `Ok`, the in-memory analogue of commit vs rollback.
#[derive(Debug, Default)]
pub struct OutboxTransaction {
    staged: Vec<OutboxEvent>,
}

impl OutboxTransaction {
    /// Stage an event for insertion on commit.
    pub fn append(&mut self, event: OutboxEvent) {
        self.staged.push(event);
    }
}

/// In-memory [`OutboxStore`] for fast, deterministic tests.
#[derive(Debug, Default)]
pub struct InMemoryOutbox {
    inner: Mutex<HashMap<EventId, Stored>>,
}

impl InMemoryOutbox {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<EventId, Stored>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` as a unit of work.
    ///
    /// Events appended to the [`OutboxTransaction`] are inserted atomically
    /// when `f` returns `Ok`; when `f` returns `Err` nothing is inserted,
    /// matching the no-orphan-events invariant of a rolled-back business
    /// transaction.
    ///
    /// # Errors
    ///
    /// Propagates whatever error `f` returns.
    pub fn run_in_transaction<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut OutboxTransaction) -> Result<T, E>,
    {
        let mut tx = OutboxTransaction::default();
        let out = f(&mut tx)?;
        let mut inner = self.lock();
        for event in tx.staged {
            inner.insert(
                event.id,
                Stored {
                    event,
                    claimed_until: None,
                },
            );
        }
        Ok(out)
    }

    /// Insert an event directly, bypassing the unit of work. Test seeding
    /// only.
    pub fn insert(&self, event: OutboxEvent) {
        self.lock().insert(
            event.id,
            Stored {
                event,
                claimed_until: None,
            },
        );
    }

    /// Snapshot of a stored event.
    #[must_use]
    pub fn get(&self, id: EventId) -> Option<OutboxEvent> {
        self.lock().get(&id).map(|s| s.event.clone())
    }

    /// Number of stored events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn save_sync(&self, mut event: OutboxEvent) -> Result<(), OutboxStoreError> {
        let mut inner = self.lock();
        let Some(stored) = inner.get_mut(&event.id) else {
            return Err(OutboxStoreError::EventNotFound(event.id));
        };
        if stored.event.version != event.version {
            return Err(OutboxStoreError::ConcurrencyConflict {
                event_id: event.id,
                expected: event.version,
                actual: stored.event.version,
            });
        }
        event.version += 1;
        stored.event = event;
        stored.claimed_until = None;
        Ok(())
    }

    fn load_due_sync(
        &self,
        limit: usize,
        now: DateTime<Utc>,
        claim_ttl: Duration,
    ) -> Vec<OutboxEvent> {
        let mut inner = self.lock();
        let mut due: Vec<&mut Stored> = inner
            .values_mut()
            .filter(|s| {
                matches!(
                    s.event.status,
                    EventStatus::Pending | EventStatus::FailedRetrying
                ) && s.event.retry_at.is_none_or(|t| t <= now)
                    && s.claimed_until.is_none_or(|t| t <= now)
            })
            .collect();
        due.sort_by_key(|s| s.event.occurred_at);
        due.truncate(limit);

        let deadline = now + claim_ttl;
        due.into_iter()
            .map(|s| {
                s.claimed_until = Some(deadline);
                s.event.clone()
            })
            .collect()
    }
}

impl OutboxStore for InMemoryOutbox {
    fn save(
        &self,
        event: OutboxEvent,
    ) -> Pin<Box<dyn Future<Output = Result<(), OutboxStoreError>> + Send + '_>> {
        Box::pin(std::future::ready(self.save_sync(event)))
    }

    fn load_due_events(
        &self,
        limit: usize,
        now: DateTime<Utc>,
        claim_ttl: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<OutboxEvent>, OutboxStoreError>> + Send + '_>> {
        Box::pin(std::future::ready(Ok(
            self.load_due_sync(limit, now, claim_ttl)
        )))
    }

    fn find(
        &self,
        id: EventId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<OutboxEvent>, OutboxStoreError>> + Send + '_>>
    {
        Box::pin(std::future::ready(Ok(self.get(id))))
    }
}
