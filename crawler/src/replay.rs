//! Operator replay of quarantined events.
//!
//! Quarantine is terminal for the crawler; only an explicit [`requeue`]
//! puts an event back in circulation. The operation is deliberately
//! narrow: it refuses anything that is not quarantined, so an operator
//! can never silently re-fire side effects of an already-published event.

use courier_core::environment::Clock;
use courier_core::event::{EventId, EventStatus};
use courier_core::outbox::{OutboxStore, OutboxStoreError};
use thiserror::Error;

/// Errors from the [`requeue`] operation.
#[derive(Debug, Error)]
pub enum RequeueError {
    /// No event with the given id exists.
    #[error("event not found: {0}")]
    NotFound(EventId),

    /// The event is not quarantined; requeueing it would re-fire side
    /// effects (or race an in-flight delivery), so it is refused.
    #[error("event {id} is {status}, only quarantined events can be requeued")]
    NotQuarantined {
        /// The refused event.
        id: EventId,
        /// Its current status.
        status: EventStatus,
    },

    /// Store-level failure, including losing the optimistic-version race
    /// against a concurrent writer.
    #[error(transparent)]
    Store(#[from] OutboxStoreError),
}

/// Reset a quarantined event to `pending` with a fresh attempt cycle.
///
/// The publication log is preserved for audit and `was_quarantined` stays
/// set; the attempt count reads zero afterwards, so the next crawl cycle
/// re-attempts every subscribed handler from scratch.
///
/// # Errors
///
/// - [`RequeueError::NotFound`] if the event does not exist.
/// - [`RequeueError::NotQuarantined`] if the event is pending, retrying or
///   already published.
/// - [`RequeueError::Store`] on backend failure or if a concurrent writer
///   modified the event between load and save.
pub async fn requeue(
    store: &dyn OutboxStore,
    clock: &dyn Clock,
    id: EventId,
) -> Result<(), RequeueError> {
    let Some(mut event) = store.find(id).await? else {
        return Err(RequeueError::NotFound(id));
    };

    if event.status != EventStatus::Quarantined {
        return Err(RequeueError::NotQuarantined {
            id,
            status: event.status,
        });
    }

    event.reset_for_replay(clock.now());
    store.save(event).await?;

    tracing::info!(event_id = %id, "Quarantined event requeued for delivery");
    metrics::counter!("outbox.events.requeued").increment(1);

    Ok(())
}
