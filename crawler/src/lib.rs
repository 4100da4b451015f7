//! # Courier Crawler
//!
//! The timer-driven process that delivers outbox events to their
//! subscribed handlers.
//!
//! On a fixed interval the crawler asks the outbox store for a batch of
//! due events (claiming them against concurrent crawler instances), then
//! for each event invokes every subscribed handler that has not yet
//! succeeded for it, records one publication per invocation, and saves the
//! resulting status: `published`, `failed-retrying` with a backoff
//! deadline, or `quarantined` once the retry budget is exhausted.
//!
//! # State machine per polling cycle
//!
//! ```text
//! Idle ──timer──▶ Fetching ──▶ Dispatching ──▶ Recording ──▶ Idle
//!                 (claim due    (per event ×     (append
//!                  batch)        handler pair)    publications,
//!                                                 decide status)
//! ```
//!
//! # Failure semantics
//!
//! - A handler error or timeout is caught, recorded as a failed
//!   publication and never propagated; it cannot crash the loop.
//! - One event's total failure never prevents other events in the same
//!   batch from being processed.
//! - Store unavailability aborts the cycle early with a log line; the next
//!   timer tick simply retries.
//! - A crawler crash between claim and record leaves the event
//!   re-claimable once the claim ttl lapses, as if the attempt had failed.
//!
//! # Example
//!
//! ```ignore
//! let (mut crawler, shutdown) = Crawler::new(
//!     store,
//!     registry,
//!     RetryPolicy::default(),
//!     Arc::new(SystemClock),
//!     CrawlerConfig::default(),
//! );
//!
//! tokio::spawn(async move {
//!     tokio::signal::ctrl_c().await.ok();
//!     shutdown.send(true).ok();
//! });
//!
//! crawler.start().await;
//! ```

use courier_core::environment::Clock;
use courier_core::event::{OutboxEvent, Publication, PublicationOutcome};
use courier_core::outbox::{OutboxStore, OutboxStoreError};
use courier_core::registry::{EventHandler, SubscriptionRegistry};
use futures::StreamExt;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

pub mod replay;
pub mod retry;

pub use replay::{RequeueError, requeue};
pub use retry::{RetryDecision, RetryPolicy};

/// Errors that abort a whole polling cycle.
///
/// Per-event and per-handler failures are recorded in the events
/// themselves and never surface here.
#[derive(Debug, Error)]
pub enum CrawlerError {
    /// The store could not be read; nothing was dispatched this cycle.
    #[error(transparent)]
    Store(#[from] OutboxStoreError),
}

/// Tuning knobs for the crawler loop.
#[derive(Debug, Clone)]
pub struct CrawlerConfig {
    /// Interval between polling cycles.
    pub poll_interval: Duration,
    /// Maximum events fetched per cycle.
    pub batch_limit: usize,
    /// Budget for a single handler invocation; exceeding it counts as a
    /// failure so one unresponsive downstream cannot stall the cycle.
    pub handler_timeout: Duration,
    /// How long a fetched event stays claimed. Must comfortably exceed the
    /// worst-case dispatch time of one event.
    pub claim_ttl: Duration,
    /// How many events are dispatched concurrently within one cycle.
    /// Handlers for a single event always run sequentially, in registry
    /// order.
    pub dispatch_concurrency: usize,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            batch_limit: 100,
            handler_timeout: Duration::from_secs(10),
            claim_ttl: Duration::from_secs(300),
            dispatch_concurrency: 10,
        }
    }
}

impl CrawlerConfig {
    /// Set the interval between polling cycles.
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the maximum events fetched per cycle.
    #[must_use]
    pub const fn with_batch_limit(mut self, limit: usize) -> Self {
        self.batch_limit = limit;
        self
    }

    /// Set the per-handler invocation budget.
    #[must_use]
    pub const fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = timeout;
        self
    }

    /// Set how long a fetched event stays claimed.
    #[must_use]
    pub const fn with_claim_ttl(mut self, ttl: Duration) -> Self {
        self.claim_ttl = ttl;
        self
    }

    /// Set how many events are dispatched concurrently within one cycle.
    #[must_use]
    pub const fn with_dispatch_concurrency(mut self, concurrency: usize) -> Self {
        self.dispatch_concurrency = concurrency;
        self
    }
}

/// Outcome counts for one polling cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleStats {
    /// Events fetched (and claimed) this cycle.
    pub fetched: usize,
    /// Events that reached `published`.
    pub published: usize,
    /// Events rescheduled for a later retry.
    pub retrying: usize,
    /// Events moved to quarantine.
    pub quarantined: usize,
    /// Events whose outcome could not be recorded (lost a save race or hit
    /// a store error); their claim lapses and they become due again.
    pub skipped: usize,
}

enum Resolution {
    Published,
    Retrying,
    Quarantined,
    Skipped,
}

/// The polling worker that drives event delivery.
///
/// A single logical crawler per store is the normal deployment; running
/// several instances is safe (claims plus optimistic versioning keep them
/// from double-dispatching) but only useful for failover.
pub struct Crawler {
    store: Arc<dyn OutboxStore>,
    registry: Arc<SubscriptionRegistry>,
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
    config: CrawlerConfig,
    shutdown: watch::Receiver<bool>,
}

impl Crawler {
    /// Create a crawler.
    ///
    /// Returns the crawler and a shutdown sender; send `true` to stop
    /// [`Crawler::start`] gracefully after the in-flight cycle finishes.
    /// Dropping the sender stops the loop the same way.
    #[must_use]
    pub fn new(
        store: Arc<dyn OutboxStore>,
        registry: Arc<SubscriptionRegistry>,
        policy: RetryPolicy,
        clock: Arc<dyn Clock>,
        config: CrawlerConfig,
    ) -> (Self, watch::Sender<bool>) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let crawler = Self {
            store,
            registry,
            policy,
            clock,
            config,
            shutdown: shutdown_rx,
        };
        (crawler, shutdown_tx)
    }

    /// Run the polling loop until a shutdown signal is received.
    ///
    /// Cycle errors (store unavailability) are logged and counted; the
    /// loop keeps going and retries on the next tick. In-flight handler
    /// calls finish or time out before the loop reacts to shutdown, so no
    /// partial publication records are written.
    pub async fn start(&mut self) {
        tracing::info!(
            poll_interval_ms = self.config.poll_interval.as_millis(),
            batch_limit = self.config.batch_limit,
            "Starting outbox crawler"
        );

        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.run_cycle().await {
                        Ok(stats) if stats.fetched > 0 => {
                            tracing::debug!(
                                fetched = stats.fetched,
                                published = stats.published,
                                retrying = stats.retrying,
                                quarantined = stats.quarantined,
                                skipped = stats.skipped,
                                "Crawl cycle finished"
                            );
                        }
                        Ok(_) => {}
                        Err(error) => {
                            tracing::error!(
                                error = %error,
                                "Crawl cycle aborted; will retry on next tick"
                            );
                            metrics::counter!("outbox.crawler.cycle_errors").increment(1);
                        }
                    }
                }
                changed = self.shutdown.changed() => {
                    // A dropped sender counts as shutdown too; otherwise the
                    // closed channel would resolve instantly on every
                    // iteration and spin the loop.
                    if changed.is_err() || *self.shutdown.borrow() {
                        tracing::info!("Shutdown signal received");
                        break;
                    }
                }
            }
        }

        tracing::info!("Outbox crawler stopped");
    }

    /// Run a single polling cycle: fetch, dispatch, record.
    ///
    /// Exposed so tests (and one-shot maintenance jobs) can drive cycles
    /// deterministically without the timer.
    ///
    /// # Errors
    ///
    /// Returns [`CrawlerError::Store`] if the due-event fetch fails.
    /// Per-event failures never surface here; they are recorded in the
    /// events themselves.
    pub async fn run_cycle(&self) -> Result<CycleStats, CrawlerError> {
        let now = self.clock.now();
        let events = self
            .store
            .load_due_events(self.config.batch_limit, now, self.config.claim_ttl)
            .await?;

        let mut stats = CycleStats {
            fetched: events.len(),
            ..CycleStats::default()
        };

        let resolutions: Vec<Resolution> =
            futures::stream::iter(events.into_iter().map(|event| self.process_event(event)))
                .buffer_unordered(self.config.dispatch_concurrency.max(1))
                .collect()
                .await;

        for resolution in resolutions {
            match resolution {
                Resolution::Published => stats.published += 1,
                Resolution::Retrying => stats.retrying += 1,
                Resolution::Quarantined => stats.quarantined += 1,
                Resolution::Skipped => stats.skipped += 1,
            }
        }

        Ok(stats)
    }

    /// Dispatch one event to its pending handlers and record the outcome.
    ///
    /// The final save is the single write for this event in this cycle,
    /// so concurrent stats updates cannot lose publications.
    async fn process_event(&self, mut event: OutboxEvent) -> Resolution {
        let handlers = self.registry.handlers_for(&event.topic);

        for handler in handlers {
            // A handler that already succeeded for this event is never
            // re-invoked on a later retry.
            if event.handler_succeeded(handler.name()) {
                continue;
            }

            let outcome = self.invoke_handler(handler.as_ref(), &event.payload).await;
            if let PublicationOutcome::Failure { error } = &outcome {
                tracing::warn!(
                    event_id = %event.id,
                    topic = %event.topic,
                    handler = handler.name(),
                    error = %error,
                    "Handler failed"
                );
                metrics::counter!(
                    "outbox.handler.failures",
                    "handler" => handler.name().to_string()
                )
                .increment(1);
            }

            event.record_publication(Publication {
                handler_name: handler.name().to_string(),
                attempted_at: self.clock.now(),
                outcome,
            });
        }

        let all_succeeded = handlers
            .iter()
            .all(|handler| event.handler_succeeded(handler.name()));

        let resolution = if all_succeeded {
            // Includes the vacuous case: a topic with zero subscribers is
            // published on its first crawl pass.
            event.mark_published();
            metrics::counter!("outbox.events.published").increment(1);
            Resolution::Published
        } else {
            match self.policy.decide(&event, self.clock.now()) {
                RetryDecision::RetryAt(retry_at) => {
                    event.mark_failed_retrying(retry_at);
                    Resolution::Retrying
                }
                RetryDecision::Quarantine => {
                    event.mark_quarantined();
                    tracing::error!(
                        event_id = %event.id,
                        topic = %event.topic,
                        attempts = event.failing_attempt_count(),
                        "Event quarantined after exhausting retries; manual requeue required"
                    );
                    metrics::counter!(
                        "outbox.events.quarantined",
                        "topic" => event.topic.to_string()
                    )
                    .increment(1);
                    Resolution::Quarantined
                }
            }
        };

        let event_id = event.id;
        match self.store.save(event).await {
            Ok(()) => resolution,
            Err(OutboxStoreError::ConcurrencyConflict { .. }) => {
                // Another crawler instance or an operator replay won the
                // race; their record stands and ours is dropped.
                tracing::warn!(
                    event_id = %event_id,
                    "Event changed during dispatch; dropping this attempt record"
                );
                Resolution::Skipped
            }
            Err(error) => {
                tracing::error!(
                    event_id = %event_id,
                    error = %error,
                    "Failed to record dispatch outcome; claim will lapse"
                );
                Resolution::Skipped
            }
        }
    }

    /// Invoke one handler under the configured timeout, converting every
    /// failure mode into a recordable outcome.
    async fn invoke_handler(&self, handler: &dyn EventHandler, payload: &Value) -> PublicationOutcome {
        match tokio::time::timeout(self.config.handler_timeout, handler.handle(payload)).await {
            Ok(Ok(())) => PublicationOutcome::Success,
            Ok(Err(error)) => PublicationOutcome::Failure {
                error: error.to_string(),
            },
            Err(_) => PublicationOutcome::Failure {
                error: format!(
                    "timed out after {}ms",
                    self.config.handler_timeout.as_millis()
                ),
            },
        }
    }
}

impl std::fmt::Debug for Crawler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Crawler")
            .field("policy", &self.policy)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
