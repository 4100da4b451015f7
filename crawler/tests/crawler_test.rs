//! End-to-end crawler tests against the in-memory outbox.
//!
//! Cycles are driven by hand through `run_cycle` with a stepping clock, so
//! backoff windows are crossed by advancing time instead of sleeping.

#![allow(clippy::unwrap_used, clippy::expect_used)] // Test code uses unwrap/expect for clear failures

use courier_core::event::{EventId, EventStatus, PublicationOutcome, Topic};
use courier_core::outbox::{OutboxStore, OutboxStoreError};
use courier_core::publisher::EventFactory;
use courier_core::registry::{SubscriptionRegistry, SubscriptionRegistryBuilder};
use courier_crawler::{
    Crawler, CrawlerConfig, CrawlerError, RequeueError, RetryPolicy, requeue,
};
use courier_testing::{
    FailingHandler, FlakyHandler, InMemoryOutbox, RecordingHandler, SequentialIds, SlowHandler,
    SteppingClock, test_clock,
};
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    outbox: Arc<InMemoryOutbox>,
    clock: Arc<SteppingClock>,
    factory: EventFactory,
    crawler: Crawler,
    _shutdown: tokio::sync::watch::Sender<bool>,
}

impl Harness {
    fn new(registry: SubscriptionRegistryBuilder, policy: RetryPolicy) -> Self {
        Self::with_config(registry, policy, CrawlerConfig::default())
    }

    fn with_config(
        registry: SubscriptionRegistryBuilder,
        policy: RetryPolicy,
        config: CrawlerConfig,
    ) -> Self {
        let outbox = Arc::new(InMemoryOutbox::new());
        let clock = Arc::new(test_clock());
        let factory = EventFactory::new(clock.clone(), Arc::new(SequentialIds::new()));
        let registry = Arc::new(registry.build().expect("registry should build"));
        let (crawler, shutdown) = Crawler::new(
            outbox.clone(),
            registry,
            policy,
            clock.clone(),
            config,
        );
        Self {
            outbox,
            clock,
            factory,
            crawler,
            _shutdown: shutdown,
        }
    }

    fn append(&self, topic: &str, payload: serde_json::Value) -> EventId {
        let event = self.factory.create(Topic::new(topic), payload);
        let id = event.id;
        self.outbox
            .run_in_transaction(|tx| {
                tx.append(event);
                Ok::<(), std::convert::Infallible>(())
            })
            .expect("append should commit");
        id
    }

    async fn cycle(&self) -> courier_crawler::CycleStats {
        self.crawler.run_cycle().await.expect("cycle should run")
    }
}

fn default_policy() -> RetryPolicy {
    RetryPolicy::default()
}

// Scenario: topic with zero subscribers is vacuously published.
#[tokio::test]
async fn event_without_subscribers_is_published_immediately() {
    let harness = Harness::new(
        SubscriptionRegistry::builder().declare_topic(Topic::new("ConventionSigned")),
        default_policy(),
    );
    let id = harness.append("ConventionSigned", serde_json::json!({"id": "C1"}));

    let stats = harness.cycle().await;
    assert_eq!((stats.fetched, stats.published), (1, 1));

    let event = harness.outbox.get(id).unwrap();
    assert_eq!(event.status, EventStatus::Published);
    assert!(event.publications.is_empty());
}

// Scenario: one subscriber that fails twice then succeeds.
#[tokio::test]
async fn flaky_handler_succeeds_within_retry_budget() {
    let handler = Arc::new(FlakyHandler::new("email", 2));
    let harness = Harness::new(
        SubscriptionRegistry::builder().subscribe(Topic::new("ConventionSigned"), handler.clone()),
        default_policy(),
    );
    let id = harness.append("ConventionSigned", serde_json::json!({"id": "C1"}));

    let stats = harness.cycle().await;
    assert_eq!(stats.retrying, 1);

    harness.clock.advance(Duration::from_secs(2));
    let stats = harness.cycle().await;
    assert_eq!(stats.retrying, 1);

    harness.clock.advance(Duration::from_secs(4));
    let stats = harness.cycle().await;
    assert_eq!(stats.published, 1);

    let event = harness.outbox.get(id).unwrap();
    assert_eq!(event.status, EventStatus::Published);
    assert!(!event.was_quarantined);
    assert_eq!(event.publications.len(), 3);
    assert!(!event.publications[0].outcome.is_success());
    assert!(!event.publications[1].outcome.is_success());
    assert!(event.publications[2].outcome.is_success());
    assert_eq!(handler.invocations(), 3);
}

// Scenario: a handler that always fails is quarantined after exactly
// max_attempts, and never re-attempted afterwards.
#[tokio::test]
async fn always_failing_handler_is_quarantined_after_max_attempts() {
    let handler = Arc::new(FailingHandler::new("webhook", "provider down"));
    let harness = Harness::new(
        SubscriptionRegistry::builder().subscribe(Topic::new("AgencyValidated"), handler.clone()),
        RetryPolicy::builder().max_attempts(3).build(),
    );
    let id = harness.append("AgencyValidated", serde_json::json!({"agency": "A1"}));

    for _ in 0..2 {
        let stats = harness.cycle().await;
        assert_eq!(stats.retrying, 1);
        harness.clock.advance(Duration::from_secs(3600));
    }
    let stats = harness.cycle().await;
    assert_eq!(stats.quarantined, 1);

    let event = harness.outbox.get(id).unwrap();
    assert_eq!(event.status, EventStatus::Quarantined);
    assert!(event.was_quarantined);
    assert_eq!(event.publications.len(), 3);

    // A fourth cycle must not touch it.
    harness.clock.advance(Duration::from_secs(86_400));
    let stats = harness.cycle().await;
    assert_eq!(stats.fetched, 0);
    assert_eq!(handler.invocations(), 3);
}

// Scenario: two subscribers, one succeeding and one failing. The
// succeeding handler is never re-invoked; the event still quarantines
// because not all handlers succeeded.
#[tokio::test]
async fn succeeded_handler_is_not_reinvoked_while_other_retries() {
    let email = Arc::new(RecordingHandler::new("email"));
    let sms = Arc::new(FailingHandler::new("sms", "gateway 500"));
    let topic = Topic::new("DiscussionMessageReceived");
    let harness = Harness::new(
        SubscriptionRegistry::builder()
            .subscribe(topic.clone(), email.clone())
            .subscribe(topic, sms.clone()),
        RetryPolicy::builder().max_attempts(2).build(),
    );
    let id = harness.append("DiscussionMessageReceived", serde_json::json!({"msg": 1}));

    let stats = harness.cycle().await;
    assert_eq!(stats.retrying, 1);
    harness.clock.advance(Duration::from_secs(10));
    let stats = harness.cycle().await;
    assert_eq!(stats.quarantined, 1);

    assert_eq!(email.invocations(), 1);
    assert_eq!(sms.invocations(), 2);

    let event = harness.outbox.get(id).unwrap();
    assert_eq!(event.status, EventStatus::Quarantined);
    let email_entries: Vec<_> = event
        .publications
        .iter()
        .filter(|p| p.handler_name == "email")
        .collect();
    let sms_entries: Vec<_> = event
        .publications
        .iter()
        .filter(|p| p.handler_name == "sms")
        .collect();
    assert_eq!(email_entries.len(), 1);
    assert!(email_entries[0].outcome.is_success());
    assert_eq!(sms_entries.len(), 2);
    assert!(sms_entries.iter().all(|p| !p.outcome.is_success()));
}

// Scenario: requeue resets a quarantined event to pending with a fresh
// attempt cycle; the next crawl re-attempts from scratch.
#[tokio::test]
async fn requeue_gives_a_quarantined_event_a_fresh_start() {
    let handler = Arc::new(FlakyHandler::new("pdf", 2));
    let harness = Harness::new(
        SubscriptionRegistry::builder().subscribe(Topic::new("ConventionSigned"), handler.clone()),
        RetryPolicy::builder().max_attempts(2).build(),
    );
    let id = harness.append("ConventionSigned", serde_json::json!({"id": "C1"}));

    harness.cycle().await;
    harness.clock.advance(Duration::from_secs(10));
    let stats = harness.cycle().await;
    assert_eq!(stats.quarantined, 1);

    // The stamp equals the failed attempts' timestamp; the replay boundary
    // is strict, so the fresh attempt cycle still starts empty.
    requeue(harness.outbox.as_ref(), harness.clock.as_ref(), id)
        .await
        .expect("requeue should succeed");

    let event = harness.outbox.get(id).unwrap();
    assert_eq!(event.status, EventStatus::Pending);
    assert!(event.was_quarantined);
    assert_eq!(event.failing_attempt_count(), 0);

    harness.clock.advance(Duration::from_secs(1));
    let stats = harness.cycle().await;
    assert_eq!(stats.published, 1);

    let event = harness.outbox.get(id).unwrap();
    assert_eq!(event.status, EventStatus::Published);
    assert!(event.was_quarantined);
    // Full audit trail: two failures from before the replay, one success after.
    assert_eq!(event.publications.len(), 3);
}

#[tokio::test]
async fn requeue_refuses_published_and_unknown_events() {
    let harness = Harness::new(
        SubscriptionRegistry::builder().declare_topic(Topic::new("ConventionSigned")),
        default_policy(),
    );
    let id = harness.append("ConventionSigned", serde_json::json!({}));
    harness.cycle().await;

    let refused = requeue(harness.outbox.as_ref(), harness.clock.as_ref(), id).await;
    assert!(matches!(
        refused,
        Err(RequeueError::NotQuarantined {
            status: EventStatus::Published,
            ..
        })
    ));

    let missing = requeue(
        harness.outbox.as_ref(),
        harness.clock.as_ref(),
        SequentialIds::nth(999),
    )
    .await;
    assert!(matches!(missing, Err(RequeueError::NotFound(_))));
}

// One event's total failure never blocks the rest of the batch.
#[tokio::test]
async fn failing_event_does_not_block_batch_neighbours() {
    let webhook = Arc::new(FailingHandler::new("webhook", "boom"));
    let email = Arc::new(RecordingHandler::new("email"));
    let harness = Harness::new(
        SubscriptionRegistry::builder()
            .subscribe(Topic::new("AgencyValidated"), webhook)
            .subscribe(Topic::new("ConventionSigned"), email.clone()),
        default_policy(),
    );
    let failing_id = harness.append("AgencyValidated", serde_json::json!({"n": 1}));
    let healthy_id = harness.append("ConventionSigned", serde_json::json!({"n": 2}));

    let stats = harness.cycle().await;
    assert_eq!(stats.fetched, 2);
    assert_eq!(stats.published, 1);
    assert_eq!(stats.retrying, 1);

    assert_eq!(
        harness.outbox.get(healthy_id).unwrap().status,
        EventStatus::Published
    );
    assert_eq!(
        harness.outbox.get(failing_id).unwrap().status,
        EventStatus::FailedRetrying
    );
    assert_eq!(email.invocations(), 1);
}

// A failed event is not due again before its backoff window has passed.
#[tokio::test]
async fn backoff_gates_the_next_attempt() {
    let handler = Arc::new(FailingHandler::new("email", "down"));
    let harness = Harness::new(
        SubscriptionRegistry::builder().subscribe(Topic::new("ConventionSigned"), handler.clone()),
        RetryPolicy::builder()
            .max_attempts(5)
            .initial_delay(Duration::from_secs(60))
            .build(),
    );
    harness.append("ConventionSigned", serde_json::json!({}));

    harness.cycle().await;
    assert_eq!(handler.invocations(), 1);

    // Immediately after, the event is still inside its backoff window.
    let stats = harness.cycle().await;
    assert_eq!(stats.fetched, 0);
    assert_eq!(handler.invocations(), 1);

    harness.clock.advance(Duration::from_secs(61));
    harness.cycle().await;
    assert_eq!(handler.invocations(), 2);
}

// A handler exceeding its timeout is recorded as a failure, not awaited
// forever.
#[tokio::test(start_paused = true)]
async fn slow_handler_times_out_and_counts_as_failure() {
    let handler = Arc::new(SlowHandler::new("pdf", Duration::from_secs(600)));
    let harness = Harness::with_config(
        SubscriptionRegistry::builder().subscribe(Topic::new("ConventionSigned"), handler),
        default_policy(),
        CrawlerConfig::default().with_handler_timeout(Duration::from_millis(100)),
    );
    let id = harness.append("ConventionSigned", serde_json::json!({}));

    let stats = harness.cycle().await;
    assert_eq!(stats.retrying, 1);

    let event = harness.outbox.get(id).unwrap();
    assert_eq!(event.publications.len(), 1);
    match &event.publications[0].outcome {
        PublicationOutcome::Failure { error } => assert!(error.contains("timed out")),
        PublicationOutcome::Success => panic!("expected a timeout failure"),
    }
}

// Store unavailability aborts the cycle; the caller (the timer loop) just
// retries on the next tick.
#[tokio::test]
async fn unreachable_store_aborts_the_cycle() {
    struct BrokenStore;

    impl OutboxStore for BrokenStore {
        fn save(
            &self,
            _event: courier_core::event::OutboxEvent,
        ) -> std::pin::Pin<
            Box<dyn std::future::Future<Output = Result<(), OutboxStoreError>> + Send + '_>,
        > {
            Box::pin(std::future::ready(Err(OutboxStoreError::DatabaseError(
                "connection refused".to_string(),
            ))))
        }

        fn load_due_events(
            &self,
            _limit: usize,
            _now: chrono::DateTime<chrono::Utc>,
            _claim_ttl: Duration,
        ) -> std::pin::Pin<
            Box<
                dyn std::future::Future<
                        Output = Result<Vec<courier_core::event::OutboxEvent>, OutboxStoreError>,
                    > + Send
                    + '_,
            >,
        > {
            Box::pin(std::future::ready(Err(OutboxStoreError::DatabaseError(
                "connection refused".to_string(),
            ))))
        }

        fn find(
            &self,
            _id: EventId,
        ) -> std::pin::Pin<
            Box<
                dyn std::future::Future<
                        Output = Result<Option<courier_core::event::OutboxEvent>, OutboxStoreError>,
                    > + Send
                    + '_,
            >,
        > {
            Box::pin(std::future::ready(Err(OutboxStoreError::DatabaseError(
                "connection refused".to_string(),
            ))))
        }
    }

    let registry = Arc::new(
        SubscriptionRegistry::builder()
            .build()
            .expect("registry should build"),
    );
    let clock: Arc<SteppingClock> = Arc::new(test_clock());
    let (crawler, _shutdown) = Crawler::new(
        Arc::new(BrokenStore),
        registry,
        default_policy(),
        clock,
        CrawlerConfig::default(),
    );

    let result = crawler.run_cycle().await;
    assert!(matches!(result, Err(CrawlerError::Store(_))));
}

// Losing the save race to another writer drops this cycle's attempt record
// without disturbing the rest of the batch; the winner's record stands.
#[tokio::test]
async fn lost_save_race_is_skipped_and_neighbours_still_publish() {
    struct RacingStore {
        inner: Arc<InMemoryOutbox>,
        contested: EventId,
    }

    impl OutboxStore for RacingStore {
        fn save(
            &self,
            event: courier_core::event::OutboxEvent,
        ) -> std::pin::Pin<
            Box<dyn std::future::Future<Output = Result<(), OutboxStoreError>> + Send + '_>,
        > {
            if event.id == self.contested {
                return Box::pin(std::future::ready(Err(
                    OutboxStoreError::ConcurrencyConflict {
                        event_id: event.id,
                        expected: event.version,
                        actual: event.version + 1,
                    },
                )));
            }
            self.inner.save(event)
        }

        fn load_due_events(
            &self,
            limit: usize,
            now: chrono::DateTime<chrono::Utc>,
            claim_ttl: Duration,
        ) -> std::pin::Pin<
            Box<
                dyn std::future::Future<
                        Output = Result<Vec<courier_core::event::OutboxEvent>, OutboxStoreError>,
                    > + Send
                    + '_,
            >,
        > {
            self.inner.load_due_events(limit, now, claim_ttl)
        }

        fn find(
            &self,
            id: EventId,
        ) -> std::pin::Pin<
            Box<
                dyn std::future::Future<
                        Output = Result<Option<courier_core::event::OutboxEvent>, OutboxStoreError>,
                    > + Send
                    + '_,
            >,
        > {
            self.inner.find(id)
        }
    }

    let email = Arc::new(RecordingHandler::new("email"));
    let outbox = Arc::new(InMemoryOutbox::new());
    let clock = Arc::new(test_clock());
    let factory = EventFactory::new(clock.clone(), Arc::new(SequentialIds::new()));
    let registry = Arc::new(
        SubscriptionRegistry::builder()
            .subscribe(Topic::new("ConventionSigned"), email.clone())
            .subscribe(Topic::new("AgencyValidated"), email.clone())
            .build()
            .expect("registry should build"),
    );

    let contested = factory.create(Topic::new("ConventionSigned"), serde_json::json!({"n": 1}));
    let contested_id = contested.id;
    let healthy = factory.create(Topic::new("AgencyValidated"), serde_json::json!({"n": 2}));
    let healthy_id = healthy.id;
    outbox.insert(contested);
    outbox.insert(healthy);

    let store = Arc::new(RacingStore {
        inner: outbox.clone(),
        contested: contested_id,
    });
    let (crawler, _shutdown) = Crawler::new(
        store,
        registry,
        RetryPolicy::default(),
        clock,
        CrawlerConfig::default(),
    );

    let stats = crawler.run_cycle().await.expect("cycle should run");
    assert_eq!(stats.fetched, 2);
    assert_eq!(stats.published, 1);
    assert_eq!(stats.skipped, 1);

    // The winner's record stands: the contested event is untouched.
    let contested = outbox.get(contested_id).unwrap();
    assert_eq!(contested.status, EventStatus::Pending);
    assert!(contested.publications.is_empty());
    assert_eq!(contested.version, 0);

    assert_eq!(outbox.get(healthy_id).unwrap().status, EventStatus::Published);
}

// Dropping the shutdown sender stops the loop instead of spinning it.
#[tokio::test(start_paused = true)]
async fn dropped_shutdown_handle_stops_the_loop() {
    let registry = Arc::new(
        SubscriptionRegistry::builder()
            .build()
            .expect("registry should build"),
    );
    let clock: Arc<SteppingClock> = Arc::new(test_clock());
    let (mut crawler, shutdown) = Crawler::new(
        Arc::new(InMemoryOutbox::new()),
        registry,
        RetryPolicy::default(),
        clock,
        CrawlerConfig::default().with_poll_interval(Duration::from_millis(10)),
    );

    drop(shutdown);
    let worker = tokio::spawn(async move { crawler.start().await });
    worker.await.expect("crawler task should join");
}

// The timer loop delivers events and stops cleanly on the shutdown signal.
#[tokio::test(start_paused = true)]
async fn start_delivers_and_stops_on_shutdown() {
    let handler = Arc::new(RecordingHandler::new("email"));
    let outbox = Arc::new(InMemoryOutbox::new());
    let clock: Arc<SteppingClock> = Arc::new(test_clock());
    let factory = EventFactory::new(clock.clone(), Arc::new(SequentialIds::new()));
    let registry = Arc::new(
        SubscriptionRegistry::builder()
            .subscribe(Topic::new("ConventionSigned"), handler.clone())
            .build()
            .expect("registry should build"),
    );

    let event = factory.create(Topic::new("ConventionSigned"), serde_json::json!({}));
    let id = event.id;
    outbox.insert(event);

    let (mut crawler, shutdown) = Crawler::new(
        outbox.clone(),
        registry,
        default_policy(),
        clock,
        CrawlerConfig::default().with_poll_interval(Duration::from_millis(10)),
    );

    let worker = tokio::spawn(async move { crawler.start().await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    shutdown.send(true).expect("crawler should still be listening");
    worker.await.expect("crawler task should join");

    assert_eq!(outbox.get(id).unwrap().status, EventStatus::Published);
    assert_eq!(handler.invocations(), 1);
}
