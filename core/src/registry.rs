//! Subscription registry: the immutable topic-to-handler mapping.
//!
//! Built once at process start and injected by reference into the crawler,
//! never mutated at runtime. This replaces the hidden-global-map shape such
//! systems tend to grow: the set of emittable topics is closed when
//! [`SubscriptionRegistryBuilder::build`] runs, so "unknown topic" cannot
//! occur at dispatch time, and tests stay deterministic.
//!
//! A declared topic with zero subscribers is valid: events on it are
//! vacuously published on their first crawl pass.
//!
//! Subscription membership is evaluated at dispatch time against this
//! registry. A handler registered after an event was already marked
//! published is never retroactively invoked for that event.

use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;

use crate::event::Topic;

/// Error returned by a handler invocation.
///
/// The crawler treats handlers as opaque and independently failing; it
/// records this error in the event's publication log and never lets it
/// escape the dispatch loop.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct HandlerError {
    /// Human-readable failure detail, recorded for triage.
    pub message: String,
}

impl HandlerError {
    /// Create a handler error from any displayable message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// A downstream consumer of events: notification sender, PDF generator,
/// magic-link issuer, third-party webhook caller.
///
/// Handlers are owned by other subsystems. The crawler only knows their
/// stable `name` (used for per-handler success bookkeeping) and their
/// `handle` entry point. Handlers must be idempotent: delivery is
/// at-least-once and a handler may see the same payload more than once.
pub trait EventHandler: Send + Sync {
    /// Stable identifier used in the publication log. Renaming a handler
    /// resets its success bookkeeping for in-flight events.
    fn name(&self) -> &str;

    /// Process one event payload.
    fn handle<'a>(
        &'a self,
        payload: &'a Value,
    ) -> Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + 'a>>;
}

/// Errors detected while building a registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Two handlers with the same name subscribed to one topic; success
    /// bookkeeping is keyed by handler name, so this would conflate them.
    #[error("duplicate handler '{handler}' on topic '{topic}'")]
    DuplicateHandler {
        /// The topic carrying the duplicate.
        topic: Topic,
        /// The conflicting handler name.
        handler: String,
    },
}

/// Immutable mapping from topic to its ordered list of handlers.
///
/// Within one event, handlers run in the order they were subscribed.
pub struct SubscriptionRegistry {
    subscriptions: BTreeMap<Topic, Vec<Arc<dyn EventHandler>>>,
}

impl SubscriptionRegistry {
    /// Start building a registry.
    #[must_use]
    pub fn builder() -> SubscriptionRegistryBuilder {
        SubscriptionRegistryBuilder {
            subscriptions: BTreeMap::new(),
        }
    }

    /// Handlers subscribed to `topic`, in subscription order.
    ///
    /// Returns an empty slice for a topic with no subscribers.
    #[must_use]
    pub fn handlers_for(&self, topic: &Topic) -> &[Arc<dyn EventHandler>] {
        self.subscriptions.get(topic).map_or(&[], Vec::as_slice)
    }

    /// Whether `topic` was declared when the registry was built.
    #[must_use]
    pub fn is_declared(&self, topic: &Topic) -> bool {
        self.subscriptions.contains_key(topic)
    }

    /// All declared topics.
    pub fn topics(&self) -> impl Iterator<Item = &Topic> {
        self.subscriptions.keys()
    }
}

impl std::fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut map = f.debug_map();
        for (topic, handlers) in &self.subscriptions {
            map.entry(
                &topic.as_str(),
                &handlers.iter().map(|h| h.name()).collect::<Vec<_>>(),
            );
        }
        map.finish()
    }
}

/// Builder for [`SubscriptionRegistry`].
pub struct SubscriptionRegistryBuilder {
    subscriptions: BTreeMap<Topic, Vec<Arc<dyn EventHandler>>>,
}

impl SubscriptionRegistryBuilder {
    /// Declare a topic without subscribing anyone to it.
    ///
    /// Events on a declared, subscriber-less topic are marked published on
    /// their first crawl pass.
    #[must_use]
    pub fn declare_topic(mut self, topic: Topic) -> Self {
        self.subscriptions.entry(topic).or_default();
        self
    }

    /// Subscribe a handler to a topic, declaring the topic if needed.
    ///
    /// Handlers run in subscription order within one event.
    #[must_use]
    pub fn subscribe(mut self, topic: Topic, handler: Arc<dyn EventHandler>) -> Self {
        self.subscriptions.entry(topic).or_default().push(handler);
        self
    }

    /// Freeze the registry.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::DuplicateHandler`] if two handlers with the
    /// same name are subscribed to one topic.
    pub fn build(self) -> Result<SubscriptionRegistry, RegistryError> {
        for (topic, handlers) in &self.subscriptions {
            let mut seen = std::collections::BTreeSet::new();
            for handler in handlers {
                if !seen.insert(handler.name()) {
                    return Err(RegistryError::DuplicateHandler {
                        topic: topic.clone(),
                        handler: handler.name().to_string(),
                    });
                }
            }
        }
        Ok(SubscriptionRegistry {
            subscriptions: self.subscriptions,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;

    struct NamedHandler(&'static str);

    impl EventHandler for NamedHandler {
        fn name(&self) -> &str {
            self.0
        }

        fn handle<'a>(
            &'a self,
            _payload: &'a Value,
        ) -> Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + 'a>> {
            Box::pin(async { Ok(()) })
        }
    }

    #[test]
    fn handlers_run_in_subscription_order() {
        let topic = Topic::new("ConventionSigned");
        let registry = SubscriptionRegistry::builder()
            .subscribe(topic.clone(), Arc::new(NamedHandler("email")))
            .subscribe(topic.clone(), Arc::new(NamedHandler("sms")))
            .subscribe(topic.clone(), Arc::new(NamedHandler("pdf")))
            .build()
            .expect("registry should build");

        let names: Vec<&str> = registry
            .handlers_for(&topic)
            .iter()
            .map(|h| h.name())
            .collect();
        assert_eq!(names, vec!["email", "sms", "pdf"]);
    }

    #[test]
    fn declared_topic_without_subscribers_is_valid() {
        let topic = Topic::new("AgencyValidated");
        let registry = SubscriptionRegistry::builder()
            .declare_topic(topic.clone())
            .build()
            .expect("registry should build");
        assert!(registry.is_declared(&topic));
        assert!(registry.handlers_for(&topic).is_empty());
    }

    #[test]
    fn undeclared_topic_has_no_handlers() {
        let registry = SubscriptionRegistry::builder()
            .build()
            .expect("registry should build");
        let topic = Topic::new("Never");
        assert!(!registry.is_declared(&topic));
        assert!(registry.handlers_for(&topic).is_empty());
    }

    #[test]
    fn duplicate_handler_name_on_topic_is_rejected() {
        let topic = Topic::new("ConventionSigned");
        let result = SubscriptionRegistry::builder()
            .subscribe(topic.clone(), Arc::new(NamedHandler("email")))
            .subscribe(topic, Arc::new(NamedHandler("email")))
            .build();
        assert!(matches!(
            result,
            Err(RegistryError::DuplicateHandler { handler, .. }) if handler == "email"
        ));
    }

    #[test]
    fn same_handler_name_on_different_topics_is_allowed() {
        let result = SubscriptionRegistry::builder()
            .subscribe(Topic::new("A"), Arc::new(NamedHandler("email")))
            .subscribe(Topic::new("B"), Arc::new(NamedHandler("email")))
            .build();
        assert!(result.is_ok());
    }
}
