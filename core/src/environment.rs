//! Injected dependency traits.
//!
//! Time and identifier generation are abstracted behind traits so that the
//! crawler and the publisher stay deterministic under test. Production code
//! uses [`SystemClock`] and [`UuidGenerator`]; `courier-testing` provides
//! controllable counterparts.

use crate::event::EventId;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Clock trait - abstracts time operations for testability.
///
/// # Examples
///
/// ```
/// use courier_core::environment::{Clock, SystemClock};
///
/// let clock = SystemClock;
/// let now = clock.now();
/// assert!(now <= clock.now());
/// ```
pub trait Clock: Send + Sync {
    /// Get the current time.
    fn now(&self) -> DateTime<Utc>;
}

/// Production clock backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Supplies unique event identifiers.
pub trait IdGenerator: Send + Sync {
    /// Generate a fresh, unique event id.
    fn next_id(&self) -> EventId;
}

/// Production id generator backed by random v4 UUIDs.
#[derive(Debug, Clone, Copy, Default)]
pub struct UuidGenerator;

impl IdGenerator for UuidGenerator {
    fn next_id(&self) -> EventId {
        EventId::new(Uuid::new_v4())
    }
}
