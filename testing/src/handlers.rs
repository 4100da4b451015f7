//! Scripted handlers for driving the crawler through every delivery path.

use courier_core::registry::{EventHandler, HandlerError};
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

fn lock_payloads(payloads: &Mutex<Vec<Value>>) -> std::sync::MutexGuard<'_, Vec<Value>> {
    payloads
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Handler that always succeeds and records every payload it receives.
#[derive(Debug)]
pub struct RecordingHandler {
    name: String,
    payloads: Mutex<Vec<Value>>,
}

impl RecordingHandler {
    /// Create a recording handler with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            payloads: Mutex::new(Vec::new()),
        }
    }

    /// Number of times the handler has been invoked.
    #[must_use]
    pub fn invocations(&self) -> usize {
        lock_payloads(&self.payloads).len()
    }

    /// Copies of every payload received, in invocation order.
    #[must_use]
    pub fn payloads(&self) -> Vec<Value> {
        lock_payloads(&self.payloads).clone()
    }
}

impl EventHandler for RecordingHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn handle<'a>(
        &'a self,
        payload: &'a Value,
    ) -> Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + 'a>> {
        Box::pin(async move {
            lock_payloads(&self.payloads).push(payload.clone());
            Ok(())
        })
    }
}

/// Handler that fails its first `fail_first` invocations, then succeeds.
///
/// Models a flaky downstream (an SMS provider having a bad minute).
#[derive(Debug)]
pub struct FlakyHandler {
    name: String,
    fail_first: u32,
    calls: AtomicU32,
}

impl FlakyHandler {
    /// Create a handler that fails `fail_first` times before succeeding.
    pub fn new(name: impl Into<String>, fail_first: u32) -> Self {
        Self {
            name: name.into(),
            fail_first,
            calls: AtomicU32::new(0),
        }
    }

    /// Number of times the handler has been invoked.
    #[must_use]
    pub fn invocations(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl EventHandler for FlakyHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn handle<'a>(
        &'a self,
        _payload: &'a Value,
    ) -> Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + 'a>> {
        Box::pin(async move {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                Err(HandlerError::new(format!(
                    "simulated transient failure on call {}",
                    call + 1
                )))
            } else {
                Ok(())
            }
        })
    }
}

/// Handler that always fails with the same error.
#[derive(Debug)]
pub struct FailingHandler {
    name: String,
    error: String,
    calls: AtomicU32,
}

impl FailingHandler {
    /// Create a handler that fails every invocation with `error`.
    pub fn new(name: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            error: error.into(),
            calls: AtomicU32::new(0),
        }
    }

    /// Number of times the handler has been invoked.
    #[must_use]
    pub fn invocations(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl EventHandler for FailingHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn handle<'a>(
        &'a self,
        _payload: &'a Value,
    ) -> Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + 'a>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(HandlerError::new(self.error.clone()))
        })
    }
}

/// Handler that sleeps before succeeding, for exercising the per-handler
/// timeout.
#[derive(Debug)]
pub struct SlowHandler {
    name: String,
    delay: Duration,
}

impl SlowHandler {
    /// Create a handler that sleeps `delay` before succeeding.
    pub fn new(name: impl Into<String>, delay: Duration) -> Self {
        Self {
            name: name.into(),
            delay,
        }
    }
}

impl EventHandler for SlowHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn handle<'a>(
        &'a self,
        _payload: &'a Value,
    ) -> Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + 'a>> {
        Box::pin(async move {
            tokio::time::sleep(self.delay).await;
            Ok(())
        })
    }
}
