//! Outbox subscribers for dispatcher tests.

use checkout_core::model::OutboxMessage;
use checkout_core::subscriber::{OutboxSubscriber, SubscriberError, SubscriberFuture};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Records every message it receives.
#[derive(Clone, Debug)]
pub struct RecordingSubscriber {
    name: String,
    types: Option<Vec<String>>,
    received: Arc<Mutex<Vec<OutboxMessage>>>,
}

impl RecordingSubscriber {
    /// Subscriber interested in every message type.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            types: None,
            received: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Restricts the subscriber to the given message types.
    #[must_use]
    pub fn only(mut self, types: &[&str]) -> Self {
        self.types = Some(types.iter().map(ToString::to_string).collect());
        self
    }

    /// Messages received so far.
    #[must_use]
    pub fn received(&self) -> Vec<OutboxMessage> {
        self.received
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Types of the messages received so far.
    #[must_use]
    pub fn received_types(&self) -> Vec<String> {
        self.received()
            .into_iter()
            .map(|m| m.message_type)
            .collect()
    }
}

impl OutboxSubscriber for RecordingSubscriber {
    fn name(&self) -> &str {
        &self.name
    }

    fn interested_in(&self, message_type: &str) -> bool {
        self.types
            .as_ref()
            .is_none_or(|types| types.iter().any(|t| t == message_type))
    }

    fn handle<'a>(&'a self, message: &'a OutboxMessage) -> SubscriberFuture<'a> {
        Box::pin(async move {
            self.received
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(message.clone());
            Ok(())
        })
    }
}

/// Fails a fixed number of deliveries, then succeeds.
#[derive(Clone, Debug)]
pub struct FlakySubscriber {
    name: String,
    remaining_failures: Arc<AtomicU32>,
    calls: Arc<AtomicU32>,
}

impl FlakySubscriber {
    /// Subscriber that fails the first `failures` deliveries.
    #[must_use]
    pub fn failing(name: impl Into<String>, failures: u32) -> Self {
        Self {
            name: name.into(),
            remaining_failures: Arc::new(AtomicU32::new(failures)),
            calls: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Subscriber that never succeeds.
    #[must_use]
    pub fn always_failing(name: impl Into<String>) -> Self {
        Self::failing(name, u32::MAX)
    }

    /// Deliveries attempted so far.
    #[must_use]
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl OutboxSubscriber for FlakySubscriber {
    fn name(&self) -> &str {
        &self.name
    }

    fn interested_in(&self, _message_type: &str) -> bool {
        true
    }

    fn handle<'a>(&'a self, _message: &'a OutboxMessage) -> SubscriberFuture<'a> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let failed = self
                .remaining_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failed {
                Err(SubscriberError::Delivery(format!(
                    "{} is unavailable",
                    self.name
                )))
            } else {
                Ok(())
            }
        })
    }
}
