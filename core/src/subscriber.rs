//! Consumers of published outbox messages.

use crate::model::OutboxMessage;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Delivery failure reported by a subscriber.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubscriberError {
    /// Downstream system could not be reached.
    #[error("delivery failed: {0}")]
    Delivery(String),

    /// Downstream system refused the message.
    #[error("message rejected with status {status}: {body}")]
    Rejected {
        /// Response status.
        status: u16,
        /// Response body, truncated.
        body: String,
    },

    /// The message payload could not be read.
    #[error("unreadable message: {0}")]
    Decode(String),
}

/// Boxed future returned by [`OutboxSubscriber::handle`].
pub type SubscriberFuture<'a> = Pin<Box<dyn Future<Output = Result<(), SubscriberError>> + Send + 'a>>;

/// Receives outbox messages after they were committed.
///
/// Delivery is at-least-once: a message is redelivered until every interested
/// subscriber has accepted it, so handlers must tolerate duplicates.
pub trait OutboxSubscriber: Send + Sync {
    /// Name used in logs, metrics and stored errors.
    fn name(&self) -> &str;

    /// Whether this subscriber wants messages of `message_type`.
    fn interested_in(&self, message_type: &str) -> bool;

    /// Handles one message.
    fn handle<'a>(&'a self, message: &'a OutboxMessage) -> SubscriberFuture<'a>;
}
