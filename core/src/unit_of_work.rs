//! Transaction boundary helpers.
//!
//! Commands follow one shape:
//!
//! ```ignore
//! let mut tx = uow.begin().await?;
//! let result = Self::reserve_in(tx.as_mut(), ...).await;
//! finish(tx, result).await
//! ```
//!
//! The body runs against `&mut dyn Transaction` so it can also be composed
//! into a larger command (checkout, payment settlement) that owns the
//! transaction.

use crate::context::RequestContext;
use crate::error::{CheckoutError, StoreError};
use crate::event::DomainEvent;
use crate::model::OutboxMessage;
use crate::store::Transaction;
use chrono::{DateTime, Utc};
use std::fmt::Display;

/// Error a transaction body can end with.
pub trait TransactionError: From<StoreError> + Display {
    /// Whether a rollback caused by this error is logged at error level.
    fn is_fatal(&self) -> bool;
}

impl TransactionError for CheckoutError {
    fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

impl TransactionError for StoreError {
    fn is_fatal(&self) -> bool {
        false
    }
}

/// Commits on `Ok`, rolls back on `Err`.
///
/// # Errors
///
/// Returns the body's error after rolling back, or the commit error.
pub async fn finish<T, E: TransactionError>(
    tx: Box<dyn Transaction>,
    result: Result<T, E>,
) -> Result<T, E> {
    match result {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(error) => {
            if let Err(rollback_error) = tx.rollback().await {
                tracing::error!(error = %rollback_error, "Rollback failed");
            }
            if error.is_fatal() {
                tracing::error!(%error, "Transaction rolled back after fatal error");
            } else {
                tracing::debug!(%error, "Transaction rolled back");
            }
            Err(error)
        }
    }
}

/// Rolls back a transaction used only for reading.
///
/// # Errors
///
/// Returns the body's error.
pub async fn discard<T, E>(tx: Box<dyn Transaction>, result: Result<T, E>) -> Result<T, E> {
    if let Err(rollback_error) = tx.rollback().await {
        tracing::warn!(error = %rollback_error, "Rollback of read transaction failed");
    }
    result
}

/// Appends `event` to the outbox inside `tx`.
///
/// # Errors
///
/// Returns [`CheckoutError::Fatal`] if the event cannot be serialized or stored.
pub async fn record_event(
    tx: &mut dyn Transaction,
    ctx: &RequestContext,
    event: &DomainEvent,
    occurred_at: DateTime<Utc>,
) -> Result<(), CheckoutError> {
    let message = OutboxMessage::from_event(event, occurred_at, ctx.correlation_id)
        .map_err(StoreError::from)?;
    tracing::trace!(message_type = %message.message_type, "Recording outbox message");
    tx.append_outbox_message(message).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_fatal_checkout_errors_log_loudly() {
        assert!(CheckoutError::Fatal("disk full".to_string()).is_fatal());
        assert!(!CheckoutError::from(StoreError::not_found("order", "o-1")).is_fatal());
        assert!(!StoreError::Database("gone".to_string()).is_fatal());
    }
}
