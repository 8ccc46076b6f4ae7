//! Transactional outbox rows.

use crate::event::DomainEvent;
use crate::types::OutboxMessageId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A domain event waiting to be published.
///
/// Rows are written in the same transaction as the state change they record
/// and are never deleted; publishing only sets `processed_at`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutboxMessage {
    /// Row identifier.
    pub id: OutboxMessageId,
    /// Versioned event type, e.g. `OrderPlaced.v1`.
    pub message_type: String,
    /// Serialized [`DomainEvent`].
    pub payload: serde_json::Value,
    /// When the event happened.
    pub occurred_at: DateTime<Utc>,
    /// When every subscriber accepted the event.
    pub processed_at: Option<DateTime<Utc>>,
    /// Last delivery error.
    pub error: Option<String>,
    /// Failed delivery attempts.
    pub attempts: u32,
    /// Lease held by a dispatcher.
    pub locked_until: Option<DateTime<Utc>>,
    /// Request the event originated from.
    pub correlation_id: Uuid,
}

impl OutboxMessage {
    /// Serializes `event` into a fresh row.
    ///
    /// # Errors
    ///
    /// Returns the `serde_json` error if the event cannot be serialized.
    pub fn from_event(
        event: &DomainEvent,
        occurred_at: DateTime<Utc>,
        correlation_id: Uuid,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            id: OutboxMessageId::new(),
            message_type: event.event_type().to_string(),
            payload: serde_json::to_value(event)?,
            occurred_at,
            processed_at: None,
            error: None,
            attempts: 0,
            locked_until: None,
            correlation_id,
        })
    }

    /// Deserializes the payload back into a [`DomainEvent`].
    ///
    /// # Errors
    ///
    /// Returns the `serde_json` error if the payload is not a known event.
    pub fn event(&self) -> Result<DomainEvent, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }

    /// Whether a dispatcher may claim this row at `now`.
    #[must_use]
    pub fn is_claimable(&self, now: DateTime<Utc>, max_attempts: u32) -> bool {
        self.processed_at.is_none()
            && self.attempts < max_attempts
            && self.locked_until.is_none_or(|until| until <= now)
    }

    /// Whether the row exhausted its attempts and waits for an operator.
    #[must_use]
    pub const fn is_parked(&self, max_attempts: u32) -> bool {
        self.processed_at.is_none() && self.attempts >= max_attempts
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::types::{OrderId, UserId};
    use chrono::Duration;

    fn message() -> OutboxMessage {
        let event = DomainEvent::OrderCancelled {
            order_id: OrderId::new(),
            user_id: UserId::new(),
            reason: "payment failed".into(),
        };
        OutboxMessage::from_event(&event, Utc::now(), Uuid::new_v4()).unwrap()
    }

    #[test]
    fn payload_round_trips_to_the_event() {
        let msg = message();
        assert_eq!(msg.message_type, "OrderCancelled.v1");
        assert!(matches!(msg.event().unwrap(), DomainEvent::OrderCancelled { .. }));
    }

    #[test]
    fn leased_rows_are_not_claimable_until_the_lease_expires() {
        let now = Utc::now();
        let mut msg = message();
        msg.locked_until = Some(now + Duration::seconds(30));
        assert!(!msg.is_claimable(now, 5));
        assert!(msg.is_claimable(now + Duration::seconds(30), 5));
    }

    #[test]
    fn exhausted_rows_are_parked() {
        let mut msg = message();
        msg.attempts = 5;
        assert!(msg.is_parked(5));
        assert!(!msg.is_claimable(Utc::now(), 5));
    }
}
