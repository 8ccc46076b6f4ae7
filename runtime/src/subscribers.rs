//! Webhook delivery of outbox messages.
//!
//! The search index, cache invalidation and notification services each get
//! an [`HttpSubscriber`] pointed at their endpoint. The message id travels in
//! the `Idempotency-Key` header so receivers can drop redeliveries.

use checkout_core::model::OutboxMessage;
use checkout_core::subscriber::{OutboxSubscriber, SubscriberError, SubscriberFuture};
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;

/// Longest response body kept in a stored error.
const MAX_ERROR_BODY: usize = 512;

#[derive(Serialize)]
struct Delivery<'a> {
    id: String,
    #[serde(rename = "type")]
    message_type: &'a str,
    occurred_at: chrono::DateTime<chrono::Utc>,
    correlation_id: uuid::Uuid,
    payload: &'a serde_json::Value,
}

/// Posts outbox messages as JSON to a fixed URL.
#[derive(Clone)]
pub struct HttpSubscriber {
    name: String,
    url: String,
    client: Client,
    /// Type prefixes this subscriber accepts; empty means all.
    prefixes: Vec<String>,
}

impl HttpSubscriber {
    /// Subscriber named `name` posting to `url`.
    ///
    /// # Errors
    ///
    /// Returns [`SubscriberError::Delivery`] if the HTTP client cannot be
    /// built.
    pub fn new(
        name: impl Into<String>,
        url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, SubscriberError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SubscriberError::Delivery(e.to_string()))?;
        Ok(Self {
            name: name.into(),
            url: url.into(),
            client,
            prefixes: Vec::new(),
        })
    }

    /// Restricts delivery to message types starting with one of `prefixes`,
    /// e.g. `"Stock"` for every stock event.
    #[must_use]
    pub fn only<I, S>(mut self, prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.prefixes = prefixes.into_iter().map(Into::into).collect();
        self
    }

    async fn post(&self, message: &OutboxMessage) -> Result<(), SubscriberError> {
        let body = Delivery {
            id: message.id.to_string(),
            message_type: &message.message_type,
            occurred_at: message.occurred_at,
            correlation_id: message.correlation_id,
            payload: &message.payload,
        };

        let response = self
            .client
            .post(&self.url)
            .header("Idempotency-Key", message.id.to_string())
            .json(&body)
            .send()
            .await
            .map_err(|e| SubscriberError::Delivery(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            tracing::trace!(subscriber = %self.name, message_id = %message.id, "Delivered");
            return Ok(());
        }
        let mut body = response.text().await.unwrap_or_default();
        if body.len() > MAX_ERROR_BODY {
            let mut end = MAX_ERROR_BODY;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            body.truncate(end);
        }
        Err(SubscriberError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}

impl OutboxSubscriber for HttpSubscriber {
    fn name(&self) -> &str {
        &self.name
    }

    fn interested_in(&self, message_type: &str) -> bool {
        self.prefixes.is_empty() || self.prefixes.iter().any(|p| message_type.starts_with(p.as_str()))
    }

    fn handle<'a>(&'a self, message: &'a OutboxMessage) -> SubscriberFuture<'a> {
        Box::pin(self.post(message))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn prefixes_filter_message_types() {
        let all = HttpSubscriber::new("cache", "http://cache.test/hook", Duration::from_secs(1)).unwrap();
        assert!(all.interested_in("OrderPaid.v1"));

        let stock = HttpSubscriber::new("search", "http://search.test/hook", Duration::from_secs(1))
            .unwrap()
            .only(["Stock", "OrderPaid"]);
        assert!(stock.interested_in("StockCommitted.v1"));
        assert!(stock.interested_in("OrderPaid.v1"));
        assert!(!stock.interested_in("WalletCredited.v1"));
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_a_delivery_error() {
        let subscriber =
            HttpSubscriber::new("notify", "http://127.0.0.1:9/hook", Duration::from_millis(200)).unwrap();
        let event = checkout_core::event::DomainEvent::OrderCancelled {
            order_id: checkout_core::types::OrderId::new(),
            user_id: checkout_core::types::UserId::new(),
            reason: "payment failed".into(),
        };
        let message = OutboxMessage::from_event(&event, chrono::Utc::now(), uuid::Uuid::new_v4()).unwrap();

        let result = subscriber.handle(&message).await;

        assert!(matches!(result, Err(SubscriberError::Delivery(_))));
    }
}
