//! # Checkout Worker
//!
//! Background process for the checkout engine. It drains the transactional
//! outbox to webhook subscribers and sweeps abandoned payments, both on
//! [`PeriodicWorker`](checkout_runtime::PeriodicWorker) loops that stop on
//! Ctrl+C.
//!
//! [`config`] reads the environment; [`wiring`] turns the configuration into
//! gateways and subscribers.

#![forbid(unsafe_code)]

pub mod config;

pub use config::{ConfigError, LogFormat, WorkerConfig};

use checkout_core::gateway::GatewayError;
use checkout_core::subscriber::SubscriberError;
use thiserror::Error;

/// Startup failures.
#[derive(Error, Debug)]
pub enum WorkerError {
    /// Configuration could not be loaded.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A gateway client could not be built.
    #[error("gateway setup failed: {0}")]
    Gateway(#[from] GatewayError),

    /// A subscriber could not be built.
    #[error("subscriber {name} setup failed: {source}")]
    Subscriber {
        /// Subscriber name.
        name: &'static str,
        /// Underlying error.
        source: SubscriberError,
    },
}

/// Builds runtime components from [`WorkerConfig`].
pub mod wiring {
    use super::{WorkerConfig, WorkerError};
    use checkout_core::gateway::{GatewayRegistry, PaymentGateway};
    use checkout_core::subscriber::OutboxSubscriber;
    use checkout_runtime::{
        CircuitBreaker, CircuitBreakerConfig, GuardedGateway, HttpSubscriber, SandboxGateway,
        ZarinpalConfig, ZarinpalGateway,
    };
    use std::sync::Arc;
    use std::time::Duration;

    /// Gateway registry with the configured gateway as default.
    ///
    /// The sandbox is always registered so callbacks for sandbox payments
    /// still verify after switching to Zarinpal. Every gateway sits behind
    /// its own circuit breaker.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::Gateway`] if the Zarinpal client cannot be
    /// built.
    pub fn build_gateways(config: &WorkerConfig) -> Result<GatewayRegistry, WorkerError> {
        let mut registry =
            GatewayRegistry::new().with_gateway(guarded(Arc::new(SandboxGateway::default())));

        if let Some(merchant_id) = &config.payments.zarinpal_merchant_id {
            let mut zarinpal = ZarinpalConfig::new(merchant_id.clone());
            if let Some(base_url) = &config.payments.zarinpal_base_url {
                zarinpal = zarinpal.with_base_url(base_url.clone());
            }
            let gateway = ZarinpalGateway::new(zarinpal)?;
            registry = registry.with_gateway(guarded(Arc::new(gateway)));
        }

        Ok(registry.with_default(config.payments.gateway.clone()))
    }

    fn guarded(gateway: Arc<dyn PaymentGateway>) -> Arc<dyn PaymentGateway> {
        let breaker = CircuitBreaker::new(
            gateway.name().to_string(),
            CircuitBreakerConfig::builder()
                .failure_threshold(5)
                .open_duration(Duration::from_secs(30))
                .build(),
        );
        Arc::new(GuardedGateway::new(gateway, breaker))
    }

    /// One webhook subscriber per configured URL.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::Subscriber`] if an HTTP client cannot be built.
    pub fn build_subscribers(
        config: &WorkerConfig,
    ) -> Result<Vec<Arc<dyn OutboxSubscriber>>, WorkerError> {
        let timeout = Duration::from_millis(config.subscribers.timeout_ms);
        let routes: [(&'static str, &Option<String>, &[&str]); 3] = [
            ("search-index", &config.subscribers.search_index_url, &["Stock"][..]),
            (
                "cache-invalidation",
                &config.subscribers.cache_invalidation_url,
                &["Stock", "Order", "Discount"][..],
            ),
            (
                "notifications",
                &config.subscribers.notification_url,
                &["Order", "Payment", "Wallet"][..],
            ),
        ];

        let mut subscribers: Vec<Arc<dyn OutboxSubscriber>> = Vec::new();
        for (name, url, prefixes) in routes {
            let Some(url) = url else { continue };
            let subscriber = HttpSubscriber::new(name, url.clone(), timeout)
                .map_err(|source| WorkerError::Subscriber { name, source })?
                .only(prefixes.iter().copied());
            subscribers.push(Arc::new(subscriber));
        }
        Ok(subscribers)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> WorkerConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        WorkerConfig::from_lookup(|var| vars.get(var).cloned()).unwrap()
    }

    #[test]
    fn sandbox_is_the_default_gateway() {
        let registry = wiring::build_gateways(&config(&[])).unwrap();

        assert_eq!(registry.default_gateway().unwrap().name(), "sandbox");
        assert!(registry.get("zarinpal").is_err());
    }

    #[test]
    fn zarinpal_becomes_default_when_selected() {
        let registry = wiring::build_gateways(&config(&[
            ("PAYMENT_GATEWAY", "zarinpal"),
            ("ZARINPAL_MERCHANT_ID", "00000000-0000-0000-0000-000000000000"),
        ]))
        .unwrap();

        assert_eq!(registry.default_gateway().unwrap().name(), "zarinpal");
        assert!(registry.get("sandbox").is_ok());
    }

    #[test]
    fn subscribers_follow_configured_urls() {
        let subscribers = wiring::build_subscribers(&config(&[
            ("SEARCH_INDEX_WEBHOOK_URL", "http://search.local/hooks"),
            ("NOTIFICATION_WEBHOOK_URL", "http://notify.local/hooks"),
        ]))
        .unwrap();

        let names: Vec<&str> = subscribers.iter().map(|s| s.name()).collect();
        assert_eq!(names, vec!["search-index", "notifications"]);
        assert!(subscribers[0].interested_in("StockReserved.v1"));
        assert!(!subscribers[0].interested_in("OrderPaid.v1"));
        assert!(subscribers[1].interested_in("PaymentFailed.v1"));
    }

    #[test]
    fn no_urls_means_no_subscribers() {
        assert!(wiring::build_subscribers(&config(&[])).unwrap().is_empty());
    }
}
