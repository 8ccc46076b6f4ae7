//! Engine tuning knobs.

use checkout_runtime::retry::RetryPolicy;
use std::time::Duration;

/// Settings shared by the checkout and payment services.
#[derive(Debug, Clone)]
pub struct CheckoutSettings {
    /// How long a customer has to finish paying.
    pub payment_ttl: Duration,
    /// URL the gateway redirects the customer to afterwards.
    pub callback_url: String,
    /// Abandoned payments and orders handled per cleanup run.
    pub cleanup_batch_size: u32,
    /// Retries of gateway verification on transient failures.
    pub verify_retry: RetryPolicy,
}

impl Default for CheckoutSettings {
    fn default() -> Self {
        Self {
            payment_ttl: Duration::from_secs(15 * 60),
            callback_url: "http://localhost:8080/payments/callback".to_string(),
            cleanup_batch_size: 100,
            verify_retry: RetryPolicy::builder()
                .max_retries(2)
                .initial_delay(Duration::from_millis(200))
                .build(),
        }
    }
}

impl CheckoutSettings {
    /// Builder starting from the defaults.
    #[must_use]
    pub fn builder() -> CheckoutSettingsBuilder {
        CheckoutSettingsBuilder {
            settings: Self::default(),
        }
    }

    pub(crate) fn payment_ttl_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.payment_ttl).unwrap_or_else(|_| chrono::Duration::minutes(15))
    }
}

/// Builder for [`CheckoutSettings`].
#[derive(Debug, Clone)]
pub struct CheckoutSettingsBuilder {
    settings: CheckoutSettings,
}

impl CheckoutSettingsBuilder {
    /// How long a customer has to finish paying.
    #[must_use]
    pub const fn payment_ttl(mut self, ttl: Duration) -> Self {
        self.settings.payment_ttl = ttl;
        self
    }

    /// Gateway callback URL.
    #[must_use]
    pub fn callback_url(mut self, url: impl Into<String>) -> Self {
        self.settings.callback_url = url.into();
        self
    }

    /// Items handled per cleanup run (at least 1).
    #[must_use]
    pub fn cleanup_batch_size(mut self, size: u32) -> Self {
        self.settings.cleanup_batch_size = size.max(1);
        self
    }

    /// Retry policy for gateway verification.
    #[must_use]
    pub fn verify_retry(mut self, policy: RetryPolicy) -> Self {
        self.settings.verify_retry = policy;
        self
    }

    /// Finishes the settings.
    #[must_use]
    pub fn build(self) -> CheckoutSettings {
        self.settings
    }
}
