//! Payment gateway abstraction.
//!
//! A gateway issues an `authority` token for a payment request and later
//! verifies whether the customer actually paid. Implementations live in the
//! runtime crate (HTTP providers) and the testing crate (scripted gateways);
//! the engine only sees [`PaymentGateway`] trait objects picked from a
//! [`GatewayRegistry`] by configured name.

use crate::types::{Money, OrderId};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;

/// Gateway result.
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Boxed future returned by gateway calls.
pub type GatewayFuture<'a, T> = Pin<Box<dyn Future<Output = GatewayResult<T>> + Send + 'a>>;

/// Payment provider failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// The provider refused the request.
    #[error("gateway rejected the request (code {code}): {message}")]
    Rejected {
        /// Provider error code.
        code: i64,
        /// Provider message.
        message: String,
    },

    /// The provider did not answer in time.
    #[error("gateway timed out")]
    Timeout,

    /// Network or HTTP failure.
    #[error("gateway transport error: {0}")]
    Transport(String),

    /// The response could not be understood.
    #[error("invalid gateway response: {0}")]
    InvalidResponse(String),

    /// Calls are short-circuited after repeated failures.
    #[error("gateway circuit is open")]
    CircuitOpen,

    /// No gateway registered under that name.
    #[error("unknown gateway: {0}")]
    UnknownGateway(String),
}

impl GatewayError {
    /// Whether retrying the same call may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout | Self::Transport(_))
    }
}

/// Parameters of a payment request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PaymentRequest {
    /// Order being paid.
    pub order_id: OrderId,
    /// Amount to collect.
    pub amount: Money,
    /// Text shown on the payment page.
    pub description: String,
    /// Where the provider redirects the customer afterwards.
    pub callback_url: String,
    /// Customer e-mail or phone, when known.
    pub contact: Option<String>,
}

/// Successful payment request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PaymentRedirect {
    /// Provider token identifying the payment.
    pub authority: String,
    /// Payment page the customer must visit.
    pub redirect_url: String,
}

/// Result of verifying an authority.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PaymentVerification {
    /// Whether the money was collected.
    pub success: bool,
    /// Provider receipt number.
    pub ref_id: Option<String>,
    /// Provider message when unsuccessful.
    pub message: Option<String>,
}

/// A payment provider.
///
/// # Dyn Compatibility
///
/// Methods return boxed futures so gateways can be stored as
/// `Arc<dyn PaymentGateway>`.
pub trait PaymentGateway: Send + Sync {
    /// Name used in configuration and stored on transactions.
    fn name(&self) -> &str;

    /// Requests a payment page for `request`.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError`] if the provider refuses or cannot be reached.
    fn request_payment(&self, request: PaymentRequest) -> GatewayFuture<'_, PaymentRedirect>;

    /// Verifies the payment identified by `authority`.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError`] if the provider cannot be reached or answers
    /// with something unexpected. A declined payment is an `Ok` result with
    /// `success == false`.
    fn verify_payment(&self, authority: String, amount: Money) -> GatewayFuture<'_, PaymentVerification>;
}

/// Gateways available to the engine, keyed by name.
#[derive(Clone, Default)]
pub struct GatewayRegistry {
    gateways: HashMap<String, Arc<dyn PaymentGateway>>,
    default: Option<String>,
}

impl GatewayRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a gateway; the first one registered becomes the default.
    #[must_use]
    pub fn with_gateway(mut self, gateway: Arc<dyn PaymentGateway>) -> Self {
        let name = gateway.name().to_string();
        if self.default.is_none() {
            self.default = Some(name.clone());
        }
        self.gateways.insert(name, gateway);
        self
    }

    /// Selects the gateway used for new payments.
    #[must_use]
    pub fn with_default(mut self, name: impl Into<String>) -> Self {
        self.default = Some(name.into());
        self
    }

    /// Gateway registered under `name`.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::UnknownGateway`] if none is registered.
    pub fn get(&self, name: &str) -> GatewayResult<Arc<dyn PaymentGateway>> {
        self.gateways
            .get(name)
            .cloned()
            .ok_or_else(|| GatewayError::UnknownGateway(name.to_string()))
    }

    /// Gateway used for new payments.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::UnknownGateway`] if the registry is empty or the
    /// configured default is not registered.
    pub fn default_gateway(&self) -> GatewayResult<Arc<dyn PaymentGateway>> {
        let name = self
            .default
            .as_deref()
            .ok_or_else(|| GatewayError::UnknownGateway("<none>".to_string()))?;
        self.get(name)
    }
}

impl std::fmt::Debug for GatewayRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.gateways.keys().collect();
        names.sort();
        f.debug_struct("GatewayRegistry")
            .field("gateways", &names)
            .field("default", &self.default)
            .finish()
    }
}
