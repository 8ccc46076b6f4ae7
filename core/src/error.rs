//! Error taxonomy of the checkout engine.
//!
//! Persistence backends report [`StoreError`]. Services translate those into
//! [`CheckoutError`], whose variants tell callers what to do next:
//!
//! - [`CheckoutError::NotFound`]: the addressed record does not exist
//! - [`CheckoutError::ConcurrencyConflict`]: a competing writer won; the caller
//!   may re-read and resubmit, the engine never retries on its own
//! - [`CheckoutError::BusinessRule`]: a structured, expected rejection
//! - [`CheckoutError::Gateway`]: the payment provider failed
//! - [`CheckoutError::Fatal`]: the store or serialization failed; the
//!   transaction was rolled back and the details were logged

use crate::gateway::GatewayError;
use crate::types::{Money, VariantId};
use thiserror::Error;

/// Errors raised by persistence backends.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// A row changed since it was read.
    #[error("concurrency conflict on {entity} {id}: expected version {expected}, found {actual}")]
    ConcurrencyConflict {
        /// Table or aggregate name.
        entity: &'static str,
        /// Row identifier.
        id: String,
        /// Version the writer presented.
        expected: u64,
        /// Version currently stored.
        actual: u64,
    },

    /// A unique constraint rejected the write.
    #[error("unique constraint violated: {constraint}")]
    UniqueViolation {
        /// Constraint name.
        constraint: String,
    },

    /// A row addressed by id does not exist.
    #[error("{entity} not found: {id}")]
    RowNotFound {
        /// Table or aggregate name.
        entity: &'static str,
        /// Row identifier.
        id: String,
    },

    /// Connection, query or transaction failure.
    #[error("database error: {0}")]
    Database(String),

    /// A stored value could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Convenience constructor for [`StoreError::RowNotFound`].
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::RowNotFound {
            entity,
            id: id.to_string(),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(error: serde_json::Error) -> Self {
        Self::Serialization(error.to_string())
    }
}

/// Why a discount code was not applied.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscountRejection {
    /// No code with that text.
    #[error("discount code does not exist")]
    NotFound,
    /// Switched off or deleted.
    #[error("discount code is not active")]
    Inactive,
    /// Validity window has not opened.
    #[error("discount code is not valid yet")]
    NotStarted,
    /// Validity window has closed.
    #[error("discount code has expired")]
    Expired,
    /// Confirmed plus pending usages reached the cap.
    #[error("discount code usage limit reached")]
    UsageLimitReached,
    /// The customer used the code too often.
    #[error("discount code already used the maximum number of times by this customer")]
    PerUserLimitReached,
    /// Cart total below the code's minimum.
    #[error("order total is below the minimum of {minimum}")]
    MinimumNotMet {
        /// Required subtotal.
        minimum: Money,
    },
    /// No cart line is eligible.
    #[error("no item in the cart is eligible for this discount code")]
    OutOfScope,
}

/// Expected, structured rejections of a command.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusinessRuleViolation {
    /// Not enough available stock.
    #[error("variant {variant_id} is out of stock: requested {requested}, available {available}")]
    OutOfStock {
        /// Variant.
        variant_id: VariantId,
        /// Units requested.
        requested: u32,
        /// Units available.
        available: i64,
    },

    /// Wallet cannot cover the amount.
    #[error("insufficient wallet balance: requested {requested}, available {available}")]
    InsufficientBalance {
        /// Amount requested.
        requested: Money,
        /// Balance minus pending holds.
        available: Money,
    },

    /// Discount code rejected.
    #[error("discount rejected: {0}")]
    DiscountRejected(DiscountRejection),

    /// A state machine refused the transition.
    #[error("{entity} cannot move from {from} to {to}")]
    InvalidTransition {
        /// Aggregate name.
        entity: &'static str,
        /// Current state.
        from: String,
        /// Requested state.
        to: String,
    },

    /// Checkout without lines.
    #[error("cart is empty")]
    EmptyCart,

    /// Zero quantity, or an adjustment that would make stock negative.
    #[error("invalid quantity: {0}")]
    InvalidQuantity(String),

    /// Blank or oversized idempotency key.
    #[error("invalid idempotency key")]
    InvalidIdempotencyKey,

    /// Checkout attempted without an authenticated customer.
    #[error("checkout requires a customer")]
    MissingCustomer,

    /// Webhook from a provider that did not issue the authority.
    #[error("gateway mismatch: transaction belongs to {expected}, notification came from {actual}")]
    GatewayMismatch {
        /// Gateway stored on the transaction.
        expected: String,
        /// Gateway named by the notification.
        actual: String,
    },
}

/// Errors returned by checkout commands.
#[derive(Error, Debug)]
pub enum CheckoutError {
    /// The addressed record does not exist.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Aggregate name.
        entity: &'static str,
        /// Identifier that was looked up.
        id: String,
    },

    /// A competing writer changed the record first.
    #[error("concurrency conflict on {entity} {id}")]
    ConcurrencyConflict {
        /// Aggregate name.
        entity: &'static str,
        /// Identifier of the contended record.
        id: String,
    },

    /// The command violates a business rule.
    #[error(transparent)]
    BusinessRule(#[from] BusinessRuleViolation),

    /// The payment provider failed.
    #[error("payment gateway error: {0}")]
    Gateway(#[from] GatewayError),

    /// Store or serialization failure.
    #[error("internal error: {0}")]
    Fatal(String),
}

impl CheckoutError {
    /// Convenience constructor for [`CheckoutError::NotFound`].
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Convenience constructor for an invalid state transition.
    pub fn invalid_transition(
        entity: &'static str,
        from: impl ToString,
        to: impl ToString,
    ) -> Self {
        Self::BusinessRule(BusinessRuleViolation::InvalidTransition {
            entity,
            from: from.to_string(),
            to: to.to_string(),
        })
    }

    /// Whether the caller may resubmit after re-reading.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict { .. })
    }

    /// Short label used as a metrics dimension.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::ConcurrencyConflict { .. } => "conflict",
            Self::BusinessRule(_) => "business_rule",
            Self::Gateway(_) => "gateway",
            Self::Fatal(_) => "fatal",
        }
    }
}

impl From<StoreError> for CheckoutError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::ConcurrencyConflict { entity, id, .. } => {
                Self::ConcurrencyConflict { entity, id }
            }
            StoreError::RowNotFound { entity, id } => Self::NotFound { entity, id },
            StoreError::UniqueViolation { .. }
            | StoreError::Database(_)
            | StoreError::Serialization(_) => Self::Fatal(error.to_string()),
        }
    }
}

impl From<DiscountRejection> for CheckoutError {
    fn from(rejection: DiscountRejection) -> Self {
        Self::BusinessRule(BusinessRuleViolation::DiscountRejected(rejection))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_conflicts_stay_conflicts() {
        let err: CheckoutError = StoreError::ConcurrencyConflict {
            entity: "product_variant",
            id: "v1".into(),
            expected: 3,
            actual: 4,
        }
        .into();
        assert!(err.is_conflict());
        assert_eq!(err.kind(), "conflict");
    }

    #[test]
    fn infrastructure_failures_become_fatal() {
        let err: CheckoutError = StoreError::Database("connection reset".into()).into();
        assert!(matches!(err, CheckoutError::Fatal(_)));
    }

    #[test]
    fn missing_rows_map_to_not_found() {
        let err: CheckoutError = StoreError::not_found("order", "o-1").into();
        assert_eq!(err.to_string(), "order not found: o-1");
    }
}
