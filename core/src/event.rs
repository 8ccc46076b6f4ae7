//! Domain events recorded in the outbox.
//!
//! [`DomainEvent`] is a closed set: subscribers match on the variant and the
//! outbox stores the serialized form next to a versioned type name so the
//! payload can evolve without breaking consumers that filter by type.
//!
//! # Example
//!
//! ```
//! use checkout_core::event::DomainEvent;
//! use checkout_core::types::{OrderId, UserId};
//!
//! let event = DomainEvent::OrderCancelled {
//!     order_id: OrderId::new(),
//!     user_id: UserId::new(),
//!     reason: "payment expired".into(),
//! };
//! assert_eq!(event.event_type(), "OrderCancelled.v1");
//! ```

use crate::types::{
    DiscountCodeId, Money, OrderId, PaymentTransactionId, ReferenceNumber, UserId, VariantId,
    WalletReservationId,
};
use serde::{Deserialize, Serialize};

/// Quantity of one variant affected by an event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockLine {
    /// Variant whose stock moved.
    pub variant_id: VariantId,
    /// Units moved.
    pub quantity: i64,
}

/// Everything the checkout engine announces to the outside world.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum DomainEvent {
    /// Stock was reserved for an order.
    StockReserved {
        /// Ledger reference.
        reference: ReferenceNumber,
        /// Reserved lines.
        lines: Vec<StockLine>,
    },
    /// Reserved stock was consumed.
    StockCommitted {
        /// Ledger reference.
        reference: ReferenceNumber,
        /// Committed lines.
        lines: Vec<StockLine>,
    },
    /// Reserved stock went back to the available pool.
    StockReleased {
        /// Ledger reference.
        reference: ReferenceNumber,
        /// Released lines.
        lines: Vec<StockLine>,
    },
    /// Physical stock was adjusted by an operator.
    StockAdjusted {
        /// Adjusted variant.
        variant_id: VariantId,
        /// Signed change.
        delta: i64,
        /// Physical stock afterwards.
        on_hand: i64,
    },
    /// Cached counters were corrected from the ledger.
    StockReconciled {
        /// Corrected variant.
        variant_id: VariantId,
        /// On-hand drift that was corrected.
        on_hand_drift: i64,
        /// Reserved drift that was corrected.
        reserved_drift: i64,
    },
    /// A checkout created an order.
    OrderPlaced {
        /// New order.
        order_id: OrderId,
        /// Customer.
        user_id: UserId,
        /// Amount owed after discounts.
        total: Money,
        /// Part paid from the wallet.
        wallet_amount: Money,
        /// Part paid through a gateway.
        gateway_amount: Money,
    },
    /// An order was fully paid.
    OrderPaid {
        /// Paid order.
        order_id: OrderId,
        /// Customer.
        user_id: UserId,
        /// Amount collected.
        total: Money,
    },
    /// An order was cancelled and its holds released.
    OrderCancelled {
        /// Cancelled order.
        order_id: OrderId,
        /// Customer.
        user_id: UserId,
        /// Human readable reason.
        reason: String,
    },
    /// A discount code was provisionally applied.
    DiscountApplied {
        /// Code.
        discount_code_id: DiscountCodeId,
        /// Order.
        order_id: OrderId,
        /// Discount granted.
        amount: Money,
    },
    /// A discount usage was confirmed.
    DiscountConfirmed {
        /// Code.
        discount_code_id: DiscountCodeId,
        /// Order.
        order_id: OrderId,
        /// Confirmed usages of the code afterwards.
        usage_count: u32,
    },
    /// A discount usage was cancelled or rolled back.
    DiscountReleased {
        /// Code.
        discount_code_id: DiscountCodeId,
        /// Order.
        order_id: OrderId,
    },
    /// Wallet balance was put on hold.
    WalletReserved {
        /// Hold.
        reservation_id: WalletReservationId,
        /// Wallet owner.
        user_id: UserId,
        /// Held amount.
        amount: Money,
    },
    /// A wallet hold was debited.
    WalletCommitted {
        /// Hold.
        reservation_id: WalletReservationId,
        /// Wallet owner.
        user_id: UserId,
        /// Debited amount.
        amount: Money,
        /// Balance afterwards.
        balance_after: i64,
    },
    /// A wallet hold ended without a debit.
    WalletReleased {
        /// Hold.
        reservation_id: WalletReservationId,
        /// Wallet owner.
        user_id: UserId,
        /// Whether the hold expired rather than being released.
        expired: bool,
    },
    /// Money was added to a wallet.
    WalletCredited {
        /// Wallet owner.
        user_id: UserId,
        /// Credited amount.
        amount: Money,
        /// Balance afterwards.
        balance_after: i64,
    },
    /// A gateway payment was requested.
    PaymentInitiated {
        /// Payment.
        payment_id: PaymentTransactionId,
        /// Order.
        order_id: OrderId,
        /// Gateway token.
        authority: String,
        /// Requested amount.
        amount: Money,
    },
    /// A gateway payment was verified.
    PaymentSucceeded {
        /// Payment.
        payment_id: PaymentTransactionId,
        /// Order.
        order_id: OrderId,
        /// Gateway receipt.
        ref_id: Option<String>,
    },
    /// A gateway payment failed, was cancelled or expired.
    PaymentFailed {
        /// Payment.
        payment_id: Option<PaymentTransactionId>,
        /// Order.
        order_id: OrderId,
        /// Why it failed.
        reason: String,
    },
}

impl DomainEvent {
    /// Versioned type name stored in the outbox `message_type` column.
    #[must_use]
    pub const fn event_type(&self) -> &'static str {
        match self {
            Self::StockReserved { .. } => "StockReserved.v1",
            Self::StockCommitted { .. } => "StockCommitted.v1",
            Self::StockReleased { .. } => "StockReleased.v1",
            Self::StockAdjusted { .. } => "StockAdjusted.v1",
            Self::StockReconciled { .. } => "StockReconciled.v1",
            Self::OrderPlaced { .. } => "OrderPlaced.v1",
            Self::OrderPaid { .. } => "OrderPaid.v1",
            Self::OrderCancelled { .. } => "OrderCancelled.v1",
            Self::DiscountApplied { .. } => "DiscountApplied.v1",
            Self::DiscountConfirmed { .. } => "DiscountConfirmed.v1",
            Self::DiscountReleased { .. } => "DiscountReleased.v1",
            Self::WalletReserved { .. } => "WalletReserved.v1",
            Self::WalletCommitted { .. } => "WalletCommitted.v1",
            Self::WalletReleased { .. } => "WalletReleased.v1",
            Self::WalletCredited { .. } => "WalletCredited.v1",
            Self::PaymentInitiated { .. } => "PaymentInitiated.v1",
            Self::PaymentSucceeded { .. } => "PaymentSucceeded.v1",
            Self::PaymentFailed { .. } => "PaymentFailed.v1",
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn serialized_form_is_tagged() {
        let event = DomainEvent::StockReserved {
            reference: ReferenceNumber::new("ORD-1"),
            lines: vec![StockLine {
                variant_id: VariantId::new(),
                quantity: 2,
            }],
        };

        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["type"], "StockReserved");
        assert_eq!(json["data"]["reference"], "ORD-1");
        assert_eq!(serde_json::from_value::<DomainEvent>(json).unwrap(), event);
    }
}
