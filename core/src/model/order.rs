//! Orders created by checkout.

use crate::audit::{AuditInfo, SoftDelete};
use crate::impl_audited;
use crate::types::{
    DiscountCodeId, IdempotencyKey, Money, OrderId, OrderItemId, ReferenceNumber, RowVersion,
    UserId, VariantId, WalletReservationId,
};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Order lifecycle as far as stock and money are concerned.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderStatus {
    /// Stock, discount and wallet are held; waiting for payment.
    PendingPayment,
    /// Payment settled; holds were committed.
    Paid,
    /// Payment failed or expired; holds were released.
    Cancelled,
}

impl OrderStatus {
    /// Whether no further settlement can happen.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Paid | Self::Cancelled)
    }

    /// Database representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::PendingPayment => "pending_payment",
            Self::Paid => "paid",
            Self::Cancelled => "cancelled",
        }
    }

    /// Parses the database representation.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending_payment" => Some(Self::PendingPayment),
            "paid" => Some(Self::Paid),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A line of an order. The variant is referenced by id only.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderItem {
    /// Line identifier.
    pub id: OrderItemId,
    /// Purchased variant.
    pub variant_id: VariantId,
    /// Units purchased.
    pub quantity: u32,
    /// Price per unit at checkout time.
    pub unit_price: Money,
    /// `unit_price × quantity`.
    pub line_total: Money,
}

/// An order and the holds it owns.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    /// Order identifier.
    pub id: OrderId,
    /// Client retry token, unique across orders.
    pub idempotency_key: IdempotencyKey,
    /// Customer.
    pub user_id: UserId,
    /// Lifecycle state.
    pub status: OrderStatus,
    /// Sum of line totals.
    pub subtotal: Money,
    /// Discount granted.
    pub discount_total: Money,
    /// `subtotal − discount_total`.
    pub total: Money,
    /// Part of the total paid from the wallet.
    pub wallet_amount: Money,
    /// Part of the total paid through a gateway.
    pub gateway_amount: Money,
    /// Ledger reference of the stock reserved for this order.
    pub reservation_reference: ReferenceNumber,
    /// Applied discount code.
    pub discount_code_id: Option<DiscountCodeId>,
    /// Wallet hold backing `wallet_amount`.
    pub wallet_reservation_id: Option<WalletReservationId>,
    /// Order lines.
    pub items: Vec<OrderItem>,
    /// Optimistic concurrency token.
    pub row_version: RowVersion,
    /// Audit fields.
    pub audit: AuditInfo,
    /// Soft-delete marker.
    pub deletion: SoftDelete,
}

impl_audited!(Order);

impl Order {
    /// Whether the wallet covers the entire total.
    #[must_use]
    pub const fn is_wallet_only(&self) -> bool {
        self.gateway_amount.is_zero()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_pending_orders_are_open() {
        assert!(!OrderStatus::PendingPayment.is_terminal());
        assert!(OrderStatus::Paid.is_terminal());
        assert!(OrderStatus::Cancelled.is_terminal());
    }

    #[test]
    fn status_names_round_trip() {
        for status in [OrderStatus::PendingPayment, OrderStatus::Paid, OrderStatus::Cancelled] {
            assert_eq!(OrderStatus::parse(status.as_str()), Some(status));
        }
    }
}
