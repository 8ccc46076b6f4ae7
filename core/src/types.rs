//! Value objects shared by every checkout component.
//!
//! Identifiers are `Uuid` newtypes so an `OrderId` can never be passed where a
//! `VariantId` is expected. Monetary amounts are integral minor units.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Declares a `Uuid`-backed identifier newtype.
macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Creates a new random identifier.
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Wraps an existing `Uuid`.
            #[must_use]
            pub const fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Returns the inner `Uuid`.
            #[must_use]
            pub const fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id!(
    /// Identifier of a purchasable product variant (one SKU).
    VariantId
);
uuid_id!(
    /// Identifier of the product a variant belongs to.
    ProductId
);
uuid_id!(
    /// Identifier of a catalogue category.
    CategoryId
);
uuid_id!(
    /// Identifier of a customer.
    UserId
);
uuid_id!(
    /// Identifier of an order.
    OrderId
);
uuid_id!(
    /// Identifier of a line inside an order.
    OrderItemId
);
uuid_id!(
    /// Identifier of a row in the inventory ledger.
    InventoryTransactionId
);
uuid_id!(
    /// Identifier of a discount code.
    DiscountCodeId
);
uuid_id!(
    /// Identifier of one redemption of a discount code.
    DiscountUsageId
);
uuid_id!(
    /// Identifier of a wallet balance hold.
    WalletReservationId
);
uuid_id!(
    /// Identifier of a row in the wallet ledger.
    WalletLedgerEntryId
);
uuid_id!(
    /// Identifier of a payment gateway transaction.
    PaymentTransactionId
);
uuid_id!(
    /// Identifier of an outbox row.
    OutboxMessageId
);

/// Monetary amount in minor currency units.
///
/// Amounts are never negative; signed movements (wallet ledger deltas) are
/// carried as `i64` next to the `Money` they produce.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Money(u64);

impl Money {
    /// Zero amount.
    pub const ZERO: Self = Self(0);

    /// Creates an amount from minor units.
    #[must_use]
    pub const fn from_minor(minor: u64) -> Self {
        Self(minor)
    }

    /// Returns the amount in minor units.
    #[must_use]
    pub const fn minor(&self) -> u64 {
        self.0
    }

    /// Returns `true` for a zero amount.
    #[must_use]
    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Adds two amounts, returning `None` on overflow.
    #[must_use]
    pub const fn checked_add(self, other: Self) -> Option<Self> {
        match self.0.checked_add(other.0) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }

    /// Subtracts, returning `None` if the result would be negative.
    #[must_use]
    pub const fn checked_sub(self, other: Self) -> Option<Self> {
        match self.0.checked_sub(other.0) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }

    /// Subtracts, clamping at zero.
    #[must_use]
    pub const fn saturating_sub(self, other: Self) -> Self {
        Self(self.0.saturating_sub(other.0))
    }

    /// Multiplies by a quantity, returning `None` on overflow.
    #[must_use]
    pub const fn checked_mul(self, quantity: u32) -> Option<Self> {
        match self.0.checked_mul(quantity as u64) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }

    /// Returns `percent`% of this amount, rounded down.
    #[must_use]
    pub const fn percent(self, percent: u8) -> Self {
        // u128 keeps the intermediate product from overflowing
        #[allow(clippy::cast_possible_truncation)]
        let value = (self.0 as u128 * percent as u128 / 100) as u64;
        Self(value)
    }

    /// Converts to a signed value for ledger arithmetic.
    ///
    /// Amounts above `i64::MAX` saturate.
    #[must_use]
    pub fn as_signed(self) -> i64 {
        i64::try_from(self.0).unwrap_or(i64::MAX)
    }

    /// Converts a signed ledger value back to an amount, clamping negatives at zero.
    #[must_use]
    pub fn from_signed(value: i64) -> Self {
        Self(u64::try_from(value).unwrap_or(0))
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::iter::Sum for Money {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::ZERO, |acc, m| Self(acc.0.saturating_add(m.0)))
    }
}

/// Optimistic concurrency token stored on mutable rows.
///
/// Every successful write bumps the version; a writer that presents a stale
/// version gets a concurrency conflict instead of overwriting newer data.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RowVersion(u64);

impl RowVersion {
    /// Version assigned to a freshly inserted row.
    pub const INITIAL: Self = Self(1);

    /// Creates a version from its raw value.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn value(&self) -> u64 {
        self.0
    }

    /// Returns the version that follows this one.
    #[must_use]
    pub const fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for RowVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Groups the ledger rows written for one order or checkout attempt.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReferenceNumber(String);

impl ReferenceNumber {
    /// Wraps an arbitrary reference string.
    #[must_use]
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }

    /// Reference used for the stock reserved by an order.
    #[must_use]
    pub fn for_order(order_id: OrderId) -> Self {
        Self(format!("ORD-{}", order_id.as_uuid().simple()))
    }

    /// Returns the reference as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReferenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Client-supplied token that makes a checkout submission safe to retry.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    /// Longest accepted key.
    pub const MAX_LEN: usize = 128;

    /// Validates and wraps a key.
    ///
    /// Returns `None` for blank keys or keys longer than [`Self::MAX_LEN`].
    #[must_use]
    pub fn parse(key: &str) -> Option<Self> {
        let key = key.trim();
        if key.is_empty() || key.len() > Self::MAX_LEN {
            None
        } else {
            Some(Self(key.to_string()))
        }
    }

    /// Returns the key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn money_percent_rounds_down() {
        assert_eq!(Money::from_minor(999).percent(10), Money::from_minor(99));
        assert_eq!(Money::from_minor(u64::MAX).percent(100), Money::from_minor(u64::MAX));
    }

    #[test]
    fn money_checked_sub_rejects_negative() {
        assert_eq!(Money::from_minor(5).checked_sub(Money::from_minor(6)), None);
        assert_eq!(
            Money::from_minor(6).checked_sub(Money::from_minor(5)),
            Some(Money::from_minor(1))
        );
    }

    #[test]
    fn money_signed_conversion_clamps() {
        assert_eq!(Money::from_signed(-10), Money::ZERO);
        assert_eq!(Money::from_minor(42).as_signed(), 42);
    }

    #[test]
    fn row_version_advances() {
        assert_eq!(RowVersion::INITIAL.next(), RowVersion::new(2));
    }

    #[test]
    fn idempotency_key_validation() {
        assert!(IdempotencyKey::parse("   ").is_none());
        assert!(IdempotencyKey::parse(&"k".repeat(129)).is_none());
        assert_eq!(
            IdempotencyKey::parse(" cart-42 ").map(|k| k.as_str().to_string()),
            Some("cart-42".to_string())
        );
    }

    #[test]
    fn order_reference_is_stable() {
        let order = OrderId::new();
        assert_eq!(ReferenceNumber::for_order(order), ReferenceNumber::for_order(order));
        assert!(ReferenceNumber::for_order(order).as_str().starts_with("ORD-"));
    }
}
