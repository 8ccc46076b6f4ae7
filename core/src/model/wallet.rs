//! Wallet balance holds and the wallet ledger.

use crate::types::{Money, OrderId, UserId, WalletLedgerEntryId, WalletReservationId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// State of a wallet hold. `Pending` is the only non-terminal state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WalletReservationStatus {
    /// Amount is held against the balance.
    Pending,
    /// Amount was debited.
    Committed,
    /// Hold was given back.
    Released,
    /// Hold lapsed with an abandoned payment.
    Expired,
}

impl WalletReservationStatus {
    /// Whether the hold can still change.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }

    /// Database representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Committed => "committed",
            Self::Released => "released",
            Self::Expired => "expired",
        }
    }

    /// Parses the database representation.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "committed" => Some(Self::Committed),
            "released" => Some(Self::Released),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }
}

impl fmt::Display for WalletReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Amount of a customer's balance held for an order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletReservation {
    /// Hold identifier.
    pub id: WalletReservationId,
    /// Wallet owner.
    pub user_id: UserId,
    /// Order the hold pays for.
    pub order_id: OrderId,
    /// Held amount.
    pub amount: Money,
    /// Lifecycle state.
    pub status: WalletReservationStatus,
    /// When the hold was placed.
    pub created_at: DateTime<Utc>,
    /// Last status change.
    pub updated_at: DateTime<Utc>,
}

impl WalletReservation {
    /// A new pending hold.
    #[must_use]
    pub fn pending(user_id: UserId, order_id: OrderId, amount: Money, now: DateTime<Utc>) -> Self {
        Self {
            id: WalletReservationId::new(),
            user_id,
            order_id,
            amount,
            status: WalletReservationStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }
}

/// What a wallet ledger entry refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WalletReferenceType {
    /// Debit for an order.
    Order,
    /// Top-up or refund credit.
    Credit,
}

impl WalletReferenceType {
    /// Database representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Order => "order",
            Self::Credit => "credit",
        }
    }

    /// Parses the database representation.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "order" => Some(Self::Order),
            "credit" => Some(Self::Credit),
            _ => None,
        }
    }
}

/// Append-only wallet movement. Balance is the sum of `amount_delta`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletLedgerEntry {
    /// Entry identifier.
    pub id: WalletLedgerEntryId,
    /// Wallet owner.
    pub user_id: UserId,
    /// Signed movement in minor units.
    pub amount_delta: i64,
    /// Balance after this entry.
    pub balance_after: i64,
    /// Kind of referenced record.
    pub reference_type: WalletReferenceType,
    /// Identifier of the referenced record.
    pub reference_id: String,
    /// When the entry was written.
    pub occurred_at: DateTime<Utc>,
}

/// Sums ledger deltas into a balance.
#[must_use]
pub fn balance_of<'a>(entries: impl IntoIterator<Item = &'a WalletLedgerEntry>) -> i64 {
    entries.into_iter().map(|e| e.amount_delta).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(user_id: UserId, delta: i64) -> WalletLedgerEntry {
        WalletLedgerEntry {
            id: WalletLedgerEntryId::new(),
            user_id,
            amount_delta: delta,
            balance_after: 0,
            reference_type: WalletReferenceType::Credit,
            reference_id: "top-up".into(),
            occurred_at: Utc::now(),
        }
    }

    #[test]
    fn balance_is_sum_of_deltas() {
        let user = UserId::new();
        let entries = [entry(user, 1_000), entry(user, -300), entry(user, 50)];
        assert_eq!(balance_of(&entries), 750);
    }

    #[test]
    fn pending_is_the_only_open_state() {
        assert!(!WalletReservationStatus::Pending.is_terminal());
        for s in [
            WalletReservationStatus::Committed,
            WalletReservationStatus::Released,
            WalletReservationStatus::Expired,
        ] {
            assert!(s.is_terminal());
            assert_eq!(WalletReservationStatus::parse(s.as_str()), Some(s));
        }
    }
}
