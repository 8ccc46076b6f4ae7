//! Gateway payment transactions.

use crate::types::{Money, OrderId, PaymentTransactionId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// State of a gateway transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PaymentStatus {
    /// Redirect issued, waiting for the customer.
    Pending,
    /// Verified by the gateway.
    Success,
    /// Cancelled, declined or abandoned.
    Failed,
    /// Verification window elapsed before a callback arrived.
    Expired,
}

impl PaymentStatus {
    /// Whether the transaction can still change.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }

    /// Database representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Expired => "expired",
        }
    }

    /// Parses the database representation.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "success" => Some(Self::Success),
            "failed" => Some(Self::Failed),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status reported by a gateway callback or webhook.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallbackStatus {
    /// Customer completed the payment page.
    Ok,
    /// Customer cancelled or the gateway declined.
    Nok,
}

impl CallbackStatus {
    /// Parses the `Status` query value gateways send (`OK` / `NOK`).
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "OK" => Some(Self::Ok),
            "NOK" => Some(Self::Nok),
            _ => None,
        }
    }
}

/// One attempt to collect money through a gateway.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentTransaction {
    /// Transaction identifier.
    pub id: PaymentTransactionId,
    /// Gateway-issued token, unique across transactions.
    pub authority: String,
    /// Order being paid.
    pub order_id: OrderId,
    /// Provider that issued the authority.
    pub gateway_name: String,
    /// Lifecycle state.
    pub status: PaymentStatus,
    /// Amount requested.
    pub amount: Money,
    /// Deadline for the customer to finish paying.
    pub expires_at: DateTime<Utc>,
    /// Gateway receipt number on success.
    pub ref_id: Option<String>,
    /// Why the transaction failed.
    pub failure_reason: Option<String>,
    /// When the gateway confirmed the payment.
    pub verified_at: Option<DateTime<Utc>>,
    /// When the transaction was stored.
    pub created_at: DateTime<Utc>,
    /// Last status change.
    pub updated_at: DateTime<Utc>,
}

impl PaymentTransaction {
    /// A pending transaction for a freshly issued authority.
    #[must_use]
    pub fn pending(
        authority: String,
        order_id: OrderId,
        gateway_name: String,
        amount: Money,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: PaymentTransactionId::new(),
            authority,
            order_id,
            gateway_name,
            status: PaymentStatus::Pending,
            amount,
            expires_at,
            ref_id: None,
            failure_reason: None,
            verified_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the customer ran out of time at `now`.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.status == PaymentStatus::Pending && now >= self.expires_at
    }

    /// Records a verified payment.
    pub fn mark_succeeded(&mut self, ref_id: Option<String>, now: DateTime<Utc>) {
        self.status = PaymentStatus::Success;
        self.ref_id = ref_id;
        self.verified_at = Some(now);
        self.updated_at = now;
    }

    /// Records a failed payment.
    pub fn mark_failed(&mut self, status: PaymentStatus, reason: impl Into<String>, now: DateTime<Utc>) {
        self.status = status;
        self.failure_reason = Some(reason.into());
        self.updated_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn callback_status_is_case_insensitive() {
        assert_eq!(CallbackStatus::parse("ok"), Some(CallbackStatus::Ok));
        assert_eq!(CallbackStatus::parse(" NOK "), Some(CallbackStatus::Nok));
        assert_eq!(CallbackStatus::parse("maybe"), None);
    }

    #[test]
    fn only_pending_transactions_expire() {
        let now = Utc::now();
        let mut tx = PaymentTransaction::pending(
            "A1".into(),
            OrderId::new(),
            "sandbox".into(),
            Money::from_minor(100),
            now,
            now + Duration::minutes(15),
        );
        assert!(!tx.is_expired_at(now));
        assert!(tx.is_expired_at(now + Duration::minutes(15)));

        tx.mark_succeeded(Some("R1".into()), now);
        assert!(!tx.is_expired_at(now + Duration::hours(1)));
        assert!(tx.status.is_terminal());
    }
}
