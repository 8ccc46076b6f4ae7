//! Discount codes, their restrictions and individual redemptions.

use crate::audit::{AuditInfo, SoftDelete};
use crate::error::DiscountRejection;
use crate::impl_audited;
use crate::types::{
    CategoryId, DiscountCodeId, DiscountUsageId, Money, OrderId, ProductId, RowVersion, UserId,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// How a code computes its discount.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DiscountKind {
    /// Percentage of the eligible amount, optionally capped.
    Percentage {
        /// Percent in `1..=100`.
        percent: u8,
        /// Upper bound of the discount.
        max_amount: Option<Money>,
    },
    /// Fixed amount off, never more than the eligible amount.
    FixedAmount {
        /// Amount off.
        amount: Money,
    },
}

impl DiscountKind {
    /// Discount granted on `eligible`.
    #[must_use]
    pub fn discount_for(&self, eligible: Money) -> Money {
        match *self {
            Self::Percentage {
                percent,
                max_amount,
            } => {
                let raw = eligible.percent(percent.min(100));
                max_amount.map_or(raw, |cap| raw.min(cap))
            }
            Self::FixedAmount { amount } => amount.min(eligible),
        }
    }
}

/// Which cart lines a code applies to.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", content = "ids", rename_all = "snake_case")]
pub enum DiscountScope {
    /// Every line.
    #[default]
    All,
    /// Lines whose variant belongs to one of these categories.
    Categories(Vec<CategoryId>),
    /// Lines whose variant belongs to one of these products.
    Products(Vec<ProductId>),
}

impl DiscountScope {
    /// Whether a line for `product_id` in `category_id` is eligible.
    #[must_use]
    pub fn covers(&self, product_id: ProductId, category_id: Option<CategoryId>) -> bool {
        match self {
            Self::All => true,
            Self::Categories(ids) => category_id.is_some_and(|c| ids.contains(&c)),
            Self::Products(ids) => ids.contains(&product_id),
        }
    }
}

/// Conditions an order must satisfy to use a code.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscountRestrictions {
    /// Smallest order subtotal the code applies to.
    pub min_order_total: Option<Money>,
    /// Eligible lines.
    pub scope: DiscountScope,
}

/// A redeemable discount code.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscountCode {
    /// Code identifier.
    pub id: DiscountCodeId,
    /// Normalized (trimmed, upper-case) code text.
    pub code: String,
    /// Confirmed redemptions.
    pub usage_count: u32,
    /// Redemption cap across all customers.
    pub max_usage: u32,
    /// Redemption cap per customer.
    pub per_user_limit: Option<u32>,
    /// Discount computation.
    pub kind: DiscountKind,
    /// Eligibility conditions.
    pub restrictions: DiscountRestrictions,
    /// First instant the code is valid.
    pub starts_at: Option<DateTime<Utc>>,
    /// Instant the code stops being valid.
    pub expires_at: Option<DateTime<Utc>>,
    /// Operator switch.
    pub is_active: bool,
    /// Optimistic concurrency token.
    pub row_version: RowVersion,
    /// Audit fields.
    pub audit: AuditInfo,
    /// Soft-delete marker.
    pub deletion: SoftDelete,
}

impl_audited!(DiscountCode);

impl DiscountCode {
    /// An active, unrestricted code.
    #[must_use]
    pub fn new(code: &str, kind: DiscountKind, max_usage: u32, now: DateTime<Utc>) -> Self {
        Self {
            id: DiscountCodeId::new(),
            code: normalize_code(code),
            usage_count: 0,
            max_usage,
            per_user_limit: None,
            kind,
            restrictions: DiscountRestrictions::default(),
            starts_at: None,
            expires_at: None,
            is_active: true,
            row_version: RowVersion::INITIAL,
            audit: AuditInfo::new(now),
            deletion: SoftDelete::default(),
        }
    }

    /// Checks the code-level conditions that do not depend on the cart.
    ///
    /// # Errors
    ///
    /// Returns the first [`DiscountRejection`] that applies.
    pub fn check_redeemable(
        &self,
        now: DateTime<Utc>,
        pending_usages: u32,
    ) -> Result<(), DiscountRejection> {
        if !self.is_active || self.deletion.is_deleted {
            return Err(DiscountRejection::Inactive);
        }
        if self.starts_at.is_some_and(|starts| now < starts) {
            return Err(DiscountRejection::NotStarted);
        }
        if self.expires_at.is_some_and(|expires| now >= expires) {
            return Err(DiscountRejection::Expired);
        }
        if self.usage_count.saturating_add(pending_usages) >= self.max_usage {
            return Err(DiscountRejection::UsageLimitReached);
        }
        Ok(())
    }
}

/// Canonical form used for lookups.
#[must_use]
pub fn normalize_code(code: &str) -> String {
    code.trim().to_uppercase()
}

/// Lifecycle of a redemption.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DiscountUsageStatus {
    /// Held by an order awaiting payment.
    Pending,
    /// Counted against the code.
    Confirmed,
    /// Given back.
    Cancelled,
}

impl DiscountUsageStatus {
    /// Database representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Parses the database representation.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "confirmed" => Some(Self::Confirmed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for DiscountUsageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One order's use of a discount code.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscountUsage {
    /// Usage identifier.
    pub id: DiscountUsageId,
    /// Redeemed code.
    pub discount_code_id: DiscountCodeId,
    /// Order the code was applied to.
    pub order_id: OrderId,
    /// Customer who redeemed it.
    pub user_id: UserId,
    /// Amount taken off the order.
    pub discount_amount: Money,
    /// Lifecycle state.
    pub status: DiscountUsageStatus,
    /// When the usage was created.
    pub created_at: DateTime<Utc>,
    /// Last status change.
    pub updated_at: DateTime<Utc>,
}

impl DiscountUsage {
    /// A new pending usage.
    #[must_use]
    pub fn pending(
        discount_code_id: DiscountCodeId,
        order_id: OrderId,
        user_id: UserId,
        discount_amount: Money,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: DiscountUsageId::new(),
            discount_code_id,
            order_id,
            user_id,
            discount_amount,
            status: DiscountUsageStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A cart line as seen by discount scoping.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DiscountLine {
    /// Product of the line.
    pub product_id: ProductId,
    /// Category of the line.
    pub category_id: Option<CategoryId>,
    /// Line total.
    pub line_total: Money,
}

/// Outcome of `ValidateAndApply`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DiscountApplication {
    /// The code was applied; a pending usage now exists.
    Applied {
        /// Code that was applied.
        discount_code_id: DiscountCodeId,
        /// Pending usage created for the order.
        usage_id: DiscountUsageId,
        /// Discount granted.
        amount: Money,
    },
    /// The code cannot be used for this order.
    Rejected(DiscountRejection),
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn code() -> DiscountCode {
        DiscountCode::new(
            " summer10 ",
            DiscountKind::Percentage {
                percent: 10,
                max_amount: Some(Money::from_minor(500)),
            },
            3,
            Utc::now(),
        )
    }

    #[test]
    fn codes_are_normalized() {
        assert_eq!(code().code, "SUMMER10");
    }

    #[test]
    fn percentage_respects_cap() {
        let kind = code().kind;
        assert_eq!(kind.discount_for(Money::from_minor(1_000)), Money::from_minor(100));
        assert_eq!(kind.discount_for(Money::from_minor(100_000)), Money::from_minor(500));
    }

    #[test]
    fn fixed_amount_never_exceeds_eligible() {
        let kind = DiscountKind::FixedAmount {
            amount: Money::from_minor(700),
        };
        assert_eq!(kind.discount_for(Money::from_minor(300)), Money::from_minor(300));
    }

    #[test]
    fn pending_usages_count_towards_the_cap() {
        let mut c = code();
        c.usage_count = 1;
        assert!(c.check_redeemable(Utc::now(), 1).is_ok());
        assert_eq!(
            c.check_redeemable(Utc::now(), 2),
            Err(DiscountRejection::UsageLimitReached)
        );
    }

    #[test]
    fn validity_window_is_enforced() {
        let now = Utc::now();
        let mut c = code();
        c.starts_at = Some(now + Duration::hours(1));
        assert_eq!(c.check_redeemable(now, 0), Err(DiscountRejection::NotStarted));

        c.starts_at = None;
        c.expires_at = Some(now);
        assert_eq!(c.check_redeemable(now, 0), Err(DiscountRejection::Expired));
    }

    #[test]
    fn deleted_codes_are_inactive() {
        let mut c = code();
        c.deletion.is_deleted = true;
        assert_eq!(c.check_redeemable(Utc::now(), 0), Err(DiscountRejection::Inactive));
    }

    #[test]
    fn scope_matching() {
        let product = ProductId::new();
        let category = CategoryId::new();
        assert!(DiscountScope::All.covers(product, None));
        assert!(DiscountScope::Categories(vec![category]).covers(product, Some(category)));
        assert!(!DiscountScope::Categories(vec![category]).covers(product, None));
        assert!(!DiscountScope::Products(vec![ProductId::new()]).covers(product, Some(category)));
    }
}
