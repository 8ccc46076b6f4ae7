//! Discount usage tracker.
//!
//! Redemptions of one code are serialized by a row lock on the code, taken
//! before anything is counted. A pending usage counts towards the cap as soon
//! as it exists, so two checkouts racing for the last redemption cannot both
//! pass validation. `usage_count` only moves when a usage is confirmed or a
//! confirmed usage is rolled back.

use crate::observe;
use checkout_core::context::RequestContext;
use checkout_core::environment::Clock;
use checkout_core::error::{CheckoutError, DiscountRejection};
use checkout_core::event::DomainEvent;
use checkout_core::model::{
    DiscountApplication, DiscountCode, DiscountLine, DiscountScope, DiscountUsage,
    DiscountUsageStatus, normalize_code,
};
use checkout_core::store::{DiscountRepository, Transaction, UnitOfWork};
use checkout_core::types::{DiscountCodeId, Money, OrderId, UserId};
use checkout_core::unit_of_work::{finish, record_event};
use chrono::{DateTime, Utc};
use metrics::counter;
use std::sync::Arc;

/// Input of [`DiscountService::validate_and_apply`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyDiscount {
    /// Code as typed by the customer.
    pub code: String,
    /// Order subtotal before the discount.
    pub order_total: Money,
    /// Customer redeeming the code.
    pub user_id: UserId,
    /// Order the usage belongs to.
    pub order_id: OrderId,
    /// Cart lines, used for scoped codes.
    pub lines: Vec<DiscountLine>,
}

/// Validates, applies, confirms and cancels discount codes.
#[derive(Clone)]
pub struct DiscountService {
    uow: Arc<dyn UnitOfWork>,
    clock: Arc<dyn Clock>,
}

impl DiscountService {
    /// Service over `uow`.
    #[must_use]
    pub fn new(uow: Arc<dyn UnitOfWork>, clock: Arc<dyn Clock>) -> Self {
        Self { uow, clock }
    }

    /// Stores a new code.
    ///
    /// # Errors
    ///
    /// Returns [`CheckoutError::Fatal`] if the code text is already taken.
    #[tracing::instrument(skip_all, fields(correlation_id = %ctx.correlation_id, code = %code.code))]
    pub async fn create_code(
        &self,
        ctx: &RequestContext,
        code: DiscountCode,
    ) -> Result<DiscountCode, CheckoutError> {
        let mut tx = self.uow.begin().await?;
        let mut code = code;
        code.code = normalize_code(&code.code);
        let result = tx
            .insert_discount_code(code.clone())
            .await
            .map(|()| code)
            .map_err(CheckoutError::from);
        let result = finish(tx, result).await;
        observe("discount.create", &result);
        result
    }

    /// Locks the code with this text for the rest of the transaction.
    ///
    /// # Errors
    ///
    /// Returns [`CheckoutError`] if the store fails.
    pub async fn lock_code_in(
        tx: &mut dyn Transaction,
        code: &str,
    ) -> Result<Option<DiscountCode>, CheckoutError> {
        Ok(tx.lock_discount_code(normalize_code(code)).await?)
    }

    /// Validates a code against an order and, if it applies, creates a
    /// pending usage.
    ///
    /// Rejections come back as [`DiscountApplication::Rejected`]; only
    /// infrastructure failures are errors.
    ///
    /// # Errors
    ///
    /// Returns [`CheckoutError`] if the store fails.
    #[tracing::instrument(skip_all, fields(
        correlation_id = %ctx.correlation_id,
        code = %request.code,
        order_id = %request.order_id,
    ))]
    pub async fn validate_and_apply(
        &self,
        ctx: &RequestContext,
        request: ApplyDiscount,
    ) -> Result<DiscountApplication, CheckoutError> {
        let now = self.clock.now();
        let mut tx = self.uow.begin().await?;
        let result = Self::validate_and_apply_in(tx.as_mut(), ctx, &request, now).await;
        let result = finish(tx, result).await;
        observe("discount.apply", &result);
        result
    }

    /// Apply step usable inside a larger transaction.
    ///
    /// # Errors
    ///
    /// Returns [`CheckoutError`] if the store fails.
    pub async fn validate_and_apply_in(
        tx: &mut dyn Transaction,
        ctx: &RequestContext,
        request: &ApplyDiscount,
        now: DateTime<Utc>,
    ) -> Result<DiscountApplication, CheckoutError> {
        let outcome = Self::evaluate(tx, request, now).await?;
        let application = match outcome {
            Ok((code, amount)) => {
                let usage = DiscountUsage::pending(
                    code.id,
                    request.order_id,
                    request.user_id,
                    amount,
                    now,
                );
                let usage_id = usage.id;
                tx.insert_discount_usage(usage).await?;
                let event = DomainEvent::DiscountApplied {
                    discount_code_id: code.id,
                    order_id: request.order_id,
                    amount,
                };
                record_event(tx, ctx, &event, now).await?;
                tracing::info!(code = %code.code, amount = %amount, "Discount applied");
                DiscountApplication::Applied {
                    discount_code_id: code.id,
                    usage_id,
                    amount,
                }
            }
            Err(rejection) => {
                tracing::warn!(code = %request.code, reason = %rejection, "Discount rejected");
                DiscountApplication::Rejected(rejection)
            }
        };

        let outcome = match &application {
            DiscountApplication::Applied { .. } => "applied",
            DiscountApplication::Rejected(_) => "rejected",
        };
        counter!("discount_applications_total", "outcome" => outcome).increment(1);
        Ok(application)
    }

    async fn evaluate(
        tx: &mut dyn Transaction,
        request: &ApplyDiscount,
        now: DateTime<Utc>,
    ) -> Result<Result<(DiscountCode, Money), DiscountRejection>, CheckoutError> {
        let Some(code) = Self::lock_code_in(tx, &request.code).await? else {
            return Ok(Err(DiscountRejection::NotFound));
        };

        let pending = tx.count_pending_usages(code.id).await?;
        if let Err(rejection) = code.check_redeemable(now, pending) {
            return Ok(Err(rejection));
        }

        if let Some(limit) = code.per_user_limit {
            let used = tx.count_user_usages(code.id, request.user_id).await?;
            if used >= limit {
                return Ok(Err(DiscountRejection::PerUserLimitReached));
            }
        }

        if let Some(minimum) = code.restrictions.min_order_total {
            if request.order_total < minimum {
                return Ok(Err(DiscountRejection::MinimumNotMet { minimum }));
            }
        }

        let eligible = match &code.restrictions.scope {
            DiscountScope::All => request.order_total,
            scope => request
                .lines
                .iter()
                .filter(|line| scope.covers(line.product_id, line.category_id))
                .map(|line| line.line_total)
                .sum(),
        };
        if eligible.is_zero() {
            return Ok(Err(DiscountRejection::OutOfScope));
        }

        let amount = code.kind.discount_for(eligible).min(request.order_total);
        Ok(Ok((code, amount)))
    }

    /// Confirms the order's pending usage of `code_id`. Confirming twice is a
    /// no-op.
    ///
    /// # Errors
    ///
    /// Returns [`CheckoutError::NotFound`] if the code does not exist.
    #[tracing::instrument(skip_all, fields(correlation_id = %ctx.correlation_id, order_id = %order_id))]
    pub async fn confirm(
        &self,
        ctx: &RequestContext,
        code_id: DiscountCodeId,
        order_id: OrderId,
    ) -> Result<bool, CheckoutError> {
        let now = self.clock.now();
        let mut tx = self.uow.begin().await?;
        let result = Self::confirm_in(tx.as_mut(), ctx, code_id, order_id, now).await;
        let result = finish(tx, result).await;
        observe("discount.confirm", &result);
        result
    }

    /// Confirm step usable inside a larger transaction. Returns whether a
    /// usage was confirmed.
    ///
    /// # Errors
    ///
    /// Returns [`CheckoutError::NotFound`] if the code does not exist.
    pub async fn confirm_in(
        tx: &mut dyn Transaction,
        ctx: &RequestContext,
        code_id: DiscountCodeId,
        order_id: OrderId,
        now: DateTime<Utc>,
    ) -> Result<bool, CheckoutError> {
        let mut code = tx
            .lock_discount_code_by_id(code_id)
            .await?
            .ok_or_else(|| CheckoutError::not_found("discount_code", code_id))?;
        let pending = usages_in(tx, code_id, order_id, DiscountUsageStatus::Pending).await?;
        if pending.is_empty() {
            return Ok(false);
        }

        for mut usage in pending {
            usage.status = DiscountUsageStatus::Confirmed;
            usage.updated_at = now;
            tx.update_discount_usage(usage).await?;
            code.usage_count = code.usage_count.saturating_add(1);
        }
        let expected = code.row_version;
        code.audit.updated_at = now;
        tx.update_discount_code(code.clone(), expected).await?;

        let event = DomainEvent::DiscountConfirmed {
            discount_code_id: code_id,
            order_id,
            usage_count: code.usage_count,
        };
        record_event(tx, ctx, &event, now).await?;
        tracing::info!(code = %code.code, usage_count = code.usage_count, "Discount confirmed");
        Ok(true)
    }

    /// Cancels the order's pending usage of `code_id`. Cancelling twice is a
    /// no-op.
    ///
    /// # Errors
    ///
    /// Returns [`CheckoutError`] if the store fails.
    #[tracing::instrument(skip_all, fields(correlation_id = %ctx.correlation_id, order_id = %order_id))]
    pub async fn cancel(
        &self,
        ctx: &RequestContext,
        code_id: DiscountCodeId,
        order_id: OrderId,
    ) -> Result<bool, CheckoutError> {
        let now = self.clock.now();
        let mut tx = self.uow.begin().await?;
        let result = Self::cancel_in(tx.as_mut(), ctx, code_id, order_id, now).await;
        let result = finish(tx, result).await;
        observe("discount.cancel", &result);
        result
    }

    /// Cancel step usable inside a larger transaction. Returns whether a usage
    /// was cancelled.
    ///
    /// # Errors
    ///
    /// Returns [`CheckoutError`] if the store fails.
    pub async fn cancel_in(
        tx: &mut dyn Transaction,
        ctx: &RequestContext,
        code_id: DiscountCodeId,
        order_id: OrderId,
        now: DateTime<Utc>,
    ) -> Result<bool, CheckoutError> {
        tx.lock_discount_code_by_id(code_id).await?;
        let pending = usages_in(tx, code_id, order_id, DiscountUsageStatus::Pending).await?;
        if pending.is_empty() {
            return Ok(false);
        }
        for mut usage in pending {
            usage.status = DiscountUsageStatus::Cancelled;
            usage.updated_at = now;
            tx.update_discount_usage(usage).await?;
        }
        let event = DomainEvent::DiscountReleased {
            discount_code_id: code_id,
            order_id,
        };
        record_event(tx, ctx, &event, now).await?;
        tracing::info!(order_id = %order_id, "Discount usage cancelled");
        Ok(true)
    }

    /// Takes back the order's usage of `code_id` whatever its state. A
    /// confirmed usage also gives its redemption back to the code.
    ///
    /// # Errors
    ///
    /// Returns [`CheckoutError::NotFound`] if the code does not exist.
    #[tracing::instrument(skip_all, fields(correlation_id = %ctx.correlation_id, order_id = %order_id))]
    pub async fn rollback(
        &self,
        ctx: &RequestContext,
        code_id: DiscountCodeId,
        order_id: OrderId,
    ) -> Result<bool, CheckoutError> {
        let now = self.clock.now();
        let mut tx = self.uow.begin().await?;
        let result = Self::rollback_in(tx.as_mut(), ctx, code_id, order_id, now).await;
        let result = finish(tx, result).await;
        observe("discount.rollback", &result);
        result
    }

    /// Rollback step usable inside a larger transaction.
    ///
    /// # Errors
    ///
    /// Returns [`CheckoutError::NotFound`] if the code does not exist.
    pub async fn rollback_in(
        tx: &mut dyn Transaction,
        ctx: &RequestContext,
        code_id: DiscountCodeId,
        order_id: OrderId,
        now: DateTime<Utc>,
    ) -> Result<bool, CheckoutError> {
        let mut code = tx
            .lock_discount_code_by_id(code_id)
            .await?
            .ok_or_else(|| CheckoutError::not_found("discount_code", code_id))?;
        let usages: Vec<_> = tx
            .discount_usages_for_order(order_id)
            .await?
            .into_iter()
            .filter(|u| u.discount_code_id == code_id && u.status != DiscountUsageStatus::Cancelled)
            .collect();
        if usages.is_empty() {
            return Ok(false);
        }

        let mut confirmed = 0u32;
        for mut usage in usages {
            if usage.status == DiscountUsageStatus::Confirmed {
                confirmed += 1;
            }
            usage.status = DiscountUsageStatus::Cancelled;
            usage.updated_at = now;
            tx.update_discount_usage(usage).await?;
        }
        if confirmed > 0 {
            let expected = code.row_version;
            code.usage_count = code.usage_count.saturating_sub(confirmed);
            code.audit.updated_at = now;
            tx.update_discount_code(code, expected).await?;
        }

        let event = DomainEvent::DiscountReleased {
            discount_code_id: code_id,
            order_id,
        };
        record_event(tx, ctx, &event, now).await?;
        tracing::info!(order_id = %order_id, confirmed, "Discount usage rolled back");
        Ok(true)
    }
}

async fn usages_in(
    tx: &mut dyn Transaction,
    code_id: DiscountCodeId,
    order_id: OrderId,
    status: DiscountUsageStatus,
) -> Result<Vec<DiscountUsage>, CheckoutError> {
    Ok(tx
        .discount_usages_for_order(order_id)
        .await?
        .into_iter()
        .filter(|u| u.discount_code_id == code_id && u.status == status)
        .collect())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use checkout_core::model::DiscountKind;
    use checkout_core::types::{CategoryId, ProductId};
    use checkout_testing::{InMemoryStore, fixtures, test_clock};

    fn service(store: &InMemoryStore) -> DiscountService {
        DiscountService::new(Arc::new(store.clone()), Arc::new(test_clock()))
    }

    fn request(code: &str, total: u64) -> ApplyDiscount {
        ApplyDiscount {
            code: code.to_string(),
            order_total: Money::from_minor(total),
            user_id: UserId::new(),
            order_id: OrderId::new(),
            lines: Vec::new(),
        }
    }

    #[tokio::test]
    async fn lookup_ignores_case_and_whitespace() {
        let store = InMemoryStore::new();
        fixtures::seed_discount_code(&store, fixtures::percentage_code("SPRING10", 10, 5))
            .await
            .unwrap();

        let outcome = service(&store)
            .validate_and_apply(&RequestContext::system(), request("  spring10 ", 10_000))
            .await
            .unwrap();

        assert!(matches!(
            outcome,
            DiscountApplication::Applied { amount, .. } if amount == Money::from_minor(1_000)
        ));
    }

    #[tokio::test]
    async fn unknown_code_is_a_structured_rejection() {
        let store = InMemoryStore::new();

        let outcome = service(&store)
            .validate_and_apply(&RequestContext::system(), request("NOPE", 10_000))
            .await
            .unwrap();

        assert_eq!(outcome, DiscountApplication::Rejected(DiscountRejection::NotFound));
        assert!(store.outbox_messages().is_empty());
    }

    #[tokio::test]
    async fn minimum_total_is_enforced() {
        let store = InMemoryStore::new();
        let mut code = fixtures::fixed_code("BIGCART", 500, 10);
        code.restrictions.min_order_total = Some(Money::from_minor(5_000));
        fixtures::seed_discount_code(&store, code).await.unwrap();

        let outcome = service(&store)
            .validate_and_apply(&RequestContext::system(), request("BIGCART", 4_999))
            .await
            .unwrap();

        assert_eq!(
            outcome,
            DiscountApplication::Rejected(DiscountRejection::MinimumNotMet {
                minimum: Money::from_minor(5_000)
            })
        );
    }

    #[tokio::test]
    async fn scoped_codes_discount_only_covered_lines() {
        let store = InMemoryStore::new();
        let shoes = CategoryId::new();
        let mut code = fixtures::percentage_code("SHOES50", 50, 10);
        code.restrictions.scope = DiscountScope::Categories(vec![shoes]);
        fixtures::seed_discount_code(&store, code).await.unwrap();

        let mut req = request("SHOES50", 3_000);
        req.lines = vec![
            DiscountLine {
                product_id: ProductId::new(),
                category_id: Some(shoes),
                line_total: Money::from_minor(1_000),
            },
            DiscountLine {
                product_id: ProductId::new(),
                category_id: None,
                line_total: Money::from_minor(2_000),
            },
        ];

        let outcome = service(&store)
            .validate_and_apply(&RequestContext::system(), req.clone())
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            DiscountApplication::Applied { amount, .. } if amount == Money::from_minor(500)
        ));

        req.lines.remove(0);
        req.order_id = OrderId::new();
        let outcome = service(&store)
            .validate_and_apply(&RequestContext::system(), req)
            .await
            .unwrap();
        assert_eq!(outcome, DiscountApplication::Rejected(DiscountRejection::OutOfScope));
    }

    #[tokio::test]
    async fn per_user_limit_counts_pending_usages() {
        let store = InMemoryStore::new();
        let mut code = fixtures::fixed_code("ONCE", 100, 10);
        code.per_user_limit = Some(1);
        fixtures::seed_discount_code(&store, code).await.unwrap();
        let svc = service(&store);

        let first = request("ONCE", 1_000);
        let mut second = request("ONCE", 1_000);
        second.user_id = first.user_id;

        let ctx = RequestContext::system();
        assert!(matches!(
            svc.validate_and_apply(&ctx, first).await.unwrap(),
            DiscountApplication::Applied { .. }
        ));
        assert_eq!(
            svc.validate_and_apply(&ctx, second).await.unwrap(),
            DiscountApplication::Rejected(DiscountRejection::PerUserLimitReached)
        );
    }

    #[tokio::test]
    async fn confirm_then_rollback_restores_the_usage_count() {
        let store = InMemoryStore::new();
        let code = fixtures::seed_discount_code(
            &store,
            DiscountCode::new(
                "WELCOME",
                DiscountKind::FixedAmount {
                    amount: Money::from_minor(100),
                },
                3,
                checkout_testing::epoch(),
            ),
        )
        .await
        .unwrap();
        let svc = service(&store);
        let ctx = RequestContext::system();
        let req = request("WELCOME", 1_000);
        let order_id = req.order_id;

        svc.validate_and_apply(&ctx, req).await.unwrap();
        assert!(svc.confirm(&ctx, code.id, order_id).await.unwrap());
        assert!(!svc.confirm(&ctx, code.id, order_id).await.unwrap());
        assert_eq!(store.discount_code(code.id).unwrap().usage_count, 1);

        assert!(svc.rollback(&ctx, code.id, order_id).await.unwrap());
        assert_eq!(store.discount_code(code.id).unwrap().usage_count, 0);
        assert!(
            store
                .discount_usages(order_id)
                .iter()
                .all(|u| u.status == DiscountUsageStatus::Cancelled)
        );
    }
}
