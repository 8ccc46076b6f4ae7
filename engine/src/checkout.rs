//! Cart to order.
//!
//! One transaction reserves stock for every line, applies the discount code,
//! holds the wallet amount, inserts the order and records every event. It
//! either commits all of that or nothing. The gateway is called only after
//! the commit.
//!
//! A retry with an idempotency key that already produced an order returns
//! that order and touches nothing. Two concurrent submissions of the same key
//! race on the order's unique key (or on the first variant row); the loser
//! rolls back and, once the winner has committed, also gets the original
//! order back.

use crate::discount::{ApplyDiscount, DiscountService};
use crate::inventory::{InventoryService, ReserveStock};
use crate::payment::PaymentService;
use crate::settings::CheckoutSettings;
use crate::wallet::WalletService;
use checkout_core::audit::{AuditInfo, SoftDelete};
use checkout_core::context::RequestContext;
use checkout_core::environment::Clock;
use checkout_core::error::{BusinessRuleViolation, CheckoutError, StoreError};
use checkout_core::event::{DomainEvent, StockLine};
use checkout_core::gateway::{GatewayRegistry, PaymentRedirect};
use checkout_core::model::{DiscountApplication, DiscountLine, Order, OrderItem, OrderStatus};
use checkout_core::store::{OrderRepository, Transaction, UnitOfWork};
use checkout_core::types::{
    IdempotencyKey, Money, OrderId, OrderItemId, ReferenceNumber, RowVersion, UserId, VariantId,
};
use checkout_core::unit_of_work::{discard, finish, record_event};
use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

/// One cart line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CartLine {
    /// Variant to buy.
    pub variant_id: VariantId,
    /// Units to buy.
    pub quantity: u32,
    /// Price per unit.
    pub unit_price: Money,
}

/// A checkout submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaceOrder {
    /// Client retry token.
    pub idempotency_key: String,
    /// Cart lines. Lines for the same variant are merged.
    pub lines: Vec<CartLine>,
    /// Discount code typed by the customer.
    pub discount_code: Option<String>,
    /// Amount the customer wants to pay from the wallet. Capped at the order
    /// total.
    pub wallet_amount: Option<Money>,
    /// E-mail or phone passed to the gateway.
    pub contact: Option<String>,
}

/// Result of a checkout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckoutOutcome {
    /// A new order was created.
    Placed {
        /// The order, already paid when the wallet covered it.
        order: Order,
        /// Where to send the customer, when a gateway payment is owed.
        payment: Option<PaymentRedirect>,
    },
    /// The idempotency key was used before; nothing was reserved.
    Duplicate {
        /// The order created by the first submission.
        order: Order,
    },
}

impl CheckoutOutcome {
    /// The order, new or original.
    #[must_use]
    pub const fn order(&self) -> &Order {
        match self {
            Self::Placed { order, .. } | Self::Duplicate { order } => order,
        }
    }
}

/// Turns carts into orders.
#[derive(Clone)]
pub struct CheckoutService {
    uow: Arc<dyn UnitOfWork>,
    clock: Arc<dyn Clock>,
    payments: PaymentService,
}

impl CheckoutService {
    /// Service over `uow`, paying through `gateways`.
    #[must_use]
    pub fn new(
        uow: Arc<dyn UnitOfWork>,
        clock: Arc<dyn Clock>,
        gateways: GatewayRegistry,
        settings: CheckoutSettings,
    ) -> Self {
        let payments = PaymentService::new(Arc::clone(&uow), Arc::clone(&clock), gateways, settings);
        Self {
            uow,
            clock,
            payments,
        }
    }

    /// The payment orchestrator this service hands orders to.
    #[must_use]
    pub const fn payments(&self) -> &PaymentService {
        &self.payments
    }

    /// Places an order for the customer in `ctx`.
    ///
    /// # Errors
    ///
    /// - [`BusinessRuleViolation`] for a missing customer, a bad idempotency
    ///   key, an empty cart, missing stock, a rejected discount code or an
    ///   insufficient wallet balance
    /// - [`CheckoutError::ConcurrencyConflict`] if another checkout changed a
    ///   variant first; the caller may resubmit
    /// - [`CheckoutError::Gateway`] if the payment could not be requested; the
    ///   order has been cancelled
    #[tracing::instrument(skip_all, fields(
        correlation_id = %ctx.correlation_id,
        user_id = ?ctx.user_id,
        idempotency_key = %request.idempotency_key,
    ))]
    pub async fn place_order(
        &self,
        ctx: &RequestContext,
        request: PlaceOrder,
    ) -> Result<CheckoutOutcome, CheckoutError> {
        let started = Instant::now();
        let result = self.place(ctx, request).await;
        histogram!("checkout_duration_seconds").record(started.elapsed().as_secs_f64());

        let outcome = match &result {
            Ok(CheckoutOutcome::Placed { .. }) => "placed",
            Ok(CheckoutOutcome::Duplicate { .. }) => "duplicate",
            Err(CheckoutError::BusinessRule(_)) => "rejected",
            Err(CheckoutError::ConcurrencyConflict { .. }) => "conflict",
            Err(_) => "failed",
        };
        counter!("checkout_orders_total", "outcome" => outcome).increment(1);
        crate::observe("checkout.place_order", &result);
        result
    }

    async fn place(
        &self,
        ctx: &RequestContext,
        request: PlaceOrder,
    ) -> Result<CheckoutOutcome, CheckoutError> {
        let user_id = ctx.user_id.ok_or(BusinessRuleViolation::MissingCustomer)?;
        let key = IdempotencyKey::parse(&request.idempotency_key)
            .ok_or(BusinessRuleViolation::InvalidIdempotencyKey)?;

        if let Some(order) = self.find_by_key(&key).await? {
            tracing::info!(order_id = %order.id, "Checkout retried, returning original order");
            return Ok(CheckoutOutcome::Duplicate { order });
        }

        let lines = merge_lines(&request.lines)?;
        let now = self.clock.now();
        let mut tx = self.uow.begin().await?;
        let result = Self::place_in(tx.as_mut(), ctx, user_id, &key, &lines, &request, now).await;

        let order = match finish(tx, result).await {
            Ok(order) => order,
            Err(error) if error.is_conflict() => {
                // The winner of a same-key race may have committed by now.
                if let Some(order) = self.find_by_key(&key).await? {
                    tracing::info!(order_id = %order.id, "Concurrent checkout with the same key won");
                    return Ok(CheckoutOutcome::Duplicate { order });
                }
                return Err(error);
            }
            Err(error) => return Err(error),
        };
        tracing::info!(
            order_id = %order.id,
            total = %order.total,
            wallet_amount = %order.wallet_amount,
            gateway_amount = %order.gateway_amount,
            "Order placed"
        );

        if order.is_wallet_only() {
            let order = self.payments.settle_wallet_only_order(ctx, order.id).await?;
            return Ok(CheckoutOutcome::Placed {
                order,
                payment: None,
            });
        }

        let redirect = self
            .payments
            .initiate_payment(ctx, order.id, request.contact.clone())
            .await?;
        Ok(CheckoutOutcome::Placed {
            order,
            payment: Some(redirect),
        })
    }

    #[allow(clippy::too_many_lines)]
    async fn place_in(
        tx: &mut dyn Transaction,
        ctx: &RequestContext,
        user_id: UserId,
        key: &IdempotencyKey,
        lines: &[CartLine],
        request: &PlaceOrder,
        now: DateTime<Utc>,
    ) -> Result<Order, CheckoutError> {
        let order_id = OrderId::new();
        let reference = ReferenceNumber::for_order(order_id);

        let mut items = Vec::with_capacity(lines.len());
        let mut discount_lines = Vec::with_capacity(lines.len());
        let mut stock_lines = Vec::with_capacity(lines.len());
        for line in lines {
            let item_id = OrderItemId::new();
            let reserve = ReserveStock::new(line.variant_id, line.quantity, reference.clone())
                .for_item(item_id);
            let variant = InventoryService::reserve_in(tx, ctx, &reserve, now).await?;

            let line_total = line.unit_price.checked_mul(line.quantity).ok_or_else(|| {
                BusinessRuleViolation::InvalidQuantity(format!(
                    "line total of variant {} overflows",
                    line.variant_id
                ))
            })?;
            items.push(OrderItem {
                id: item_id,
                variant_id: line.variant_id,
                quantity: line.quantity,
                unit_price: line.unit_price,
                line_total,
            });
            discount_lines.push(DiscountLine {
                product_id: variant.product_id,
                category_id: variant.category_id,
                line_total,
            });
            stock_lines.push(StockLine {
                variant_id: line.variant_id,
                quantity: i64::from(line.quantity),
            });
        }
        let subtotal = items
            .iter()
            .try_fold(Money::ZERO, |acc, item| acc.checked_add(item.line_total))
            .ok_or_else(|| BusinessRuleViolation::InvalidQuantity("order total overflows".to_string()))?;
        record_event(
            tx,
            ctx,
            &DomainEvent::StockReserved {
                reference: reference.clone(),
                lines: stock_lines,
            },
            now,
        )
        .await?;

        let mut discount_code_id = None;
        let mut discount_total = Money::ZERO;
        if let Some(code) = request
            .discount_code
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
        {
            let apply = ApplyDiscount {
                code: code.to_string(),
                order_total: subtotal,
                user_id,
                order_id,
                lines: discount_lines,
            };
            match DiscountService::validate_and_apply_in(tx, ctx, &apply, now).await? {
                DiscountApplication::Applied {
                    discount_code_id: id,
                    amount,
                    ..
                } => {
                    discount_code_id = Some(id);
                    discount_total = amount;
                }
                DiscountApplication::Rejected(rejection) => return Err(rejection.into()),
            }
        }
        let total = subtotal.saturating_sub(discount_total);

        let wallet_amount = request
            .wallet_amount
            .map_or(Money::ZERO, |amount| amount.min(total));
        let wallet_reservation_id = if wallet_amount.is_zero() {
            None
        } else {
            let hold =
                WalletService::reserve_in(tx, ctx, user_id, wallet_amount, order_id, now).await?;
            Some(hold.id)
        };

        let order = Order {
            id: order_id,
            idempotency_key: key.clone(),
            user_id,
            status: OrderStatus::PendingPayment,
            subtotal,
            discount_total,
            total,
            wallet_amount,
            gateway_amount: total.saturating_sub(wallet_amount),
            reservation_reference: reference,
            discount_code_id,
            wallet_reservation_id,
            items,
            row_version: RowVersion::INITIAL,
            audit: AuditInfo::new(now),
            deletion: SoftDelete::default(),
        };
        tx.insert_order(order.clone()).await.map_err(|error| match error {
            StoreError::UniqueViolation { .. } => CheckoutError::ConcurrencyConflict {
                entity: "order",
                id: key.to_string(),
            },
            other => other.into(),
        })?;
        record_event(
            tx,
            ctx,
            &DomainEvent::OrderPlaced {
                order_id,
                user_id,
                total,
                wallet_amount: order.wallet_amount,
                gateway_amount: order.gateway_amount,
            },
            now,
        )
        .await?;
        Ok(order)
    }

    async fn find_by_key(&self, key: &IdempotencyKey) -> Result<Option<Order>, CheckoutError> {
        let mut tx = self.uow.begin().await?;
        let result = tx
            .find_order_by_idempotency_key(key.clone())
            .await
            .map_err(CheckoutError::from);
        discard(tx, result).await
    }
}

/// Validates the cart and merges lines for the same variant, sorted by
/// variant id so every checkout locks rows in the same order.
fn merge_lines(lines: &[CartLine]) -> Result<Vec<CartLine>, CheckoutError> {
    if lines.is_empty() {
        return Err(BusinessRuleViolation::EmptyCart.into());
    }
    let mut merged: BTreeMap<VariantId, CartLine> = BTreeMap::new();
    for line in lines {
        if line.quantity == 0 {
            return Err(BusinessRuleViolation::InvalidQuantity(format!(
                "quantity of variant {} must be positive",
                line.variant_id
            ))
            .into());
        }
        match merged.get_mut(&line.variant_id) {
            Some(existing) => {
                existing.quantity = existing.quantity.checked_add(line.quantity).ok_or_else(|| {
                    BusinessRuleViolation::InvalidQuantity(format!(
                        "quantity of variant {} overflows",
                        line.variant_id
                    ))
                })?;
            }
            None => {
                merged.insert(line.variant_id, *line);
            }
        }
    }
    Ok(merged.into_values().collect())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn line(variant_id: VariantId, quantity: u32) -> CartLine {
        CartLine {
            variant_id,
            quantity,
            unit_price: Money::from_minor(100),
        }
    }

    #[test]
    fn empty_cart_is_rejected() {
        assert!(matches!(
            merge_lines(&[]),
            Err(CheckoutError::BusinessRule(BusinessRuleViolation::EmptyCart))
        ));
    }

    #[test]
    fn zero_quantity_is_rejected() {
        assert!(matches!(
            merge_lines(&[line(VariantId::new(), 0)]),
            Err(CheckoutError::BusinessRule(BusinessRuleViolation::InvalidQuantity(_)))
        ));
    }

    #[test]
    fn lines_are_merged_and_sorted() {
        let a = VariantId::new();
        let b = VariantId::new();

        let merged = merge_lines(&[line(a, 1), line(b, 2), line(a, 3)]).unwrap();

        assert_eq!(merged.len(), 2);
        assert!(merged[0].variant_id < merged[1].variant_id);
        let total_a = merged.iter().find(|l| l.variant_id == a).unwrap().quantity;
        assert_eq!(total_a, 4);
    }
}
