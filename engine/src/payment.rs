//! Payment orchestrator.
//!
//! Gateway calls never run inside a database transaction. A payment is
//! requested or verified first, and only the outcome is written, under a row
//! lock on the payment so concurrent callbacks and webhooks for the same
//! authority settle it exactly once. Settlement moves every hold the order
//! owns in the same transaction as the payment status:
//!
//! - success: stock committed, discount confirmed, wallet debited, order paid
//! - failure: stock released, discount cancelled, wallet released (or expired
//!   for abandoned payments), order cancelled
//!
//! Locks are taken in the order payment, order, variants, discount code,
//! wallet.

use crate::discount::DiscountService;
use crate::inventory::InventoryService;
use crate::observe;
use crate::settings::CheckoutSettings;
use crate::wallet::WalletService;
use checkout_core::audit::Auditable;
use checkout_core::context::RequestContext;
use checkout_core::environment::Clock;
use checkout_core::error::{BusinessRuleViolation, CheckoutError};
use checkout_core::event::DomainEvent;
use checkout_core::gateway::{GatewayError, GatewayRegistry, PaymentRedirect, PaymentRequest};
use checkout_core::model::{CallbackStatus, Order, OrderStatus, PaymentStatus, PaymentTransaction};
use checkout_core::store::{OrderRepository, PaymentRepository, Transaction, UnitOfWork};
use checkout_core::types::OrderId;
use checkout_core::unit_of_work::{discard, finish, record_event};
use checkout_runtime::retry::retry_with_predicate;
use chrono::{DateTime, Utc};
use metrics::counter;
use std::sync::Arc;

/// How a pending payment ends.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Settlement {
    Succeeded {
        ref_id: Option<String>,
    },
    Failed {
        status: PaymentStatus,
        reason: String,
        expire_wallet: bool,
    },
}

impl Settlement {
    fn failed(reason: impl Into<String>) -> Self {
        Self::Failed {
            status: PaymentStatus::Failed,
            reason: reason.into(),
            expire_wallet: false,
        }
    }

    fn expired(status: PaymentStatus, reason: impl Into<String>) -> Self {
        Self::Failed {
            status,
            reason: reason.into(),
            expire_wallet: true,
        }
    }
}

/// Requests, verifies and settles gateway payments.
#[derive(Clone)]
pub struct PaymentService {
    uow: Arc<dyn UnitOfWork>,
    clock: Arc<dyn Clock>,
    gateways: GatewayRegistry,
    settings: CheckoutSettings,
}

impl PaymentService {
    /// Service over `uow` using `gateways`.
    #[must_use]
    pub fn new(
        uow: Arc<dyn UnitOfWork>,
        clock: Arc<dyn Clock>,
        gateways: GatewayRegistry,
        settings: CheckoutSettings,
    ) -> Self {
        Self {
            uow,
            clock,
            gateways,
            settings,
        }
    }

    /// Settings in effect.
    #[must_use]
    pub const fn settings(&self) -> &CheckoutSettings {
        &self.settings
    }

    /// Requests a payment page for the gateway part of an order.
    ///
    /// If the gateway refuses, the order is cancelled and its holds released
    /// before the error is returned.
    ///
    /// # Errors
    ///
    /// - [`CheckoutError::Gateway`] if the gateway call failed
    /// - an invalid transition if the order is not awaiting a gateway payment
    #[tracing::instrument(skip_all, fields(correlation_id = %ctx.correlation_id, order_id = %order_id))]
    pub async fn initiate_payment(
        &self,
        ctx: &RequestContext,
        order_id: OrderId,
        contact: Option<String>,
    ) -> Result<PaymentRedirect, CheckoutError> {
        let result = self.initiate(ctx, order_id, contact).await;
        observe("payment.initiate", &result);
        result
    }

    async fn initiate(
        &self,
        ctx: &RequestContext,
        order_id: OrderId,
        contact: Option<String>,
    ) -> Result<PaymentRedirect, CheckoutError> {
        let order = self.load_order(order_id).await?;
        if order.status != OrderStatus::PendingPayment {
            return Err(CheckoutError::invalid_transition(
                "order",
                order.status,
                "payment_initiated",
            ));
        }
        if order.gateway_amount.is_zero() {
            return Err(CheckoutError::invalid_transition(
                "order",
                "wallet_only",
                "payment_initiated",
            ));
        }

        let gateway = self.gateways.default_gateway()?;
        let request = PaymentRequest {
            order_id,
            amount: order.gateway_amount,
            description: format!("Order {}", order.reservation_reference),
            callback_url: self.settings.callback_url.clone(),
            contact,
        };
        let redirect = match gateway.request_payment(request).await {
            Ok(redirect) => redirect,
            Err(error) => {
                tracing::warn!(gateway = gateway.name(), error = %error, "Payment request failed, cancelling order");
                counter!("payment_transactions_total", "status" => "request_failed").increment(1);
                let reason = format!("payment request failed: {error}");
                if let Err(compensation) = self.cancel_order(ctx, order_id, &reason).await {
                    tracing::error!(error = %compensation, "Compensation after failed payment request failed");
                }
                return Err(error.into());
            }
        };

        let now = self.clock.now();
        let expires_at = now + self.settings.payment_ttl_chrono();
        let mut tx = self.uow.begin().await?;
        let result: Result<_, CheckoutError> = async {
            let order = tx
                .get_order_for_update(order_id)
                .await?
                .ok_or_else(|| CheckoutError::not_found("order", order_id))?;
            if order.status != OrderStatus::PendingPayment {
                return Err(CheckoutError::invalid_transition(
                    "order",
                    order.status,
                    "payment_initiated",
                ));
            }

            let payment = PaymentTransaction::pending(
                redirect.authority.clone(),
                order_id,
                gateway.name().to_string(),
                order.gateway_amount,
                now,
                expires_at,
            );
            let event = DomainEvent::PaymentInitiated {
                payment_id: payment.id,
                order_id,
                authority: payment.authority.clone(),
                amount: payment.amount,
            };
            tx.insert_payment(payment).await?;
            record_event(tx.as_mut(), ctx, &event, now).await?;
            Ok(())
        }
        .await;
        finish(tx, result).await?;

        counter!("payment_transactions_total", "status" => "initiated").increment(1);
        tracing::info!(
            authority = %redirect.authority,
            gateway = gateway.name(),
            "Payment initiated"
        );
        Ok(redirect)
    }

    /// Handles the customer returning from the payment page.
    ///
    /// A `NOK` callback fails the payment without asking the gateway. An `OK`
    /// callback is verified with the gateway first; transient gateway errors
    /// are retried and, if they persist, the payment stays pending so a later
    /// callback or the cleanup job can settle it. Callbacks for a settled
    /// payment return it unchanged.
    ///
    /// # Errors
    ///
    /// - [`CheckoutError::NotFound`] for unknown authorities
    /// - [`CheckoutError::Gateway`] if verification could not be completed
    #[tracing::instrument(skip_all, fields(correlation_id = %ctx.correlation_id, authority = %authority))]
    pub async fn verify_payment(
        &self,
        ctx: &RequestContext,
        authority: &str,
        status: CallbackStatus,
    ) -> Result<PaymentTransaction, CheckoutError> {
        let result = async {
            let payment = self.load_payment(authority).await?;
            if payment.status.is_terminal() {
                tracing::debug!(status = %payment.status, "Payment already settled");
                return Ok(payment);
            }
            let settlement = self.resolve(&payment, status, None).await?;
            self.settle(ctx, authority, settlement).await
        }
        .await;
        observe("payment.verify", &result);
        result
    }

    /// Handles a server-to-server notification from a gateway.
    ///
    /// Notifications for settled payments are ignored, so redelivery is
    /// harmless. `ref_id` is used when verification does not return one.
    ///
    /// # Errors
    ///
    /// - [`BusinessRuleViolation::GatewayMismatch`] if `gateway_name` did not
    ///   issue the authority
    /// - otherwise as [`PaymentService::verify_payment`]
    #[tracing::instrument(skip_all, fields(correlation_id = %ctx.correlation_id, gateway = gateway_name, authority = %authority))]
    pub async fn process_webhook(
        &self,
        ctx: &RequestContext,
        gateway_name: &str,
        authority: &str,
        status: CallbackStatus,
        ref_id: Option<String>,
    ) -> Result<PaymentTransaction, CheckoutError> {
        let result = async {
            let payment = self.load_payment(authority).await?;
            if payment.gateway_name != gateway_name {
                return Err(BusinessRuleViolation::GatewayMismatch {
                    expected: payment.gateway_name,
                    actual: gateway_name.to_string(),
                }
                .into());
            }
            if payment.status.is_terminal() {
                tracing::info!(status = %payment.status, "Ignoring webhook for settled payment");
                return Ok(payment);
            }
            let settlement = self.resolve(&payment, status, ref_id).await?;
            self.settle(ctx, authority, settlement).await
        }
        .await;
        observe("payment.webhook", &result);
        result
    }

    async fn resolve(
        &self,
        payment: &PaymentTransaction,
        status: CallbackStatus,
        fallback_ref: Option<String>,
    ) -> Result<Settlement, CheckoutError> {
        if status == CallbackStatus::Nok {
            return Ok(Settlement::failed("payment cancelled or declined"));
        }
        if payment.is_expired_at(self.clock.now()) {
            return Ok(Settlement::expired(
                PaymentStatus::Expired,
                "payment window elapsed before verification",
            ));
        }

        let gateway = self.gateways.get(&payment.gateway_name)?;
        let authority = payment.authority.clone();
        let amount = payment.amount;
        let verification = retry_with_predicate(
            self.settings.verify_retry.clone(),
            || gateway.verify_payment(authority.clone(), amount),
            GatewayError::is_transient,
        )
        .await
        .map_err(|error| {
            tracing::warn!(error = %error, "Verification failed, payment stays pending");
            CheckoutError::from(error)
        })?;

        if verification.success {
            Ok(Settlement::Succeeded {
                ref_id: verification.ref_id.or(fallback_ref),
            })
        } else {
            Ok(Settlement::failed(
                verification
                    .message
                    .unwrap_or_else(|| "gateway declined the payment".to_string()),
            ))
        }
    }

    async fn settle(
        &self,
        ctx: &RequestContext,
        authority: &str,
        settlement: Settlement,
    ) -> Result<PaymentTransaction, CheckoutError> {
        let now = self.clock.now();
        let mut tx = self.uow.begin().await?;
        let result = Self::settle_in(tx.as_mut(), ctx, authority, settlement, now).await;
        let result = finish(tx, result).await;
        if let Ok(payment) = &result {
            counter!("payment_transactions_total", "status" => payment.status.as_str()).increment(1);
        }
        result
    }

    async fn settle_in(
        tx: &mut dyn Transaction,
        ctx: &RequestContext,
        authority: &str,
        settlement: Settlement,
        now: DateTime<Utc>,
    ) -> Result<PaymentTransaction, CheckoutError> {
        let mut payment = tx
            .lock_payment_by_authority(authority.to_string())
            .await?
            .ok_or_else(|| CheckoutError::not_found("payment_transaction", authority))?;
        if payment.status.is_terminal() {
            // Settled by a concurrent callback while we talked to the gateway.
            return Ok(payment);
        }

        match settlement {
            Settlement::Succeeded { ref_id } => {
                payment.mark_succeeded(ref_id, now);
                tx.update_payment(payment.clone()).await?;
                let order = tx
                    .get_order_for_update(payment.order_id)
                    .await?
                    .ok_or_else(|| CheckoutError::not_found("order", payment.order_id))?;
                if order.status == OrderStatus::Cancelled {
                    tracing::error!(
                        order_id = %order.id,
                        amount = %payment.amount,
                        "Payment verified for a cancelled order, refund required"
                    );
                } else {
                    Self::settle_order_paid_in(tx, ctx, payment.order_id, now).await?;
                }
                let event = DomainEvent::PaymentSucceeded {
                    payment_id: payment.id,
                    order_id: payment.order_id,
                    ref_id: payment.ref_id.clone(),
                };
                record_event(tx, ctx, &event, now).await?;
                tracing::info!(order_id = %payment.order_id, ref_id = ?payment.ref_id, "Payment succeeded");
            }
            Settlement::Failed {
                status,
                reason,
                expire_wallet,
            } => {
                payment.mark_failed(status, reason.clone(), now);
                tx.update_payment(payment.clone()).await?;
                let event = DomainEvent::PaymentFailed {
                    payment_id: Some(payment.id),
                    order_id: payment.order_id,
                    reason: reason.clone(),
                };
                record_event(tx, ctx, &event, now).await?;
                Self::cancel_order_in(tx, ctx, payment.order_id, &reason, expire_wallet, now).await?;
                tracing::info!(order_id = %payment.order_id, status = %status, reason = %reason, "Payment failed");
            }
        }
        Ok(payment)
    }

    /// Commits every hold of an order and marks it paid. Settling a paid
    /// order is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an invalid transition if the order was cancelled.
    pub async fn settle_order_paid_in(
        tx: &mut dyn Transaction,
        ctx: &RequestContext,
        order_id: OrderId,
        now: DateTime<Utc>,
    ) -> Result<Order, CheckoutError> {
        let mut order = tx
            .get_order_for_update(order_id)
            .await?
            .ok_or_else(|| CheckoutError::not_found("order", order_id))?;
        match order.status {
            OrderStatus::Paid => return Ok(order),
            OrderStatus::Cancelled => {
                return Err(CheckoutError::invalid_transition(
                    "order",
                    order.status,
                    OrderStatus::Paid,
                ));
            }
            OrderStatus::PendingPayment => {}
        }

        InventoryService::commit_in(tx, ctx, &order.reservation_reference, now).await?;
        if let Some(code_id) = order.discount_code_id {
            DiscountService::confirm_in(tx, ctx, code_id, order.id, now).await?;
        }
        if let Some(reservation_id) = order.wallet_reservation_id {
            WalletService::commit_in(tx, ctx, reservation_id, now).await?;
        }

        let expected = order.row_version;
        order.status = OrderStatus::Paid;
        order.touch(now);
        order.row_version = tx.update_order(order.clone(), expected).await?;
        let event = DomainEvent::OrderPaid {
            order_id: order.id,
            user_id: order.user_id,
            total: order.total,
        };
        record_event(tx, ctx, &event, now).await?;
        counter!("checkout_orders_settled_total", "status" => "paid").increment(1);
        Ok(order)
    }

    /// Releases every hold of an order and marks it cancelled. Orders that
    /// are no longer pending are returned unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`CheckoutError`] if the store fails.
    pub async fn cancel_order_in(
        tx: &mut dyn Transaction,
        ctx: &RequestContext,
        order_id: OrderId,
        reason: &str,
        expire_wallet: bool,
        now: DateTime<Utc>,
    ) -> Result<Order, CheckoutError> {
        let mut order = tx
            .get_order_for_update(order_id)
            .await?
            .ok_or_else(|| CheckoutError::not_found("order", order_id))?;
        if order.status != OrderStatus::PendingPayment {
            return Ok(order);
        }

        InventoryService::release_in(tx, ctx, &order.reservation_reference, now).await?;
        if let Some(code_id) = order.discount_code_id {
            DiscountService::cancel_in(tx, ctx, code_id, order.id, now).await?;
        }
        if let Some(reservation_id) = order.wallet_reservation_id {
            if expire_wallet {
                WalletService::expire_in(tx, ctx, reservation_id, now).await?;
            } else {
                WalletService::release_in(tx, ctx, reservation_id, now).await?;
            }
        }

        let expected = order.row_version;
        order.status = OrderStatus::Cancelled;
        order.touch(now);
        order.row_version = tx.update_order(order.clone(), expected).await?;
        let event = DomainEvent::OrderCancelled {
            order_id: order.id,
            user_id: order.user_id,
            reason: reason.to_string(),
        };
        record_event(tx, ctx, &event, now).await?;
        counter!("checkout_orders_settled_total", "status" => "cancelled").increment(1);
        tracing::info!(order_id = %order.id, reason, "Order cancelled");
        Ok(order)
    }

    async fn cancel_order(
        &self,
        ctx: &RequestContext,
        order_id: OrderId,
        reason: &str,
    ) -> Result<Order, CheckoutError> {
        let now = self.clock.now();
        let mut tx = self.uow.begin().await?;
        let result: Result<_, CheckoutError> = async {
            let event = DomainEvent::PaymentFailed {
                payment_id: None,
                order_id,
                reason: reason.to_string(),
            };
            record_event(tx.as_mut(), ctx, &event, now).await?;
            Self::cancel_order_in(tx.as_mut(), ctx, order_id, reason, false, now).await
        }
        .await;
        finish(tx, result).await
    }

    /// Settles an order the wallet pays in full. Settling twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an invalid transition if part of the order is owed to a
    /// gateway, or if the order was cancelled.
    #[tracing::instrument(skip_all, fields(correlation_id = %ctx.correlation_id, order_id = %order_id))]
    pub async fn settle_wallet_only_order(
        &self,
        ctx: &RequestContext,
        order_id: OrderId,
    ) -> Result<Order, CheckoutError> {
        let now = self.clock.now();
        let mut tx = self.uow.begin().await?;
        let result: Result<_, CheckoutError> = async {
            let order = tx
                .get_order_for_update(order_id)
                .await?
                .ok_or_else(|| CheckoutError::not_found("order", order_id))?;
            if !order.is_wallet_only() {
                return Err(CheckoutError::invalid_transition(
                    "order",
                    "gateway_payment",
                    OrderStatus::Paid,
                ));
            }
            Self::settle_order_paid_in(tx.as_mut(), ctx, order_id, now).await
        }
        .await;
        let result = finish(tx, result).await;
        observe("payment.settle_wallet_only", &result);
        if result.is_ok() {
            tracing::info!("Wallet-only order settled");
        }
        result
    }

    /// Fails payments whose window elapsed and cancels orders that never got
    /// a payment. Returns how many were handled.
    ///
    /// Each item settles in its own transaction; one failure is logged and
    /// does not stop the run.
    ///
    /// # Errors
    ///
    /// Returns [`CheckoutError`] if the candidates cannot be read.
    #[tracing::instrument(skip_all, fields(correlation_id = %ctx.correlation_id))]
    pub async fn cleanup_abandoned_payments(
        &self,
        ctx: &RequestContext,
    ) -> Result<usize, CheckoutError> {
        let now = self.clock.now();
        let limit = self.settings.cleanup_batch_size;
        let cutoff = now - self.settings.payment_ttl_chrono();

        let mut tx = self.uow.begin().await?;
        let candidates: Result<_, CheckoutError> = async {
            let payments = tx.expired_pending_payments(now, limit).await?;
            let orders = tx.stale_pending_orders(cutoff, limit).await?;
            Ok((payments, orders))
        }
        .await;
        let (payments, orders) = discard(tx, candidates).await?;

        let mut handled = 0;
        for payment in payments {
            let settlement = Settlement::expired(PaymentStatus::Failed, "payment expired");
            match self.settle(ctx, &payment.authority, settlement).await {
                Ok(_) => {
                    handled += 1;
                    counter!("payment_cleanup_expired_total", "kind" => "payment").increment(1);
                }
                Err(error) => {
                    tracing::warn!(authority = %payment.authority, error = %error, "Could not expire payment");
                }
            }
        }

        for order in orders {
            match self.cancel_stale_order(ctx, order.id).await {
                Ok(true) => {
                    handled += 1;
                    counter!("payment_cleanup_expired_total", "kind" => "order").increment(1);
                }
                Ok(false) => {}
                Err(error) => {
                    tracing::warn!(order_id = %order.id, error = %error, "Could not cancel stale order");
                }
            }
        }

        if handled > 0 {
            tracing::info!(handled, "Abandoned payments cleaned up");
        }
        Ok(handled)
    }

    async fn cancel_stale_order(
        &self,
        ctx: &RequestContext,
        order_id: OrderId,
    ) -> Result<bool, CheckoutError> {
        let now = self.clock.now();
        let mut tx = self.uow.begin().await?;
        let result: Result<_, CheckoutError> = async {
            let order = tx
                .get_order_for_update(order_id)
                .await?
                .ok_or_else(|| CheckoutError::not_found("order", order_id))?;
            if order.status != OrderStatus::PendingPayment {
                return Ok(false);
            }
            let payments = tx.payments_for_order(order_id).await?;
            if payments.iter().any(|p| p.status == PaymentStatus::Pending) {
                return Ok(false);
            }
            Self::cancel_order_in(tx.as_mut(), ctx, order_id, "payment never completed", true, now)
                .await?;
            Ok(true)
        }
        .await;
        finish(tx, result).await
    }

    /// Reads a payment by authority.
    ///
    /// # Errors
    ///
    /// Returns [`CheckoutError::NotFound`] for unknown authorities.
    pub async fn load_payment(&self, authority: &str) -> Result<PaymentTransaction, CheckoutError> {
        let mut tx = self.uow.begin().await?;
        let result = tx
            .get_payment_by_authority(authority.to_string())
            .await
            .map_err(CheckoutError::from)
            .and_then(|p| p.ok_or_else(|| CheckoutError::not_found("payment_transaction", authority)));
        discard(tx, result).await
    }

    async fn load_order(&self, order_id: OrderId) -> Result<Order, CheckoutError> {
        let mut tx = self.uow.begin().await?;
        let result = tx
            .get_order(order_id)
            .await
            .map_err(CheckoutError::from)
            .and_then(|o| o.ok_or_else(|| CheckoutError::not_found("order", order_id)));
        discard(tx, result).await
    }
}
