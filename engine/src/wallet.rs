//! Wallet reservations.
//!
//! A hold reduces what a customer can spend without touching the ledger;
//! only `commit` writes a (negative) ledger entry. Every operation on one
//! customer's wallet runs under a per-customer lock, so the balance check
//! and the new hold cannot interleave with a concurrent checkout.

use crate::observe;
use checkout_core::context::RequestContext;
use checkout_core::environment::Clock;
use checkout_core::error::{BusinessRuleViolation, CheckoutError};
use checkout_core::event::DomainEvent;
use checkout_core::model::{
    WalletLedgerEntry, WalletReferenceType, WalletReservation, WalletReservationStatus,
};
use checkout_core::store::{Transaction, UnitOfWork, WalletRepository};
use checkout_core::types::{Money, OrderId, UserId, WalletLedgerEntryId, WalletReservationId};
use checkout_core::unit_of_work::{discard, finish, record_event};
use chrono::{DateTime, Utc};
use metrics::counter;
use std::sync::Arc;

/// Holds, debits and credits customer wallets.
#[derive(Clone)]
pub struct WalletService {
    uow: Arc<dyn UnitOfWork>,
    clock: Arc<dyn Clock>,
}

impl WalletService {
    /// Service over `uow`.
    #[must_use]
    pub fn new(uow: Arc<dyn UnitOfWork>, clock: Arc<dyn Clock>) -> Self {
        Self { uow, clock }
    }

    /// Puts `amount` of the customer's balance on hold for `order_id`.
    ///
    /// # Errors
    ///
    /// Returns [`BusinessRuleViolation::InsufficientBalance`] if the balance
    /// minus pending holds is below `amount`.
    #[tracing::instrument(skip_all, fields(
        correlation_id = %ctx.correlation_id,
        user_id = %user_id,
        order_id = %order_id,
        amount = %amount,
    ))]
    pub async fn reserve(
        &self,
        ctx: &RequestContext,
        user_id: UserId,
        amount: Money,
        order_id: OrderId,
    ) -> Result<WalletReservation, CheckoutError> {
        let now = self.clock.now();
        let mut tx = self.uow.begin().await?;
        let result = Self::reserve_in(tx.as_mut(), ctx, user_id, amount, order_id, now).await;
        let result = finish(tx, result).await;
        observe("wallet.reserve", &result);
        result
    }

    /// Reserve step usable inside a larger transaction.
    ///
    /// # Errors
    ///
    /// See [`WalletService::reserve`].
    pub async fn reserve_in(
        tx: &mut dyn Transaction,
        ctx: &RequestContext,
        user_id: UserId,
        amount: Money,
        order_id: OrderId,
        now: DateTime<Utc>,
    ) -> Result<WalletReservation, CheckoutError> {
        if amount.is_zero() {
            return Err(BusinessRuleViolation::InvalidQuantity(
                "wallet amount must be positive".to_string(),
            )
            .into());
        }

        tx.lock_wallet(user_id).await?;
        let available = available_in(tx, user_id).await?;
        if available < amount {
            return Err(BusinessRuleViolation::InsufficientBalance {
                requested: amount,
                available,
            }
            .into());
        }

        let reservation = WalletReservation::pending(user_id, order_id, amount, now);
        tx.insert_wallet_reservation(reservation.clone()).await?;
        let event = DomainEvent::WalletReserved {
            reservation_id: reservation.id,
            user_id,
            amount,
        };
        record_event(tx, ctx, &event, now).await?;
        counter!("wallet_operations_total", "operation" => "reserve").increment(1);
        tracing::info!(reservation_id = %reservation.id, "Wallet amount reserved");
        Ok(reservation)
    }

    /// Debits a pending hold. Committing a committed hold is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an invalid transition if the hold was released or expired.
    #[tracing::instrument(skip_all, fields(correlation_id = %ctx.correlation_id, reservation_id = %id))]
    pub async fn commit(
        &self,
        ctx: &RequestContext,
        id: WalletReservationId,
    ) -> Result<WalletReservation, CheckoutError> {
        let now = self.clock.now();
        let mut tx = self.uow.begin().await?;
        let result = Self::commit_in(tx.as_mut(), ctx, id, now).await;
        let result = finish(tx, result).await;
        observe("wallet.commit", &result);
        result
    }

    /// Commit step usable inside a larger transaction.
    ///
    /// # Errors
    ///
    /// See [`WalletService::commit`].
    pub async fn commit_in(
        tx: &mut dyn Transaction,
        ctx: &RequestContext,
        id: WalletReservationId,
        now: DateTime<Utc>,
    ) -> Result<WalletReservation, CheckoutError> {
        let mut reservation = locked_reservation(tx, id).await?;
        match reservation.status {
            WalletReservationStatus::Committed => return Ok(reservation),
            WalletReservationStatus::Pending => {}
            status @ (WalletReservationStatus::Released | WalletReservationStatus::Expired) => {
                return Err(CheckoutError::invalid_transition(
                    "wallet_reservation",
                    status,
                    WalletReservationStatus::Committed,
                ));
            }
        }

        let balance = tx.wallet_balance(reservation.user_id).await?;
        let delta = -reservation.amount.as_signed();
        let entry = WalletLedgerEntry {
            id: WalletLedgerEntryId::new(),
            user_id: reservation.user_id,
            amount_delta: delta,
            balance_after: balance + delta,
            reference_type: WalletReferenceType::Order,
            reference_id: reservation.order_id.to_string(),
            occurred_at: now,
        };
        let balance_after = entry.balance_after;
        tx.append_wallet_entry(entry).await?;

        reservation.status = WalletReservationStatus::Committed;
        reservation.updated_at = now;
        tx.update_wallet_reservation(reservation.clone()).await?;

        let event = DomainEvent::WalletCommitted {
            reservation_id: id,
            user_id: reservation.user_id,
            amount: reservation.amount,
            balance_after,
        };
        record_event(tx, ctx, &event, now).await?;
        counter!("wallet_operations_total", "operation" => "commit").increment(1);
        tracing::info!(balance_after, "Wallet reservation committed");
        Ok(reservation)
    }

    /// Gives a pending hold back. Releasing twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an invalid transition if the hold was already committed.
    #[tracing::instrument(skip_all, fields(correlation_id = %ctx.correlation_id, reservation_id = %id))]
    pub async fn release(
        &self,
        ctx: &RequestContext,
        id: WalletReservationId,
    ) -> Result<WalletReservation, CheckoutError> {
        let now = self.clock.now();
        let mut tx = self.uow.begin().await?;
        let result = Self::release_in(tx.as_mut(), ctx, id, now).await;
        let result = finish(tx, result).await;
        observe("wallet.release", &result);
        result
    }

    /// Release step usable inside a larger transaction.
    ///
    /// # Errors
    ///
    /// See [`WalletService::release`].
    pub async fn release_in(
        tx: &mut dyn Transaction,
        ctx: &RequestContext,
        id: WalletReservationId,
        now: DateTime<Utc>,
    ) -> Result<WalletReservation, CheckoutError> {
        Self::end_hold(tx, ctx, id, WalletReservationStatus::Released, now).await
    }

    /// Marks a pending hold of an abandoned payment as expired.
    ///
    /// # Errors
    ///
    /// Returns an invalid transition if the hold was already committed.
    pub async fn expire_in(
        tx: &mut dyn Transaction,
        ctx: &RequestContext,
        id: WalletReservationId,
        now: DateTime<Utc>,
    ) -> Result<WalletReservation, CheckoutError> {
        Self::end_hold(tx, ctx, id, WalletReservationStatus::Expired, now).await
    }

    async fn end_hold(
        tx: &mut dyn Transaction,
        ctx: &RequestContext,
        id: WalletReservationId,
        target: WalletReservationStatus,
        now: DateTime<Utc>,
    ) -> Result<WalletReservation, CheckoutError> {
        let mut reservation = locked_reservation(tx, id).await?;
        match reservation.status {
            WalletReservationStatus::Released | WalletReservationStatus::Expired => {
                return Ok(reservation);
            }
            WalletReservationStatus::Committed => {
                return Err(CheckoutError::invalid_transition(
                    "wallet_reservation",
                    reservation.status,
                    target,
                ));
            }
            WalletReservationStatus::Pending => {}
        }

        reservation.status = target;
        reservation.updated_at = now;
        tx.update_wallet_reservation(reservation.clone()).await?;

        let event = DomainEvent::WalletReleased {
            reservation_id: id,
            user_id: reservation.user_id,
            expired: target == WalletReservationStatus::Expired,
        };
        record_event(tx, ctx, &event, now).await?;
        counter!("wallet_operations_total", "operation" => target.as_str()).increment(1);
        tracing::info!(status = %target, "Wallet reservation ended");
        Ok(reservation)
    }

    /// Adds `amount` to a wallet (top-up or refund) and returns the new
    /// balance.
    ///
    /// # Errors
    ///
    /// Returns [`BusinessRuleViolation::InvalidQuantity`] for a zero amount.
    #[tracing::instrument(skip_all, fields(correlation_id = %ctx.correlation_id, user_id = %user_id, amount = %amount))]
    pub async fn credit(
        &self,
        ctx: &RequestContext,
        user_id: UserId,
        amount: Money,
        reference: &str,
    ) -> Result<i64, CheckoutError> {
        let now = self.clock.now();
        let mut tx = self.uow.begin().await?;
        let result: Result<_, CheckoutError> = async {
            if amount.is_zero() {
                return Err(BusinessRuleViolation::InvalidQuantity(
                    "credit must be positive".to_string(),
                )
                .into());
            }
            tx.lock_wallet(user_id).await?;
            let balance = tx.wallet_balance(user_id).await?;
            let delta = amount.as_signed();
            tx.append_wallet_entry(WalletLedgerEntry {
                id: WalletLedgerEntryId::new(),
                user_id,
                amount_delta: delta,
                balance_after: balance + delta,
                reference_type: WalletReferenceType::Credit,
                reference_id: reference.to_string(),
                occurred_at: now,
            })
            .await?;
            let event = DomainEvent::WalletCredited {
                user_id,
                amount,
                balance_after: balance + delta,
            };
            record_event(tx.as_mut(), ctx, &event, now).await?;
            Ok(balance + delta)
        }
        .await;
        let result = finish(tx, result).await;
        observe("wallet.credit", &result);
        if let Ok(balance) = result {
            counter!("wallet_operations_total", "operation" => "credit").increment(1);
            tracing::info!(balance, "Wallet credited");
        }
        result
    }

    /// Sum of the customer's ledger entries.
    ///
    /// # Errors
    ///
    /// Returns [`CheckoutError`] if the store fails.
    pub async fn balance(&self, user_id: UserId) -> Result<i64, CheckoutError> {
        let mut tx = self.uow.begin().await?;
        let result = tx.wallet_balance(user_id).await.map_err(CheckoutError::from);
        discard(tx, result).await
    }

    /// Balance minus pending holds.
    ///
    /// # Errors
    ///
    /// Returns [`CheckoutError`] if the store fails.
    pub async fn available(&self, user_id: UserId) -> Result<Money, CheckoutError> {
        let mut tx = self.uow.begin().await?;
        let result = available_in(tx.as_mut(), user_id).await;
        discard(tx, result).await
    }
}

async fn available_in(tx: &mut dyn Transaction, user_id: UserId) -> Result<Money, CheckoutError> {
    let balance = tx.wallet_balance(user_id).await?;
    let held = tx.pending_reservations_total(user_id).await?;
    Ok(Money::from_signed(balance.saturating_sub(held.as_signed())))
}

/// Reads a hold, takes its owner's wallet lock, then reads it again so the
/// status is the one committed by whoever held the lock before.
async fn locked_reservation(
    tx: &mut dyn Transaction,
    id: WalletReservationId,
) -> Result<WalletReservation, CheckoutError> {
    let reservation = tx
        .get_wallet_reservation(id)
        .await?
        .ok_or_else(|| CheckoutError::not_found("wallet_reservation", id))?;
    tx.lock_wallet(reservation.user_id).await?;
    tx.get_wallet_reservation(id)
        .await?
        .ok_or_else(|| CheckoutError::not_found("wallet_reservation", id))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use checkout_testing::{InMemoryStore, fixtures, test_clock};

    fn service(store: &InMemoryStore) -> WalletService {
        WalletService::new(Arc::new(store.clone()), Arc::new(test_clock()))
    }

    #[tokio::test]
    async fn holds_reduce_available_but_not_balance() {
        let store = InMemoryStore::new();
        let user = UserId::new();
        fixtures::seed_wallet(&store, user, 1_000).await.unwrap();
        let wallet = service(&store);
        let ctx = RequestContext::for_user(user);

        wallet
            .reserve(&ctx, user, Money::from_minor(600), OrderId::new())
            .await
            .unwrap();

        assert_eq!(wallet.balance(user).await.unwrap(), 1_000);
        assert_eq!(wallet.available(user).await.unwrap(), Money::from_minor(400));

        let err = wallet
            .reserve(&ctx, user, Money::from_minor(500), OrderId::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CheckoutError::BusinessRule(BusinessRuleViolation::InsufficientBalance { available, .. })
                if available == Money::from_minor(400)
        ));
    }

    #[tokio::test]
    async fn commit_debits_once() {
        let store = InMemoryStore::new();
        let user = UserId::new();
        fixtures::seed_wallet(&store, user, 1_000).await.unwrap();
        let wallet = service(&store);
        let ctx = RequestContext::for_user(user);
        let hold = wallet
            .reserve(&ctx, user, Money::from_minor(250), OrderId::new())
            .await
            .unwrap();

        wallet.commit(&ctx, hold.id).await.unwrap();
        wallet.commit(&ctx, hold.id).await.unwrap();

        let entries = store.wallet_entries(user);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].amount_delta, -250);
        assert_eq!(entries[1].balance_after, 750);
        assert_eq!(wallet.available(user).await.unwrap(), Money::from_minor(750));
    }

    #[tokio::test]
    async fn release_is_idempotent_and_final() {
        let store = InMemoryStore::new();
        let user = UserId::new();
        fixtures::seed_wallet(&store, user, 1_000).await.unwrap();
        let wallet = service(&store);
        let ctx = RequestContext::for_user(user);
        let hold = wallet
            .reserve(&ctx, user, Money::from_minor(250), OrderId::new())
            .await
            .unwrap();

        let released = wallet.release(&ctx, hold.id).await.unwrap();
        assert_eq!(released.status, WalletReservationStatus::Released);
        wallet.release(&ctx, hold.id).await.unwrap();

        assert!(wallet.commit(&ctx, hold.id).await.is_err());
        assert_eq!(store.wallet_entries(user).len(), 1);
        assert_eq!(wallet.available(user).await.unwrap(), Money::from_minor(1_000));
    }

    #[tokio::test]
    async fn credit_appends_to_the_ledger() {
        let store = InMemoryStore::new();
        let user = UserId::new();
        let wallet = service(&store);

        let balance = wallet
            .credit(&RequestContext::system(), user, Money::from_minor(300), "refund-17")
            .await
            .unwrap();

        assert_eq!(balance, 300);
        assert_eq!(store.outbox_types(), vec!["WalletCredited.v1".to_string()]);
    }
}
