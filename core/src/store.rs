//! Persistence contracts.
//!
//! Each repository trait covers one table family. A backend implements all of
//! them on its transaction type, which is then exposed as a
//! [`Transaction`] trait object by a [`UnitOfWork`]. Every read and write of a
//! command goes through the same transaction so the whole command commits or
//! rolls back as one.
//!
//! # Locking contract
//!
//! - `*_for_update` and `lock_*` methods take an exclusive row lock held until
//!   the transaction ends.
//! - `update_*` methods that take an expected [`RowVersion`] write only if the
//!   stored version still matches, waiting for any concurrent writer of the
//!   same row to finish first, and fail with
//!   [`StoreError::ConcurrencyConflict`] otherwise.
//! - Reads see data committed by other transactions plus this transaction's
//!   own writes.
//!
//! # Dyn Compatibility
//!
//! Methods return [`StoreFuture`] instead of using `async fn` so
//! `Box<dyn Transaction>` works.

use crate::error::StoreError;
use crate::model::{
    DiscountCode, DiscountUsage, InventoryTransaction, Order, OutboxMessage, PaymentTransaction,
    ProductVariant, StockLevels, WalletLedgerEntry, WalletReservation,
};
use crate::types::{
    DiscountCodeId, IdempotencyKey, Money, OrderId, OutboxMessageId, ReferenceNumber, RowVersion,
    UserId, VariantId, WalletReservationId,
};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::pin::Pin;

/// Store result.
pub type StoreResult<T> = Result<T, StoreError>;

/// Boxed future returned by store operations.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = StoreResult<T>> + Send + 'a>>;

/// Product variants and their cached stock counters.
pub trait VariantRepository {
    /// Reads a variant without locking it.
    fn get_variant(&mut self, id: VariantId) -> StoreFuture<'_, Option<ProductVariant>>;

    /// Reads a variant and locks its row.
    fn get_variant_for_update(&mut self, id: VariantId)
    -> StoreFuture<'_, Option<ProductVariant>>;

    /// Inserts a new variant.
    fn insert_variant(&mut self, variant: ProductVariant) -> StoreFuture<'_, ()>;

    /// Writes counters and audit fields if the stored version equals
    /// `expected`, returning the new version.
    fn update_variant(
        &mut self,
        variant: ProductVariant,
        expected: RowVersion,
    ) -> StoreFuture<'_, RowVersion>;
}

/// Append-only stock ledger.
pub trait InventoryLedger {
    /// Appends one ledger row.
    fn append_inventory_transaction(&mut self, entry: InventoryTransaction)
    -> StoreFuture<'_, ()>;

    /// Rows written under `reference`, oldest first.
    fn inventory_transactions_by_reference(
        &mut self,
        reference: ReferenceNumber,
    ) -> StoreFuture<'_, Vec<InventoryTransaction>>;

    /// Stock levels derived from the ledger alone.
    fn ledger_totals(&mut self, variant_id: VariantId) -> StoreFuture<'_, StockLevels>;
}

/// Discount codes and usages.
pub trait DiscountRepository {
    /// Locks the code with this normalized text.
    fn lock_discount_code(&mut self, code: String) -> StoreFuture<'_, Option<DiscountCode>>;

    /// Locks the code with this id.
    fn lock_discount_code_by_id(
        &mut self,
        id: DiscountCodeId,
    ) -> StoreFuture<'_, Option<DiscountCode>>;

    /// Inserts a new code.
    fn insert_discount_code(&mut self, code: DiscountCode) -> StoreFuture<'_, ()>;

    /// Writes a code if the stored version equals `expected`.
    fn update_discount_code(
        &mut self,
        code: DiscountCode,
        expected: RowVersion,
    ) -> StoreFuture<'_, RowVersion>;

    /// Inserts a usage.
    fn insert_discount_usage(&mut self, usage: DiscountUsage) -> StoreFuture<'_, ()>;

    /// Overwrites a usage.
    fn update_discount_usage(&mut self, usage: DiscountUsage) -> StoreFuture<'_, ()>;

    /// Usages attached to an order.
    fn discount_usages_for_order(&mut self, order_id: OrderId)
    -> StoreFuture<'_, Vec<DiscountUsage>>;

    /// Pending usages of a code.
    fn count_pending_usages(&mut self, id: DiscountCodeId) -> StoreFuture<'_, u32>;

    /// Pending and confirmed usages of a code by one customer.
    fn count_user_usages(&mut self, id: DiscountCodeId, user_id: UserId) -> StoreFuture<'_, u32>;
}

/// Orders and their lines.
pub trait OrderRepository {
    /// Order created with this idempotency key.
    fn find_order_by_idempotency_key(
        &mut self,
        key: IdempotencyKey,
    ) -> StoreFuture<'_, Option<Order>>;

    /// Reads an order without locking it.
    fn get_order(&mut self, id: OrderId) -> StoreFuture<'_, Option<Order>>;

    /// Reads an order and locks its row.
    fn get_order_for_update(&mut self, id: OrderId) -> StoreFuture<'_, Option<Order>>;

    /// Inserts an order with its lines.
    ///
    /// Fails with [`StoreError::UniqueViolation`] if the idempotency key is
    /// already taken, including by a transaction that has not committed yet.
    fn insert_order(&mut self, order: Order) -> StoreFuture<'_, ()>;

    /// Writes the order header if the stored version equals `expected`.
    fn update_order(&mut self, order: Order, expected: RowVersion) -> StoreFuture<'_, RowVersion>;

    /// Orders still awaiting payment that were created before `cutoff`,
    /// oldest first.
    fn stale_pending_orders(
        &mut self,
        cutoff: DateTime<Utc>,
        limit: u32,
    ) -> StoreFuture<'_, Vec<Order>>;
}

/// Gateway transactions.
pub trait PaymentRepository {
    /// Inserts a transaction.
    fn insert_payment(&mut self, payment: PaymentTransaction) -> StoreFuture<'_, ()>;

    /// Reads a transaction without locking it.
    fn get_payment_by_authority(
        &mut self,
        authority: String,
    ) -> StoreFuture<'_, Option<PaymentTransaction>>;

    /// Reads a transaction and locks its row.
    fn lock_payment_by_authority(
        &mut self,
        authority: String,
    ) -> StoreFuture<'_, Option<PaymentTransaction>>;

    /// Transactions of an order, oldest first.
    fn payments_for_order(&mut self, order_id: OrderId)
    -> StoreFuture<'_, Vec<PaymentTransaction>>;

    /// Pending transactions whose deadline passed before `now`.
    fn expired_pending_payments(
        &mut self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> StoreFuture<'_, Vec<PaymentTransaction>>;

    /// Overwrites a transaction.
    fn update_payment(&mut self, payment: PaymentTransaction) -> StoreFuture<'_, ()>;
}

/// Wallet holds and the wallet ledger.
pub trait WalletRepository {
    /// Serializes wallet operations of one customer until the transaction ends.
    fn lock_wallet(&mut self, user_id: UserId) -> StoreFuture<'_, ()>;

    /// Sum of ledger deltas.
    fn wallet_balance(&mut self, user_id: UserId) -> StoreFuture<'_, i64>;

    /// Sum of pending holds.
    fn pending_reservations_total(&mut self, user_id: UserId) -> StoreFuture<'_, Money>;

    /// Inserts a hold.
    fn insert_wallet_reservation(&mut self, reservation: WalletReservation)
    -> StoreFuture<'_, ()>;

    /// Reads a hold.
    fn get_wallet_reservation(
        &mut self,
        id: WalletReservationId,
    ) -> StoreFuture<'_, Option<WalletReservation>>;

    /// Overwrites a hold.
    fn update_wallet_reservation(&mut self, reservation: WalletReservation)
    -> StoreFuture<'_, ()>;

    /// Appends a ledger entry.
    fn append_wallet_entry(&mut self, entry: WalletLedgerEntry) -> StoreFuture<'_, ()>;
}

/// Transactional outbox.
pub trait OutboxRepository {
    /// Appends a message.
    fn append_outbox_message(&mut self, message: OutboxMessage) -> StoreFuture<'_, ()>;

    /// Leases up to `limit` claimable messages until `lease_until`, oldest
    /// first, skipping rows another transaction has locked.
    fn claim_outbox_batch(
        &mut self,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
        limit: u32,
        max_attempts: u32,
    ) -> StoreFuture<'_, Vec<OutboxMessage>>;

    /// Sets `processed_at` and clears the lease.
    fn mark_outbox_processed(
        &mut self,
        id: OutboxMessageId,
        processed_at: DateTime<Utc>,
    ) -> StoreFuture<'_, ()>;

    /// Records a delivery failure: stores the error, increments attempts and
    /// clears the lease.
    fn mark_outbox_failed(&mut self, id: OutboxMessageId, error: String) -> StoreFuture<'_, ()>;

    /// Resets attempts and error of an unprocessed message. Returns `false` if
    /// the message was already processed.
    fn requeue_outbox_message(&mut self, id: OutboxMessageId) -> StoreFuture<'_, bool>;

    /// Reads a message.
    fn get_outbox_message(&mut self, id: OutboxMessageId)
    -> StoreFuture<'_, Option<OutboxMessage>>;
}

/// An open database transaction.
///
/// Dropping a transaction without calling [`Transaction::commit`] rolls it back.
pub trait Transaction:
    VariantRepository
    + InventoryLedger
    + DiscountRepository
    + OrderRepository
    + PaymentRepository
    + WalletRepository
    + OutboxRepository
    + Send
{
    /// Makes every write of this transaction durable and visible.
    fn commit(self: Box<Self>) -> StoreFuture<'static, ()>;

    /// Discards every write of this transaction.
    fn rollback(self: Box<Self>) -> StoreFuture<'static, ()>;
}

/// Source of transactions.
pub trait UnitOfWork: Send + Sync {
    /// Opens a transaction.
    fn begin(&self) -> StoreFuture<'_, Box<dyn Transaction>>;
}
