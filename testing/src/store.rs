//! In-memory [`UnitOfWork`] with the transaction semantics of the Postgres
//! backend.
//!
//! - Writes are buffered per transaction and applied atomically on commit;
//!   other transactions only ever see committed data (read committed).
//! - Row locks are `tokio` mutexes keyed by row; a transaction keeps its
//!   guards until it commits, rolls back or is dropped, and re-acquiring a
//!   lock it already holds is a no-op.
//! - Version-checked updates lock the row first, so a second writer waits for
//!   the first to finish and then fails with a concurrency conflict.
//! - Inserting an order locks its idempotency key, so a concurrent duplicate
//!   waits for the first insert and then fails with a unique violation.
//! - Outbox claims skip rows locked by other transactions.
//!
//! The synchronous inspection methods read committed state only and are
//! meant for test assertions.

use checkout_core::error::StoreError;
use checkout_core::model::{
    DiscountCode, DiscountUsage, DiscountUsageStatus, InventoryTransaction, Order, OrderStatus, OutboxMessage,
    PaymentStatus, PaymentTransaction, ProductVariant, StockLevels, WalletLedgerEntry,
    WalletReservation, WalletReservationStatus,
};
use checkout_core::store::{
    DiscountRepository, InventoryLedger, OrderRepository, OutboxRepository, PaymentRepository,
    StoreFuture, Transaction, UnitOfWork, VariantRepository, WalletRepository,
};
use checkout_core::types::{
    DiscountCodeId, DiscountUsageId, IdempotencyKey, Money, OrderId, OutboxMessageId,
    ReferenceNumber, RowVersion, UserId, VariantId, WalletReservationId,
};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::OwnedMutexGuard;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Committed rows.
#[derive(Clone, Default)]
struct Tables {
    variants: HashMap<VariantId, ProductVariant>,
    inventory: Vec<InventoryTransaction>,
    discount_codes: HashMap<DiscountCodeId, DiscountCode>,
    discount_usages: HashMap<DiscountUsageId, DiscountUsage>,
    orders: HashMap<OrderId, Order>,
    payments: HashMap<String, PaymentTransaction>,
    wallet_reservations: HashMap<WalletReservationId, WalletReservation>,
    wallet_entries: Vec<WalletLedgerEntry>,
    outbox: Vec<(u64, OutboxMessage)>,
}

/// Writes buffered by one transaction.
#[derive(Default)]
struct Pending {
    variants: HashMap<VariantId, ProductVariant>,
    inventory: Vec<InventoryTransaction>,
    discount_codes: HashMap<DiscountCodeId, DiscountCode>,
    discount_usages: HashMap<DiscountUsageId, DiscountUsage>,
    orders: HashMap<OrderId, Order>,
    payments: HashMap<String, PaymentTransaction>,
    wallet_reservations: HashMap<WalletReservationId, WalletReservation>,
    wallet_entries: Vec<WalletLedgerEntry>,
    outbox_new: Vec<OutboxMessage>,
    outbox_updates: HashMap<OutboxMessageId, OutboxMessage>,
}

impl Tables {
    fn apply(&mut self, pending: Pending, outbox_seq: &AtomicU64) {
        self.variants.extend(pending.variants);
        self.inventory.extend(pending.inventory);
        self.discount_codes.extend(pending.discount_codes);
        self.discount_usages.extend(pending.discount_usages);
        self.orders.extend(pending.orders);
        self.payments.extend(pending.payments);
        self.wallet_reservations.extend(pending.wallet_reservations);
        self.wallet_entries.extend(pending.wallet_entries);
        for (_, message) in &mut self.outbox {
            if let Some(updated) = pending.outbox_updates.get(&message.id) {
                *message = updated.clone();
            }
        }
        for message in pending.outbox_new {
            let seq = outbox_seq.fetch_add(1, Ordering::SeqCst);
            self.outbox.push((seq, message));
        }
    }
}

/// Committed rows overlaid with a transaction's own writes.
fn merged_values<K, V>(committed: &HashMap<K, V>, pending: &HashMap<K, V>) -> Vec<V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    let mut rows = committed.clone();
    rows.extend(pending.iter().map(|(k, v)| (k.clone(), v.clone())));
    rows.into_values().collect()
}

fn merged_get<K, V>(committed: &HashMap<K, V>, pending: &HashMap<K, V>, key: &K) -> Option<V>
where
    K: Eq + Hash,
    V: Clone,
{
    pending.get(key).or_else(|| committed.get(key)).cloned()
}

#[derive(Default)]
struct RowLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl RowLocks {
    fn handle(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = lock(&self.locks);
        Arc::clone(locks.entry(key.to_string()).or_default())
    }
}

#[derive(Default)]
struct Shared {
    tables: Mutex<Tables>,
    row_locks: RowLocks,
    outbox_seq: AtomicU64,
    fail_next_commit: AtomicBool,
    commits: AtomicU64,
    rollbacks: AtomicU64,
}

/// In-memory persistence for tests.
///
/// Cloning shares the underlying tables.
///
/// # Example
///
/// ```
/// use checkout_core::store::{Transaction, UnitOfWork, VariantRepository};
/// use checkout_testing::{InMemoryStore, fixtures};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), checkout_core::StoreError> {
/// let store = InMemoryStore::new();
/// let variant = fixtures::variant("SKU-1");
///
/// let mut tx = store.begin().await?;
/// tx.insert_variant(variant.clone()).await?;
/// tx.commit().await?;
///
/// assert!(store.variant(variant.id).is_some());
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Default)]
pub struct InMemoryStore {
    shared: Arc<Shared>,
}

impl InMemoryStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        lock(&self.shared.tables)
    }

    /// Makes the next commit fail with a database error.
    pub fn fail_next_commit(&self) {
        self.shared.fail_next_commit.store(true, Ordering::SeqCst);
    }

    /// Number of successful commits.
    #[must_use]
    pub fn commit_count(&self) -> u64 {
        self.shared.commits.load(Ordering::SeqCst)
    }

    /// Number of rollbacks, explicit or by failed commit.
    #[must_use]
    pub fn rollback_count(&self) -> u64 {
        self.shared.rollbacks.load(Ordering::SeqCst)
    }

    /// Committed variant.
    #[must_use]
    pub fn variant(&self, id: VariantId) -> Option<ProductVariant> {
        self.tables().variants.get(&id).cloned()
    }

    /// Overwrites the cached counters of a variant without touching the
    /// ledger, simulating drift.
    pub fn set_cached_counters(&self, id: VariantId, on_hand: i64, reserved: i64) {
        if let Some(variant) = self.tables().variants.get_mut(&id) {
            variant.on_hand = on_hand;
            variant.reserved = reserved;
        }
    }

    /// Committed ledger rows of a variant, oldest first.
    #[must_use]
    pub fn inventory_ledger(&self, id: VariantId) -> Vec<InventoryTransaction> {
        self.tables()
            .inventory
            .iter()
            .filter(|row| row.variant_id == id)
            .cloned()
            .collect()
    }

    /// Stock levels derived from the committed ledger.
    #[must_use]
    pub fn ledger_levels(&self, id: VariantId) -> StockLevels {
        StockLevels::from_ledger(&self.inventory_ledger(id))
    }

    /// Committed discount code.
    #[must_use]
    pub fn discount_code(&self, id: DiscountCodeId) -> Option<DiscountCode> {
        self.tables().discount_codes.get(&id).cloned()
    }

    /// Committed usages of an order.
    #[must_use]
    pub fn discount_usages(&self, order_id: OrderId) -> Vec<DiscountUsage> {
        self.tables()
            .discount_usages
            .values()
            .filter(|usage| usage.order_id == order_id)
            .cloned()
            .collect()
    }

    /// Committed order.
    #[must_use]
    pub fn order(&self, id: OrderId) -> Option<Order> {
        self.tables().orders.get(&id).cloned()
    }

    /// Every committed order.
    #[must_use]
    pub fn orders(&self) -> Vec<Order> {
        self.tables().orders.values().cloned().collect()
    }

    /// Committed payment transaction.
    #[must_use]
    pub fn payment(&self, authority: &str) -> Option<PaymentTransaction> {
        self.tables().payments.get(authority).cloned()
    }

    /// Committed payment transactions of an order.
    #[must_use]
    pub fn payments_for(&self, order_id: OrderId) -> Vec<PaymentTransaction> {
        let mut payments: Vec<_> = self
            .tables()
            .payments
            .values()
            .filter(|p| p.order_id == order_id)
            .cloned()
            .collect();
        payments.sort_by_key(|p| p.created_at);
        payments
    }

    /// Committed wallet hold.
    #[must_use]
    pub fn wallet_reservation(&self, id: WalletReservationId) -> Option<WalletReservation> {
        self.tables().wallet_reservations.get(&id).cloned()
    }

    /// Committed wallet ledger of a customer.
    #[must_use]
    pub fn wallet_entries(&self, user_id: UserId) -> Vec<WalletLedgerEntry> {
        self.tables()
            .wallet_entries
            .iter()
            .filter(|e| e.user_id == user_id)
            .cloned()
            .collect()
    }

    /// Committed outbox rows in insertion order.
    #[must_use]
    pub fn outbox_messages(&self) -> Vec<OutboxMessage> {
        self.tables()
            .outbox
            .iter()
            .map(|(_, message)| message.clone())
            .collect()
    }

    /// Types of the committed outbox rows in insertion order.
    #[must_use]
    pub fn outbox_types(&self) -> Vec<String> {
        self.tables()
            .outbox
            .iter()
            .map(|(_, message)| message.message_type.clone())
            .collect()
    }
}

impl std::fmt::Debug for InMemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tables = self.tables();
        f.debug_struct("InMemoryStore")
            .field("variants", &tables.variants.len())
            .field("orders", &tables.orders.len())
            .field("outbox", &tables.outbox.len())
            .finish_non_exhaustive()
    }
}

impl InMemoryStore {
    fn transaction(&self) -> InMemoryTransaction {
        InMemoryTransaction {
            shared: Arc::clone(&self.shared),
            pending: Pending::default(),
            guards: HashMap::new(),
        }
    }
}

impl UnitOfWork for InMemoryStore {
    fn begin(&self) -> StoreFuture<'_, Box<dyn Transaction>> {
        let tx = self.transaction();
        Box::pin(async move { Ok(Box::new(tx) as Box<dyn Transaction>) })
    }
}

/// Transaction handed out by [`InMemoryStore`].
pub struct InMemoryTransaction {
    shared: Arc<Shared>,
    pending: Pending,
    guards: HashMap<String, OwnedMutexGuard<()>>,
}

impl InMemoryTransaction {
    async fn acquire(&mut self, key: String) {
        if self.guards.contains_key(&key) {
            return;
        }
        let handle = self.shared.row_locks.handle(&key);
        let guard = handle.lock_owned().await;
        self.guards.insert(key, guard);
    }

    fn try_acquire(&mut self, key: String) -> bool {
        if self.guards.contains_key(&key) {
            return true;
        }
        let handle = self.shared.row_locks.handle(&key);
        match handle.try_lock_owned() {
            Ok(guard) => {
                self.guards.insert(key, guard);
                true
            }
            Err(_) => false,
        }
    }

    fn variant_view(&self, id: VariantId) -> Option<ProductVariant> {
        let tables = lock(&self.shared.tables);
        merged_get(&tables.variants, &self.pending.variants, &id)
    }

    fn inventory_view(&self) -> Vec<InventoryTransaction> {
        let tables = lock(&self.shared.tables);
        tables
            .inventory
            .iter()
            .chain(self.pending.inventory.iter())
            .cloned()
            .collect()
    }

    fn discount_view(&self, id: DiscountCodeId) -> Option<DiscountCode> {
        let tables = lock(&self.shared.tables);
        merged_get(&tables.discount_codes, &self.pending.discount_codes, &id)
    }

    fn discount_codes_view(&self) -> Vec<DiscountCode> {
        let tables = lock(&self.shared.tables);
        merged_values(&tables.discount_codes, &self.pending.discount_codes)
    }

    fn usages_view(&self) -> Vec<DiscountUsage> {
        let tables = lock(&self.shared.tables);
        merged_values(&tables.discount_usages, &self.pending.discount_usages)
    }

    fn order_view(&self, id: OrderId) -> Option<Order> {
        let tables = lock(&self.shared.tables);
        merged_get(&tables.orders, &self.pending.orders, &id)
    }

    fn orders_view(&self) -> Vec<Order> {
        let tables = lock(&self.shared.tables);
        merged_values(&tables.orders, &self.pending.orders)
    }

    fn payment_view(&self, authority: &str) -> Option<PaymentTransaction> {
        let tables = lock(&self.shared.tables);
        merged_get(&tables.payments, &self.pending.payments, &authority.to_string())
    }

    fn payments_view(&self) -> Vec<PaymentTransaction> {
        let tables = lock(&self.shared.tables);
        merged_values(&tables.payments, &self.pending.payments)
    }

    fn reservations_view(&self) -> Vec<WalletReservation> {
        let tables = lock(&self.shared.tables);
        merged_values(
            &tables.wallet_reservations,
            &self.pending.wallet_reservations,
        )
    }

    fn wallet_entries_view(&self, user_id: UserId) -> Vec<WalletLedgerEntry> {
        let tables = lock(&self.shared.tables);
        tables
            .wallet_entries
            .iter()
            .chain(self.pending.wallet_entries.iter())
            .filter(|e| e.user_id == user_id)
            .cloned()
            .collect()
    }

    /// Outbox rows with this transaction's updates applied, paired with their
    /// insertion sequence. Uncommitted inserts sort after committed rows.
    fn outbox_view(&self) -> Vec<(u64, OutboxMessage)> {
        let tables = lock(&self.shared.tables);
        let committed = tables.outbox.iter().map(|(seq, message)| {
            let message = self
                .pending
                .outbox_updates
                .get(&message.id)
                .unwrap_or(message);
            (*seq, message.clone())
        });
        let own = self
            .pending
            .outbox_new
            .iter()
            .zip(u64::MAX - self.pending.outbox_new.len() as u64..)
            .map(|(message, seq)| (seq, message.clone()));
        committed.chain(own).collect()
    }

    fn write_outbox(&mut self, message: OutboxMessage) {
        if let Some(own) = self
            .pending
            .outbox_new
            .iter_mut()
            .find(|m| m.id == message.id)
        {
            *own = message;
        } else {
            self.pending.outbox_updates.insert(message.id, message);
        }
    }

    /// Claimable outbox rows in dispatch order, without taking locks.
    fn claimable_outbox(&self, now: DateTime<Utc>, max_attempts: u32) -> Vec<OutboxMessageId> {
        let mut candidates: Vec<_> = self
            .outbox_view()
            .into_iter()
            .filter(|(_, message)| message.is_claimable(now, max_attempts))
            .collect();
        candidates.sort_by_key(|(seq, message)| (message.occurred_at, *seq));
        candidates.into_iter().map(|(_, message)| message.id).collect()
    }

    /// Locks and leases up to `limit` of `candidates`, skipping rows held by
    /// another transaction. Each row is re-read once locked, so a lease
    /// committed after `candidates` was taken is honoured.
    fn lease_outbox(
        &mut self,
        candidates: Vec<OutboxMessageId>,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
        limit: u32,
        max_attempts: u32,
    ) -> Vec<OutboxMessage> {
        let mut claimed = Vec::new();
        for id in candidates {
            if claimed.len() >= limit as usize {
                break;
            }
            if !self.try_acquire(format!("outbox:{id}")) {
                continue;
            }
            let current = self
                .outbox_view()
                .into_iter()
                .map(|(_, message)| message)
                .find(|message| message.id == id);
            let Some(mut message) = current else { continue };
            if !message.is_claimable(now, max_attempts) {
                continue;
            }
            message.locked_until = Some(lease_until);
            self.write_outbox(message.clone());
            claimed.push(message);
        }
        claimed
    }

    async fn locked_outbox_message(
        &mut self,
        id: OutboxMessageId,
    ) -> Result<OutboxMessage, StoreError> {
        self.acquire(format!("outbox:{id}")).await;
        self.outbox_view()
            .into_iter()
            .map(|(_, message)| message)
            .find(|message| message.id == id)
            .ok_or_else(|| StoreError::not_found("outbox_message", id))
    }
}

impl VariantRepository for InMemoryTransaction {
    fn get_variant(&mut self, id: VariantId) -> StoreFuture<'_, Option<ProductVariant>> {
        Box::pin(async move { Ok(self.variant_view(id)) })
    }

    fn get_variant_for_update(
        &mut self,
        id: VariantId,
    ) -> StoreFuture<'_, Option<ProductVariant>> {
        Box::pin(async move {
            self.acquire(format!("variant:{id}")).await;
            Ok(self.variant_view(id))
        })
    }

    fn insert_variant(&mut self, variant: ProductVariant) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            self.acquire(format!("variant:{}", variant.id)).await;
            if self.variant_view(variant.id).is_some() {
                return Err(StoreError::UniqueViolation {
                    constraint: "product_variants_pkey".to_string(),
                });
            }
            self.pending.variants.insert(variant.id, variant);
            Ok(())
        })
    }

    fn update_variant(
        &mut self,
        variant: ProductVariant,
        expected: RowVersion,
    ) -> StoreFuture<'_, RowVersion> {
        Box::pin(async move {
            self.acquire(format!("variant:{}", variant.id)).await;
            let current = self
                .variant_view(variant.id)
                .ok_or_else(|| StoreError::not_found("product_variant", variant.id))?;
            if current.row_version != expected {
                return Err(StoreError::ConcurrencyConflict {
                    entity: "product_variant",
                    id: variant.id.to_string(),
                    expected: expected.value(),
                    actual: current.row_version.value(),
                });
            }
            let next = expected.next();
            let mut row = variant;
            row.row_version = next;
            self.pending.variants.insert(row.id, row);
            Ok(next)
        })
    }
}

impl InventoryLedger for InMemoryTransaction {
    fn append_inventory_transaction(
        &mut self,
        entry: InventoryTransaction,
    ) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            self.pending.inventory.push(entry);
            Ok(())
        })
    }

    fn inventory_transactions_by_reference(
        &mut self,
        reference: ReferenceNumber,
    ) -> StoreFuture<'_, Vec<InventoryTransaction>> {
        Box::pin(async move {
            Ok(self
                .inventory_view()
                .into_iter()
                .filter(|row| row.reference_number == reference)
                .collect())
        })
    }

    fn ledger_totals(&mut self, variant_id: VariantId) -> StoreFuture<'_, StockLevels> {
        Box::pin(async move {
            let rows = self.inventory_view();
            Ok(StockLevels::from_ledger(
                rows.iter().filter(|row| row.variant_id == variant_id),
            ))
        })
    }
}

impl DiscountRepository for InMemoryTransaction {
    fn lock_discount_code(&mut self, code: String) -> StoreFuture<'_, Option<DiscountCode>> {
        Box::pin(async move {
            let Some(id) = self
                .discount_codes_view()
                .into_iter()
                .find(|c| c.code == code)
                .map(|c| c.id)
            else {
                return Ok(None);
            };
            self.acquire(format!("discount:{id}")).await;
            Ok(self.discount_view(id))
        })
    }

    fn lock_discount_code_by_id(
        &mut self,
        id: DiscountCodeId,
    ) -> StoreFuture<'_, Option<DiscountCode>> {
        Box::pin(async move {
            self.acquire(format!("discount:{id}")).await;
            Ok(self.discount_view(id))
        })
    }

    fn insert_discount_code(&mut self, code: DiscountCode) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            self.acquire(format!("discount-code:{}", code.code)).await;
            if self
                .discount_codes_view()
                .iter()
                .any(|c| c.id == code.id || c.code == code.code)
            {
                return Err(StoreError::UniqueViolation {
                    constraint: "discount_codes_code_key".to_string(),
                });
            }
            self.pending.discount_codes.insert(code.id, code);
            Ok(())
        })
    }

    fn update_discount_code(
        &mut self,
        code: DiscountCode,
        expected: RowVersion,
    ) -> StoreFuture<'_, RowVersion> {
        Box::pin(async move {
            self.acquire(format!("discount:{}", code.id)).await;
            let current = self
                .discount_view(code.id)
                .ok_or_else(|| StoreError::not_found("discount_code", code.id))?;
            if current.row_version != expected {
                return Err(StoreError::ConcurrencyConflict {
                    entity: "discount_code",
                    id: code.id.to_string(),
                    expected: expected.value(),
                    actual: current.row_version.value(),
                });
            }
            let next = expected.next();
            let mut row = code;
            row.row_version = next;
            self.pending.discount_codes.insert(row.id, row);
            Ok(next)
        })
    }

    fn insert_discount_usage(&mut self, usage: DiscountUsage) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            self.pending.discount_usages.insert(usage.id, usage);
            Ok(())
        })
    }

    fn update_discount_usage(&mut self, usage: DiscountUsage) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            if !self.usages_view().iter().any(|u| u.id == usage.id) {
                return Err(StoreError::not_found("discount_usage", usage.id));
            }
            self.pending.discount_usages.insert(usage.id, usage);
            Ok(())
        })
    }

    fn discount_usages_for_order(
        &mut self,
        order_id: OrderId,
    ) -> StoreFuture<'_, Vec<DiscountUsage>> {
        Box::pin(async move {
            let mut usages: Vec<_> = self
                .usages_view()
                .into_iter()
                .filter(|u| u.order_id == order_id)
                .collect();
            usages.sort_by_key(|u| u.created_at);
            Ok(usages)
        })
    }

    fn count_pending_usages(&mut self, id: DiscountCodeId) -> StoreFuture<'_, u32> {
        Box::pin(async move {
            let count = self
                .usages_view()
                .iter()
                .filter(|u| u.discount_code_id == id && u.status == DiscountUsageStatus::Pending)
                .count();
            Ok(u32::try_from(count).unwrap_or(u32::MAX))
        })
    }

    fn count_user_usages(&mut self, id: DiscountCodeId, user_id: UserId) -> StoreFuture<'_, u32> {
        Box::pin(async move {
            let count = self
                .usages_view()
                .iter()
                .filter(|u| {
                    u.discount_code_id == id
                        && u.user_id == user_id
                        && u.status != DiscountUsageStatus::Cancelled
                })
                .count();
            Ok(u32::try_from(count).unwrap_or(u32::MAX))
        })
    }
}

impl OrderRepository for InMemoryTransaction {
    fn find_order_by_idempotency_key(
        &mut self,
        key: IdempotencyKey,
    ) -> StoreFuture<'_, Option<Order>> {
        Box::pin(async move {
            Ok(self
                .orders_view()
                .into_iter()
                .find(|o| o.idempotency_key == key))
        })
    }

    fn get_order(&mut self, id: OrderId) -> StoreFuture<'_, Option<Order>> {
        Box::pin(async move { Ok(self.order_view(id)) })
    }

    fn get_order_for_update(&mut self, id: OrderId) -> StoreFuture<'_, Option<Order>> {
        Box::pin(async move {
            self.acquire(format!("order:{id}")).await;
            Ok(self.order_view(id))
        })
    }

    fn insert_order(&mut self, order: Order) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            self.acquire(format!("order-key:{}", order.idempotency_key))
                .await;
            if self
                .orders_view()
                .iter()
                .any(|o| o.idempotency_key == order.idempotency_key)
            {
                return Err(StoreError::UniqueViolation {
                    constraint: "orders_idempotency_key_key".to_string(),
                });
            }
            self.acquire(format!("order:{}", order.id)).await;
            self.pending.orders.insert(order.id, order);
            Ok(())
        })
    }

    fn update_order(&mut self, order: Order, expected: RowVersion) -> StoreFuture<'_, RowVersion> {
        Box::pin(async move {
            self.acquire(format!("order:{}", order.id)).await;
            let current = self
                .order_view(order.id)
                .ok_or_else(|| StoreError::not_found("order", order.id))?;
            if current.row_version != expected {
                return Err(StoreError::ConcurrencyConflict {
                    entity: "order",
                    id: order.id.to_string(),
                    expected: expected.value(),
                    actual: current.row_version.value(),
                });
            }
            let next = expected.next();
            let mut row = order;
            row.row_version = next;
            self.pending.orders.insert(row.id, row);
            Ok(next)
        })
    }
    fn stale_pending_orders(
        &mut self,
        cutoff: DateTime<Utc>,
        limit: u32,
    ) -> StoreFuture<'_, Vec<Order>> {
        Box::pin(async move {
            let mut stale: Vec<_> = self
                .orders_view()
                .into_iter()
                .filter(|o| o.status == OrderStatus::PendingPayment && o.audit.created_at < cutoff)
                .collect();
            stale.sort_by_key(|o| o.audit.created_at);
            stale.truncate(limit as usize);
            Ok(stale)
        })
    }
}

impl PaymentRepository for InMemoryTransaction {
    fn insert_payment(&mut self, payment: PaymentTransaction) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            self.acquire(format!("payment:{}", payment.authority)).await;
            if self.payment_view(&payment.authority).is_some() {
                return Err(StoreError::UniqueViolation {
                    constraint: "payment_transactions_authority_key".to_string(),
                });
            }
            self.pending
                .payments
                .insert(payment.authority.clone(), payment);
            Ok(())
        })
    }

    fn get_payment_by_authority(
        &mut self,
        authority: String,
    ) -> StoreFuture<'_, Option<PaymentTransaction>> {
        Box::pin(async move { Ok(self.payment_view(&authority)) })
    }

    fn lock_payment_by_authority(
        &mut self,
        authority: String,
    ) -> StoreFuture<'_, Option<PaymentTransaction>> {
        Box::pin(async move {
            self.acquire(format!("payment:{authority}")).await;
            Ok(self.payment_view(&authority))
        })
    }

    fn payments_for_order(
        &mut self,
        order_id: OrderId,
    ) -> StoreFuture<'_, Vec<PaymentTransaction>> {
        Box::pin(async move {
            let mut payments: Vec<_> = self
                .payments_view()
                .into_iter()
                .filter(|p| p.order_id == order_id)
                .collect();
            payments.sort_by_key(|p| p.created_at);
            Ok(payments)
        })
    }

    fn expired_pending_payments(
        &mut self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> StoreFuture<'_, Vec<PaymentTransaction>> {
        Box::pin(async move {
            let mut expired: Vec<_> = self
                .payments_view()
                .into_iter()
                .filter(|p| p.status == PaymentStatus::Pending && p.expires_at <= now)
                .collect();
            expired.sort_by_key(|p| p.expires_at);
            expired.truncate(limit as usize);
            Ok(expired)
        })
    }

    fn update_payment(&mut self, payment: PaymentTransaction) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            self.acquire(format!("payment:{}", payment.authority)).await;
            if self.payment_view(&payment.authority).is_none() {
                return Err(StoreError::not_found("payment_transaction", &payment.authority));
            }
            self.pending
                .payments
                .insert(payment.authority.clone(), payment);
            Ok(())
        })
    }
}

impl WalletRepository for InMemoryTransaction {
    fn lock_wallet(&mut self, user_id: UserId) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            self.acquire(format!("wallet:{user_id}")).await;
            Ok(())
        })
    }

    fn wallet_balance(&mut self, user_id: UserId) -> StoreFuture<'_, i64> {
        Box::pin(async move {
            Ok(self
                .wallet_entries_view(user_id)
                .iter()
                .map(|e| e.amount_delta)
                .sum())
        })
    }

    fn pending_reservations_total(&mut self, user_id: UserId) -> StoreFuture<'_, Money> {
        Box::pin(async move {
            Ok(self
                .reservations_view()
                .iter()
                .filter(|r| r.user_id == user_id && r.status == WalletReservationStatus::Pending)
                .map(|r| r.amount)
                .sum())
        })
    }

    fn insert_wallet_reservation(
        &mut self,
        reservation: WalletReservation,
    ) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            self.pending
                .wallet_reservations
                .insert(reservation.id, reservation);
            Ok(())
        })
    }

    fn get_wallet_reservation(
        &mut self,
        id: WalletReservationId,
    ) -> StoreFuture<'_, Option<WalletReservation>> {
        Box::pin(async move {
            let tables = lock(&self.shared.tables);
            Ok(merged_get(
                &tables.wallet_reservations,
                &self.pending.wallet_reservations,
                &id,
            ))
        })
    }

    fn update_wallet_reservation(
        &mut self,
        reservation: WalletReservation,
    ) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            if !self.reservations_view().iter().any(|r| r.id == reservation.id) {
                return Err(StoreError::not_found("wallet_reservation", reservation.id));
            }
            self.pending
                .wallet_reservations
                .insert(reservation.id, reservation);
            Ok(())
        })
    }

    fn append_wallet_entry(&mut self, entry: WalletLedgerEntry) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            self.pending.wallet_entries.push(entry);
            Ok(())
        })
    }
}

impl OutboxRepository for InMemoryTransaction {
    fn append_outbox_message(&mut self, message: OutboxMessage) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            self.pending.outbox_new.push(message);
            Ok(())
        })
    }

    fn claim_outbox_batch(
        &mut self,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
        limit: u32,
        max_attempts: u32,
    ) -> StoreFuture<'_, Vec<OutboxMessage>> {
        Box::pin(async move {
            let candidates = self.claimable_outbox(now, max_attempts);
            Ok(self.lease_outbox(candidates, now, lease_until, limit, max_attempts))
        })
    }

    fn mark_outbox_processed(
        &mut self,
        id: OutboxMessageId,
        processed_at: DateTime<Utc>,
    ) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let mut message = self.locked_outbox_message(id).await?;
            message.processed_at = Some(processed_at);
            message.locked_until = None;
            self.write_outbox(message);
            Ok(())
        })
    }

    fn mark_outbox_failed(&mut self, id: OutboxMessageId, error: String) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let mut message = self.locked_outbox_message(id).await?;
            message.attempts = message.attempts.saturating_add(1);
            message.error = Some(error);
            message.locked_until = None;
            self.write_outbox(message);
            Ok(())
        })
    }

    fn requeue_outbox_message(&mut self, id: OutboxMessageId) -> StoreFuture<'_, bool> {
        Box::pin(async move {
            let mut message = self.locked_outbox_message(id).await?;
            if message.processed_at.is_some() {
                return Ok(false);
            }
            message.attempts = 0;
            message.error = None;
            message.locked_until = None;
            self.write_outbox(message);
            Ok(true)
        })
    }

    fn get_outbox_message(
        &mut self,
        id: OutboxMessageId,
    ) -> StoreFuture<'_, Option<OutboxMessage>> {
        Box::pin(async move {
            Ok(self
                .outbox_view()
                .into_iter()
                .map(|(_, message)| message)
                .find(|message| message.id == id))
        })
    }
}

impl Transaction for InMemoryTransaction {
    fn commit(self: Box<Self>) -> StoreFuture<'static, ()> {
        Box::pin(async move {
            let Self {
                shared,
                pending,
                guards,
            } = *self;
            if shared.fail_next_commit.swap(false, Ordering::SeqCst) {
                shared.rollbacks.fetch_add(1, Ordering::SeqCst);
                drop(guards);
                return Err(StoreError::Database("commit failed".to_string()));
            }
            lock(&shared.tables).apply(pending, &shared.outbox_seq);
            shared.commits.fetch_add(1, Ordering::SeqCst);
            drop(guards);
            Ok(())
        })
    }

    fn rollback(self: Box<Self>) -> StoreFuture<'static, ()> {
        Box::pin(async move {
            self.shared.rollbacks.fetch_add(1, Ordering::SeqCst);
            drop(self);
            Ok(())
        })
    }
}
