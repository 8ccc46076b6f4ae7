//! [`Transaction`] over a `sqlx` PostgreSQL transaction.
//!
//! Locking maps onto PostgreSQL directly: `*_for_update` and `lock_*` reads use
//! `SELECT … FOR UPDATE`, version-checked writes use
//! `UPDATE … WHERE row_version = $n` (a concurrent writer of the same row
//! blocks the update until it finishes), wallets are serialized with
//! `pg_advisory_xact_lock`, and outbox claims use `FOR UPDATE SKIP LOCKED`.

use crate::rows::{
    self, DISCOUNT_COLUMNS, INVENTORY_COLUMNS, ORDER_COLUMNS, OUTBOX_COLUMNS, PAYMENT_COLUMNS,
    RESERVATION_COLUMNS, USAGE_COLUMNS, VARIANT_COLUMNS, db_error,
};
use checkout_core::error::StoreError;
use checkout_core::model::{
    DiscountCode, DiscountUsage, DiscountUsageStatus, InventoryTransaction, Order, OrderStatus,
    OutboxMessage, PaymentStatus, PaymentTransaction, ProductVariant, StockLevels,
    WalletLedgerEntry, WalletReservation, WalletReservationStatus,
};
use checkout_core::store::{
    DiscountRepository, InventoryLedger, OrderRepository, OutboxRepository, PaymentRepository,
    StoreFuture, StoreResult, Transaction, VariantRepository, WalletRepository,
};
use checkout_core::types::{
    DiscountCodeId, IdempotencyKey, Money, OrderId, OutboxMessageId, ReferenceNumber, RowVersion,
    UserId, VariantId, WalletReservationId,
};
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, Postgres, Row};
use std::collections::HashMap;
use uuid::Uuid;

/// An open PostgreSQL transaction.
///
/// Dropping it without committing rolls it back.
pub struct PgTransaction {
    tx: sqlx::Transaction<'static, Postgres>,
}

impl PgTransaction {
    pub(crate) const fn new(tx: sqlx::Transaction<'static, Postgres>) -> Self {
        Self { tx }
    }

    fn conn(&mut self) -> &mut PgConnection {
        &mut self.tx
    }

    /// Reports why a version-checked update touched no row.
    async fn version_mismatch(
        &mut self,
        table: &str,
        entity: &'static str,
        id: Uuid,
        expected: RowVersion,
    ) -> StoreError {
        let query = format!("SELECT row_version FROM {table} WHERE id = $1");
        match sqlx::query_scalar::<_, i64>(&query)
            .bind(id)
            .fetch_optional(self.conn())
            .await
        {
            Ok(Some(actual)) => {
                tracing::debug!(entity, %id, expected = expected.value(), actual, "Row version mismatch");
                StoreError::ConcurrencyConflict {
                    entity,
                    id: id.to_string(),
                    expected: expected.value(),
                    actual: u64::try_from(actual).unwrap_or_default(),
                }
            }
            Ok(None) => StoreError::not_found(entity, id),
            Err(error) => db_error(error),
        }
    }

    async fn attach_items(&mut self, mut orders: Vec<Order>) -> StoreResult<Vec<Order>> {
        if orders.is_empty() {
            return Ok(orders);
        }
        let ids: Vec<Uuid> = orders.iter().map(|o| *o.id.as_uuid()).collect();
        let rows = sqlx::query(
            r"
            SELECT id, order_id, variant_id, quantity, unit_price, line_total
            FROM order_items
            WHERE order_id = ANY($1)
            ORDER BY order_id, position
            ",
        )
        .bind(&ids)
        .fetch_all(self.conn())
        .await
        .map_err(db_error)?;

        let mut items: HashMap<OrderId, Vec<_>> = HashMap::new();
        for row in &rows {
            let (order_id, item) = rows::order_item(row)?;
            items.entry(order_id).or_default().push(item);
        }
        for order in &mut orders {
            order.items = items.remove(&order.id).unwrap_or_default();
        }
        Ok(orders)
    }

    async fn fetch_order(&mut self, id: OrderId, for_update: bool) -> StoreResult<Option<Order>> {
        let lock = if for_update { " FOR UPDATE" } else { "" };
        let query = format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1{lock}");
        let row = sqlx::query(&query)
            .bind(id.as_uuid())
            .fetch_optional(self.conn())
            .await
            .map_err(db_error)?;
        match row {
            Some(row) => {
                let order = rows::order(&row)?;
                Ok(self.attach_items(vec![order]).await?.pop())
            }
            None => Ok(None),
        }
    }

    async fn fetch_variant(
        &mut self,
        id: VariantId,
        for_update: bool,
    ) -> StoreResult<Option<ProductVariant>> {
        let lock = if for_update { " FOR UPDATE" } else { "" };
        let query = format!("SELECT {VARIANT_COLUMNS} FROM product_variants WHERE id = $1{lock}");
        sqlx::query(&query)
            .bind(id.as_uuid())
            .fetch_optional(self.conn())
            .await
            .map_err(db_error)?
            .as_ref()
            .map(rows::variant)
            .transpose()
    }

    async fn fetch_payment(
        &mut self,
        authority: &str,
        for_update: bool,
    ) -> StoreResult<Option<PaymentTransaction>> {
        let lock = if for_update { " FOR UPDATE" } else { "" };
        let query =
            format!("SELECT {PAYMENT_COLUMNS} FROM payment_transactions WHERE authority = $1{lock}");
        sqlx::query(&query)
            .bind(authority)
            .fetch_optional(self.conn())
            .await
            .map_err(db_error)?
            .as_ref()
            .map(rows::payment)
            .transpose()
    }

    async fn fetch_discount(&mut self, column: &str, value: QueryKey) -> StoreResult<Option<DiscountCode>> {
        let query =
            format!("SELECT {DISCOUNT_COLUMNS} FROM discount_codes WHERE {column} = $1 FOR UPDATE");
        let query = sqlx::query(&query);
        let query = match value {
            QueryKey::Id(id) => query.bind(id),
            QueryKey::Text(text) => query.bind(text),
        };
        query
            .fetch_optional(self.conn())
            .await
            .map_err(db_error)?
            .as_ref()
            .map(rows::discount_code)
            .transpose()
    }

    async fn outbox_row(&mut self, id: OutboxMessageId) -> StoreResult<Option<OutboxMessage>> {
        let query = format!("SELECT {OUTBOX_COLUMNS} FROM outbox_messages WHERE id = $1");
        sqlx::query(&query)
            .bind(id.as_uuid())
            .fetch_optional(self.conn())
            .await
            .map_err(db_error)?
            .as_ref()
            .map(rows::outbox_message)
            .transpose()
    }
}

enum QueryKey {
    Id(Uuid),
    Text(String),
}

fn map_all<T>(rows: &[PgRow], map: fn(&PgRow) -> StoreResult<T>) -> StoreResult<Vec<T>> {
    rows.iter().map(map).collect()
}

fn limit(value: u32) -> i64 {
    i64::from(value)
}

impl VariantRepository for PgTransaction {
    fn get_variant(&mut self, id: VariantId) -> StoreFuture<'_, Option<ProductVariant>> {
        Box::pin(self.fetch_variant(id, false))
    }

    fn get_variant_for_update(
        &mut self,
        id: VariantId,
    ) -> StoreFuture<'_, Option<ProductVariant>> {
        Box::pin(self.fetch_variant(id, true))
    }

    fn insert_variant(&mut self, variant: ProductVariant) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            sqlx::query(
                r"
                INSERT INTO product_variants (
                    id, product_id, category_id, sku, on_hand, reserved, row_version,
                    created_at, updated_at, is_deleted, deleted_at
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                ",
            )
            .bind(variant.id.as_uuid())
            .bind(variant.product_id.as_uuid())
            .bind(variant.category_id.map(|c| *c.as_uuid()))
            .bind(&variant.sku)
            .bind(variant.on_hand)
            .bind(variant.reserved)
            .bind(rows::version_value(variant.row_version)?)
            .bind(variant.audit.created_at)
            .bind(variant.audit.updated_at)
            .bind(variant.deletion.is_deleted)
            .bind(variant.deletion.deleted_at)
            .execute(self.conn())
            .await
            .map_err(db_error)?;
            Ok(())
        })
    }

    fn update_variant(
        &mut self,
        variant: ProductVariant,
        expected: RowVersion,
    ) -> StoreFuture<'_, RowVersion> {
        Box::pin(async move {
            let next = expected.next();
            let updated = sqlx::query(
                r"
                UPDATE product_variants
                SET on_hand = $2, reserved = $3, row_version = $4, updated_at = $5,
                    is_deleted = $6, deleted_at = $7
                WHERE id = $1 AND row_version = $8
                ",
            )
            .bind(variant.id.as_uuid())
            .bind(variant.on_hand)
            .bind(variant.reserved)
            .bind(rows::version_value(next)?)
            .bind(variant.audit.updated_at)
            .bind(variant.deletion.is_deleted)
            .bind(variant.deletion.deleted_at)
            .bind(rows::version_value(expected)?)
            .execute(self.conn())
            .await
            .map_err(db_error)?;

            if updated.rows_affected() == 0 {
                return Err(self
                    .version_mismatch("product_variants", "product_variant", *variant.id.as_uuid(), expected)
                    .await);
            }
            Ok(next)
        })
    }
}

impl InventoryLedger for PgTransaction {
    fn append_inventory_transaction(
        &mut self,
        entry: InventoryTransaction,
    ) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            sqlx::query(
                r"
                INSERT INTO inventory_transactions (
                    id, variant_id, kind, quantity_change, reference_number,
                    order_item_id, user_id, notes, occurred_at
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                ",
            )
            .bind(entry.id.as_uuid())
            .bind(entry.variant_id.as_uuid())
            .bind(entry.kind.as_str())
            .bind(entry.quantity_change)
            .bind(entry.reference_number.as_str())
            .bind(entry.order_item_id.map(|id| *id.as_uuid()))
            .bind(entry.user_id.map(|id| *id.as_uuid()))
            .bind(&entry.notes)
            .bind(entry.occurred_at)
            .execute(self.conn())
            .await
            .map_err(db_error)?;
            Ok(())
        })
    }

    fn inventory_transactions_by_reference(
        &mut self,
        reference: ReferenceNumber,
    ) -> StoreFuture<'_, Vec<InventoryTransaction>> {
        Box::pin(async move {
            let query = format!(
                "SELECT {INVENTORY_COLUMNS} FROM inventory_transactions \
                 WHERE reference_number = $1 ORDER BY seq"
            );
            let rows = sqlx::query(&query)
                .bind(reference.as_str())
                .fetch_all(self.conn())
                .await
                .map_err(db_error)?;
            map_all(&rows, rows::inventory_transaction)
        })
    }

    fn ledger_totals(&mut self, variant_id: VariantId) -> StoreFuture<'_, StockLevels> {
        Box::pin(async move {
            let row = sqlx::query(
                r"
                SELECT
                    COALESCE(SUM(quantity_change) FILTER (
                        WHERE kind IN ('commit', 'admin_adjust')), 0)::BIGINT AS on_hand,
                    COALESCE(SUM(quantity_change) FILTER (
                        WHERE kind IN ('reserve', 'commit', 'release')), 0)::BIGINT AS reserved
                FROM inventory_transactions
                WHERE variant_id = $1
                ",
            )
            .bind(variant_id.as_uuid())
            .fetch_one(self.conn())
            .await
            .map_err(db_error)?;
            Ok(StockLevels {
                on_hand: row.try_get("on_hand").map_err(db_error)?,
                reserved: row.try_get("reserved").map_err(db_error)?,
            })
        })
    }
}

impl DiscountRepository for PgTransaction {
    fn lock_discount_code(&mut self, code: String) -> StoreFuture<'_, Option<DiscountCode>> {
        Box::pin(self.fetch_discount("code", QueryKey::Text(code)))
    }

    fn lock_discount_code_by_id(
        &mut self,
        id: DiscountCodeId,
    ) -> StoreFuture<'_, Option<DiscountCode>> {
        Box::pin(self.fetch_discount("id", QueryKey::Id(*id.as_uuid())))
    }

    fn insert_discount_code(&mut self, code: DiscountCode) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            sqlx::query(
                r"
                INSERT INTO discount_codes (
                    id, code, usage_count, max_usage, per_user_limit, kind, restrictions,
                    starts_at, expires_at, is_active, row_version, created_at, updated_at,
                    is_deleted, deleted_at
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
                ",
            )
            .bind(code.id.as_uuid())
            .bind(&code.code)
            .bind(rows::int(code.usage_count)?)
            .bind(rows::int(code.max_usage)?)
            .bind(code.per_user_limit.map(rows::int).transpose()?)
            .bind(serde_json::to_value(code.kind)?)
            .bind(serde_json::to_value(&code.restrictions)?)
            .bind(code.starts_at)
            .bind(code.expires_at)
            .bind(code.is_active)
            .bind(rows::version_value(code.row_version)?)
            .bind(code.audit.created_at)
            .bind(code.audit.updated_at)
            .bind(code.deletion.is_deleted)
            .bind(code.deletion.deleted_at)
            .execute(self.conn())
            .await
            .map_err(db_error)?;
            Ok(())
        })
    }

    fn update_discount_code(
        &mut self,
        code: DiscountCode,
        expected: RowVersion,
    ) -> StoreFuture<'_, RowVersion> {
        Box::pin(async move {
            let next = expected.next();
            let updated = sqlx::query(
                r"
                UPDATE discount_codes
                SET usage_count = $2, max_usage = $3, per_user_limit = $4, kind = $5,
                    restrictions = $6, starts_at = $7, expires_at = $8, is_active = $9,
                    row_version = $10, updated_at = $11, is_deleted = $12, deleted_at = $13
                WHERE id = $1 AND row_version = $14
                ",
            )
            .bind(code.id.as_uuid())
            .bind(rows::int(code.usage_count)?)
            .bind(rows::int(code.max_usage)?)
            .bind(code.per_user_limit.map(rows::int).transpose()?)
            .bind(serde_json::to_value(code.kind)?)
            .bind(serde_json::to_value(&code.restrictions)?)
            .bind(code.starts_at)
            .bind(code.expires_at)
            .bind(code.is_active)
            .bind(rows::version_value(next)?)
            .bind(code.audit.updated_at)
            .bind(code.deletion.is_deleted)
            .bind(code.deletion.deleted_at)
            .bind(rows::version_value(expected)?)
            .execute(self.conn())
            .await
            .map_err(db_error)?;

            if updated.rows_affected() == 0 {
                return Err(self
                    .version_mismatch("discount_codes", "discount_code", *code.id.as_uuid(), expected)
                    .await);
            }
            Ok(next)
        })
    }

    fn insert_discount_usage(&mut self, usage: DiscountUsage) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            sqlx::query(
                r"
                INSERT INTO discount_usages (
                    id, discount_code_id, order_id, user_id, discount_amount, status,
                    created_at, updated_at
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ",
            )
            .bind(usage.id.as_uuid())
            .bind(usage.discount_code_id.as_uuid())
            .bind(usage.order_id.as_uuid())
            .bind(usage.user_id.as_uuid())
            .bind(rows::minor(usage.discount_amount)?)
            .bind(usage.status.as_str())
            .bind(usage.created_at)
            .bind(usage.updated_at)
            .execute(self.conn())
            .await
            .map_err(db_error)?;
            Ok(())
        })
    }

    fn update_discount_usage(&mut self, usage: DiscountUsage) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let updated = sqlx::query(
                r"
                UPDATE discount_usages
                SET discount_amount = $2, status = $3, updated_at = $4
                WHERE id = $1
                ",
            )
            .bind(usage.id.as_uuid())
            .bind(rows::minor(usage.discount_amount)?)
            .bind(usage.status.as_str())
            .bind(usage.updated_at)
            .execute(self.conn())
            .await
            .map_err(db_error)?;
            if updated.rows_affected() == 0 {
                return Err(StoreError::not_found("discount_usage", usage.id));
            }
            Ok(())
        })
    }

    fn discount_usages_for_order(
        &mut self,
        order_id: OrderId,
    ) -> StoreFuture<'_, Vec<DiscountUsage>> {
        Box::pin(async move {
            let query = format!(
                "SELECT {USAGE_COLUMNS} FROM discount_usages \
                 WHERE order_id = $1 ORDER BY created_at, id"
            );
            let rows = sqlx::query(&query)
                .bind(order_id.as_uuid())
                .fetch_all(self.conn())
                .await
                .map_err(db_error)?;
            map_all(&rows, rows::discount_usage)
        })
    }

    fn count_pending_usages(&mut self, id: DiscountCodeId) -> StoreFuture<'_, u32> {
        Box::pin(async move {
            let row = sqlx::query(
                "SELECT COUNT(*) AS pending FROM discount_usages \
                 WHERE discount_code_id = $1 AND status = $2",
            )
            .bind(id.as_uuid())
            .bind(DiscountUsageStatus::Pending.as_str())
            .fetch_one(self.conn())
            .await
            .map_err(db_error)?;
            rows::count(&row, "pending")
        })
    }

    fn count_user_usages(&mut self, id: DiscountCodeId, user_id: UserId) -> StoreFuture<'_, u32> {
        Box::pin(async move {
            let row = sqlx::query(
                "SELECT COUNT(*) AS used FROM discount_usages \
                 WHERE discount_code_id = $1 AND user_id = $2 AND status <> $3",
            )
            .bind(id.as_uuid())
            .bind(user_id.as_uuid())
            .bind(DiscountUsageStatus::Cancelled.as_str())
            .fetch_one(self.conn())
            .await
            .map_err(db_error)?;
            rows::count(&row, "used")
        })
    }
}

impl OrderRepository for PgTransaction {
    fn find_order_by_idempotency_key(
        &mut self,
        key: IdempotencyKey,
    ) -> StoreFuture<'_, Option<Order>> {
        Box::pin(async move {
            let query = format!("SELECT {ORDER_COLUMNS} FROM orders WHERE idempotency_key = $1");
            let row = sqlx::query(&query)
                .bind(key.as_str())
                .fetch_optional(self.conn())
                .await
                .map_err(db_error)?;
            match row {
                Some(row) => {
                    let order = rows::order(&row)?;
                    Ok(self.attach_items(vec![order]).await?.pop())
                }
                None => Ok(None),
            }
        })
    }

    fn get_order(&mut self, id: OrderId) -> StoreFuture<'_, Option<Order>> {
        Box::pin(self.fetch_order(id, false))
    }

    fn get_order_for_update(&mut self, id: OrderId) -> StoreFuture<'_, Option<Order>> {
        Box::pin(self.fetch_order(id, true))
    }

    fn insert_order(&mut self, order: Order) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            sqlx::query(
                r"
                INSERT INTO orders (
                    id, idempotency_key, user_id, status, subtotal, discount_total, total,
                    wallet_amount, gateway_amount, reservation_reference, discount_code_id,
                    wallet_reservation_id, row_version, created_at, updated_at, is_deleted,
                    deleted_at
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
                ",
            )
            .bind(order.id.as_uuid())
            .bind(order.idempotency_key.as_str())
            .bind(order.user_id.as_uuid())
            .bind(order.status.as_str())
            .bind(rows::minor(order.subtotal)?)
            .bind(rows::minor(order.discount_total)?)
            .bind(rows::minor(order.total)?)
            .bind(rows::minor(order.wallet_amount)?)
            .bind(rows::minor(order.gateway_amount)?)
            .bind(order.reservation_reference.as_str())
            .bind(order.discount_code_id.map(|id| *id.as_uuid()))
            .bind(order.wallet_reservation_id.map(|id| *id.as_uuid()))
            .bind(rows::version_value(order.row_version)?)
            .bind(order.audit.created_at)
            .bind(order.audit.updated_at)
            .bind(order.deletion.is_deleted)
            .bind(order.deletion.deleted_at)
            .execute(self.conn())
            .await
            .map_err(db_error)?;

            for (position, item) in order.items.iter().enumerate() {
                let position = i32::try_from(position)
                    .map_err(|_| StoreError::Serialization("too many order lines".to_string()))?;
                sqlx::query(
                    r"
                    INSERT INTO order_items (
                        id, order_id, position, variant_id, quantity, unit_price, line_total
                    ) VALUES ($1, $2, $3, $4, $5, $6, $7)
                    ",
                )
                .bind(item.id.as_uuid())
                .bind(order.id.as_uuid())
                .bind(position)
                .bind(item.variant_id.as_uuid())
                .bind(rows::int(item.quantity)?)
                .bind(rows::minor(item.unit_price)?)
                .bind(rows::minor(item.line_total)?)
                .execute(self.conn())
                .await
                .map_err(db_error)?;
            }
            Ok(())
        })
    }

    fn update_order(&mut self, order: Order, expected: RowVersion) -> StoreFuture<'_, RowVersion> {
        Box::pin(async move {
            let next = expected.next();
            let updated = sqlx::query(
                r"
                UPDATE orders
                SET status = $2, discount_total = $3, total = $4, wallet_amount = $5,
                    gateway_amount = $6, discount_code_id = $7, wallet_reservation_id = $8,
                    row_version = $9, updated_at = $10, is_deleted = $11, deleted_at = $12
                WHERE id = $1 AND row_version = $13
                ",
            )
            .bind(order.id.as_uuid())
            .bind(order.status.as_str())
            .bind(rows::minor(order.discount_total)?)
            .bind(rows::minor(order.total)?)
            .bind(rows::minor(order.wallet_amount)?)
            .bind(rows::minor(order.gateway_amount)?)
            .bind(order.discount_code_id.map(|id| *id.as_uuid()))
            .bind(order.wallet_reservation_id.map(|id| *id.as_uuid()))
            .bind(rows::version_value(next)?)
            .bind(order.audit.updated_at)
            .bind(order.deletion.is_deleted)
            .bind(order.deletion.deleted_at)
            .bind(rows::version_value(expected)?)
            .execute(self.conn())
            .await
            .map_err(db_error)?;

            if updated.rows_affected() == 0 {
                return Err(self
                    .version_mismatch("orders", "order", *order.id.as_uuid(), expected)
                    .await);
            }
            Ok(next)
        })
    }

    fn stale_pending_orders(
        &mut self,
        cutoff: DateTime<Utc>,
        limit_to: u32,
    ) -> StoreFuture<'_, Vec<Order>> {
        Box::pin(async move {
            let query = format!(
                "SELECT {ORDER_COLUMNS} FROM orders \
                 WHERE status = $1 AND created_at < $2 AND NOT is_deleted \
                 ORDER BY created_at, id LIMIT $3"
            );
            let rows = sqlx::query(&query)
                .bind(OrderStatus::PendingPayment.as_str())
                .bind(cutoff)
                .bind(limit(limit_to))
                .fetch_all(self.conn())
                .await
                .map_err(db_error)?;
            let orders = map_all(&rows, rows::order)?;
            self.attach_items(orders).await
        })
    }
}

impl PaymentRepository for PgTransaction {
    fn insert_payment(&mut self, payment: PaymentTransaction) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            sqlx::query(
                r"
                INSERT INTO payment_transactions (
                    id, authority, order_id, gateway_name, status, amount, expires_at,
                    ref_id, failure_reason, verified_at, created_at, updated_at
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
                ",
            )
            .bind(payment.id.as_uuid())
            .bind(&payment.authority)
            .bind(payment.order_id.as_uuid())
            .bind(&payment.gateway_name)
            .bind(payment.status.as_str())
            .bind(rows::minor(payment.amount)?)
            .bind(payment.expires_at)
            .bind(&payment.ref_id)
            .bind(&payment.failure_reason)
            .bind(payment.verified_at)
            .bind(payment.created_at)
            .bind(payment.updated_at)
            .execute(self.conn())
            .await
            .map_err(db_error)?;
            Ok(())
        })
    }

    fn get_payment_by_authority(
        &mut self,
        authority: String,
    ) -> StoreFuture<'_, Option<PaymentTransaction>> {
        Box::pin(async move { self.fetch_payment(&authority, false).await })
    }

    fn lock_payment_by_authority(
        &mut self,
        authority: String,
    ) -> StoreFuture<'_, Option<PaymentTransaction>> {
        Box::pin(async move { self.fetch_payment(&authority, true).await })
    }

    fn payments_for_order(
        &mut self,
        order_id: OrderId,
    ) -> StoreFuture<'_, Vec<PaymentTransaction>> {
        Box::pin(async move {
            let query = format!(
                "SELECT {PAYMENT_COLUMNS} FROM payment_transactions \
                 WHERE order_id = $1 ORDER BY created_at, id"
            );
            let rows = sqlx::query(&query)
                .bind(order_id.as_uuid())
                .fetch_all(self.conn())
                .await
                .map_err(db_error)?;
            map_all(&rows, rows::payment)
        })
    }

    fn expired_pending_payments(
        &mut self,
        now: DateTime<Utc>,
        limit_to: u32,
    ) -> StoreFuture<'_, Vec<PaymentTransaction>> {
        Box::pin(async move {
            let query = format!(
                "SELECT {PAYMENT_COLUMNS} FROM payment_transactions \
                 WHERE status = $1 AND expires_at <= $2 \
                 ORDER BY expires_at, id LIMIT $3"
            );
            let rows = sqlx::query(&query)
                .bind(PaymentStatus::Pending.as_str())
                .bind(now)
                .bind(limit(limit_to))
                .fetch_all(self.conn())
                .await
                .map_err(db_error)?;
            map_all(&rows, rows::payment)
        })
    }

    fn update_payment(&mut self, payment: PaymentTransaction) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let updated = sqlx::query(
                r"
                UPDATE payment_transactions
                SET status = $2, ref_id = $3, failure_reason = $4, verified_at = $5,
                    expires_at = $6, updated_at = $7
                WHERE authority = $1
                ",
            )
            .bind(&payment.authority)
            .bind(payment.status.as_str())
            .bind(&payment.ref_id)
            .bind(&payment.failure_reason)
            .bind(payment.verified_at)
            .bind(payment.expires_at)
            .bind(payment.updated_at)
            .execute(self.conn())
            .await
            .map_err(db_error)?;
            if updated.rows_affected() == 0 {
                return Err(StoreError::not_found("payment_transaction", &payment.authority));
            }
            Ok(())
        })
    }
}

impl WalletRepository for PgTransaction {
    fn lock_wallet(&mut self, user_id: UserId) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            sqlx::query("SELECT pg_advisory_xact_lock($1)")
                .bind(rows::wallet_lock_key(user_id))
                .execute(self.conn())
                .await
                .map_err(db_error)?;
            Ok(())
        })
    }

    fn wallet_balance(&mut self, user_id: UserId) -> StoreFuture<'_, i64> {
        Box::pin(async move {
            sqlx::query_scalar::<_, i64>(
                "SELECT COALESCE(SUM(amount_delta), 0)::BIGINT FROM wallet_ledger WHERE user_id = $1",
            )
            .bind(user_id.as_uuid())
            .fetch_one(self.conn())
            .await
            .map_err(db_error)
        })
    }

    fn pending_reservations_total(&mut self, user_id: UserId) -> StoreFuture<'_, Money> {
        Box::pin(async move {
            let row = sqlx::query(
                "SELECT COALESCE(SUM(amount), 0)::BIGINT AS held FROM wallet_reservations \
                 WHERE user_id = $1 AND status = $2",
            )
            .bind(user_id.as_uuid())
            .bind(WalletReservationStatus::Pending.as_str())
            .fetch_one(self.conn())
            .await
            .map_err(db_error)?;
            rows::money(&row, "held")
        })
    }

    fn insert_wallet_reservation(
        &mut self,
        reservation: WalletReservation,
    ) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            sqlx::query(
                r"
                INSERT INTO wallet_reservations (
                    id, user_id, order_id, amount, status, created_at, updated_at
                ) VALUES ($1, $2, $3, $4, $5, $6, $7)
                ",
            )
            .bind(reservation.id.as_uuid())
            .bind(reservation.user_id.as_uuid())
            .bind(reservation.order_id.as_uuid())
            .bind(rows::minor(reservation.amount)?)
            .bind(reservation.status.as_str())
            .bind(reservation.created_at)
            .bind(reservation.updated_at)
            .execute(self.conn())
            .await
            .map_err(db_error)?;
            Ok(())
        })
    }

    fn get_wallet_reservation(
        &mut self,
        id: WalletReservationId,
    ) -> StoreFuture<'_, Option<WalletReservation>> {
        Box::pin(async move {
            let query =
                format!("SELECT {RESERVATION_COLUMNS} FROM wallet_reservations WHERE id = $1");
            sqlx::query(&query)
                .bind(id.as_uuid())
                .fetch_optional(self.conn())
                .await
                .map_err(db_error)?
                .as_ref()
                .map(rows::wallet_reservation)
                .transpose()
        })
    }

    fn update_wallet_reservation(
        &mut self,
        reservation: WalletReservation,
    ) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let updated = sqlx::query(
                "UPDATE wallet_reservations SET status = $2, updated_at = $3 WHERE id = $1",
            )
            .bind(reservation.id.as_uuid())
            .bind(reservation.status.as_str())
            .bind(reservation.updated_at)
            .execute(self.conn())
            .await
            .map_err(db_error)?;
            if updated.rows_affected() == 0 {
                return Err(StoreError::not_found("wallet_reservation", reservation.id));
            }
            Ok(())
        })
    }

    fn append_wallet_entry(&mut self, entry: WalletLedgerEntry) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            sqlx::query(
                r"
                INSERT INTO wallet_ledger (
                    id, user_id, amount_delta, balance_after, reference_type, reference_id,
                    occurred_at
                ) VALUES ($1, $2, $3, $4, $5, $6, $7)
                ",
            )
            .bind(entry.id.as_uuid())
            .bind(entry.user_id.as_uuid())
            .bind(entry.amount_delta)
            .bind(entry.balance_after)
            .bind(entry.reference_type.as_str())
            .bind(&entry.reference_id)
            .bind(entry.occurred_at)
            .execute(self.conn())
            .await
            .map_err(db_error)?;
            Ok(())
        })
    }
}

impl OutboxRepository for PgTransaction {
    fn append_outbox_message(&mut self, message: OutboxMessage) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            sqlx::query(
                r"
                INSERT INTO outbox_messages (
                    id, message_type, payload, occurred_at, processed_at, error, attempts,
                    locked_until, correlation_id
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                ",
            )
            .bind(message.id.as_uuid())
            .bind(&message.message_type)
            .bind(&message.payload)
            .bind(message.occurred_at)
            .bind(message.processed_at)
            .bind(&message.error)
            .bind(rows::int(message.attempts)?)
            .bind(message.locked_until)
            .bind(message.correlation_id)
            .execute(self.conn())
            .await
            .map_err(db_error)?;
            Ok(())
        })
    }

    fn claim_outbox_batch(
        &mut self,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
        limit_to: u32,
        max_attempts: u32,
    ) -> StoreFuture<'_, Vec<OutboxMessage>> {
        Box::pin(async move {
            let query = format!(
                r"
                UPDATE outbox_messages
                SET locked_until = $2
                WHERE id IN (
                    SELECT id FROM outbox_messages
                    WHERE processed_at IS NULL
                      AND attempts < $4
                      AND (locked_until IS NULL OR locked_until <= $1)
                    ORDER BY occurred_at, seq
                    LIMIT $3
                    FOR UPDATE SKIP LOCKED
                )
                RETURNING seq, {OUTBOX_COLUMNS}
                "
            );
            let rows = sqlx::query(&query)
                .bind(now)
                .bind(lease_until)
                .bind(limit(limit_to))
                .bind(rows::int(max_attempts)?)
                .fetch_all(self.conn())
                .await
                .map_err(db_error)?;

            let mut claimed = Vec::with_capacity(rows.len());
            for row in &rows {
                let seq: i64 = row.try_get("seq").map_err(db_error)?;
                claimed.push((seq, rows::outbox_message(row)?));
            }
            claimed.sort_by_key(|(seq, message)| (message.occurred_at, *seq));
            if !claimed.is_empty() {
                tracing::debug!(count = claimed.len(), lease_until = %lease_until, "Outbox rows leased");
            }
            Ok(claimed.into_iter().map(|(_, message)| message).collect())
        })
    }

    fn mark_outbox_processed(
        &mut self,
        id: OutboxMessageId,
        processed_at: DateTime<Utc>,
    ) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let updated = sqlx::query(
                "UPDATE outbox_messages SET processed_at = $2, locked_until = NULL WHERE id = $1",
            )
            .bind(id.as_uuid())
            .bind(processed_at)
            .execute(self.conn())
            .await
            .map_err(db_error)?;
            if updated.rows_affected() == 0 {
                return Err(StoreError::not_found("outbox_message", id));
            }
            Ok(())
        })
    }

    fn mark_outbox_failed(&mut self, id: OutboxMessageId, error: String) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let updated = sqlx::query(
                r"
                UPDATE outbox_messages
                SET error = $2, attempts = attempts + 1, locked_until = NULL
                WHERE id = $1
                ",
            )
            .bind(id.as_uuid())
            .bind(&error)
            .execute(self.conn())
            .await
            .map_err(db_error)?;
            if updated.rows_affected() == 0 {
                return Err(StoreError::not_found("outbox_message", id));
            }
            Ok(())
        })
    }

    fn requeue_outbox_message(&mut self, id: OutboxMessageId) -> StoreFuture<'_, bool> {
        Box::pin(async move {
            let updated = sqlx::query(
                r"
                UPDATE outbox_messages
                SET attempts = 0, error = NULL, locked_until = NULL
                WHERE id = $1 AND processed_at IS NULL
                ",
            )
            .bind(id.as_uuid())
            .execute(self.conn())
            .await
            .map_err(db_error)?;
            if updated.rows_affected() > 0 {
                return Ok(true);
            }
            match self.outbox_row(id).await? {
                Some(_) => Ok(false),
                None => Err(StoreError::not_found("outbox_message", id)),
            }
        })
    }

    fn get_outbox_message(
        &mut self,
        id: OutboxMessageId,
    ) -> StoreFuture<'_, Option<OutboxMessage>> {
        Box::pin(self.outbox_row(id))
    }
}

impl Transaction for PgTransaction {
    fn commit(self: Box<Self>) -> StoreFuture<'static, ()> {
        Box::pin(async move {
            self.tx.commit().await.map_err(db_error)?;
            metrics::counter!("checkout_store_transactions_total", "outcome" => "commit")
                .increment(1);
            Ok(())
        })
    }

    fn rollback(self: Box<Self>) -> StoreFuture<'static, ()> {
        Box::pin(async move {
            self.tx.rollback().await.map_err(db_error)?;
            metrics::counter!("checkout_store_transactions_total", "outcome" => "rollback")
                .increment(1);
            Ok(())
        })
    }
}
