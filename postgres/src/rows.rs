//! Conversions between database rows and domain values.
//!
//! Amounts and counters are stored as signed integers; a value that does not
//! fit the domain type is reported as [`StoreError::Serialization`] instead
//! of being clamped.

use checkout_core::audit::{AuditInfo, SoftDelete};
use checkout_core::error::StoreError;
use checkout_core::model::{
    DiscountCode, DiscountUsage, DiscountUsageStatus, InventoryTransaction,
    InventoryTransactionType, Order, OrderItem, OrderStatus, OutboxMessage, PaymentStatus,
    PaymentTransaction, ProductVariant, WalletReservation, WalletReservationStatus,
};
use checkout_core::types::{
    CategoryId, DiscountCodeId, DiscountUsageId, IdempotencyKey, InventoryTransactionId, Money,
    OrderId, OrderItemId, OutboxMessageId, PaymentTransactionId, ProductId, ReferenceNumber,
    RowVersion, UserId, VariantId, WalletReservationId,
};
use sqlx::Row;
use sqlx::postgres::PgRow;
use uuid::Uuid;

/// Maps a driver error, keeping unique violations distinguishable.
pub(crate) fn db_error(error: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db_err) = &error {
        if db_err.is_unique_violation() {
            return StoreError::UniqueViolation {
                constraint: db_err.constraint().unwrap_or("unknown").to_string(),
            };
        }
    }
    StoreError::Database(error.to_string())
}

fn decode(error: sqlx::Error) -> StoreError {
    StoreError::Serialization(error.to_string())
}

fn get<'r, T>(row: &'r PgRow, column: &str) -> Result<T, StoreError>
where
    T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
{
    row.try_get(column).map_err(decode)
}

fn invalid(column: &str, value: impl std::fmt::Display) -> StoreError {
    StoreError::Serialization(format!("invalid {column}: {value}"))
}

pub(crate) fn money(row: &PgRow, column: &str) -> Result<Money, StoreError> {
    let value: i64 = get(row, column)?;
    u64::try_from(value)
        .map(Money::from_minor)
        .map_err(|_| invalid(column, value))
}

pub(crate) fn count(row: &PgRow, column: &str) -> Result<u32, StoreError> {
    let value: i64 = get(row, column)?;
    u32::try_from(value).map_err(|_| invalid(column, value))
}

fn small_count(row: &PgRow, column: &str) -> Result<u32, StoreError> {
    let value: i32 = get(row, column)?;
    u32::try_from(value).map_err(|_| invalid(column, value))
}

fn version(row: &PgRow) -> Result<RowVersion, StoreError> {
    let value: i64 = get(row, "row_version")?;
    u64::try_from(value)
        .map(RowVersion::new)
        .map_err(|_| invalid("row_version", value))
}

fn audit(row: &PgRow) -> Result<AuditInfo, StoreError> {
    Ok(AuditInfo {
        created_at: get(row, "created_at")?,
        updated_at: get(row, "updated_at")?,
    })
}

fn deletion(row: &PgRow) -> Result<SoftDelete, StoreError> {
    Ok(SoftDelete {
        is_deleted: get(row, "is_deleted")?,
        deleted_at: get(row, "deleted_at")?,
    })
}

/// Amount as stored in a `BIGINT` column.
pub(crate) fn minor(amount: Money) -> Result<i64, StoreError> {
    i64::try_from(amount.minor()).map_err(|_| invalid("amount", amount))
}

/// Row version as stored in a `BIGINT` column.
pub(crate) fn version_value(version: RowVersion) -> Result<i64, StoreError> {
    i64::try_from(version.value()).map_err(|_| invalid("row_version", version))
}

/// Counter as stored in an `INTEGER` column.
pub(crate) fn int(value: u32) -> Result<i32, StoreError> {
    i32::try_from(value).map_err(|_| invalid("counter", value))
}

pub(crate) const VARIANT_COLUMNS: &str = "id, product_id, category_id, sku, on_hand, reserved, \
     row_version, created_at, updated_at, is_deleted, deleted_at";

pub(crate) fn variant(row: &PgRow) -> Result<ProductVariant, StoreError> {
    Ok(ProductVariant {
        id: VariantId::from_uuid(get(row, "id")?),
        product_id: ProductId::from_uuid(get(row, "product_id")?),
        category_id: get::<Option<Uuid>>(row, "category_id")?.map(CategoryId::from_uuid),
        sku: get(row, "sku")?,
        on_hand: get(row, "on_hand")?,
        reserved: get(row, "reserved")?,
        row_version: version(row)?,
        audit: audit(row)?,
        deletion: deletion(row)?,
    })
}

pub(crate) const INVENTORY_COLUMNS: &str = "id, variant_id, kind, quantity_change, \
     reference_number, order_item_id, user_id, notes, occurred_at";

pub(crate) fn inventory_transaction(row: &PgRow) -> Result<InventoryTransaction, StoreError> {
    let kind: String = get(row, "kind")?;
    Ok(InventoryTransaction {
        id: InventoryTransactionId::from_uuid(get(row, "id")?),
        variant_id: VariantId::from_uuid(get(row, "variant_id")?),
        kind: InventoryTransactionType::parse(&kind).ok_or_else(|| invalid("kind", &kind))?,
        quantity_change: get(row, "quantity_change")?,
        reference_number: ReferenceNumber::new(get::<String>(row, "reference_number")?),
        order_item_id: get::<Option<Uuid>>(row, "order_item_id")?.map(OrderItemId::from_uuid),
        user_id: get::<Option<Uuid>>(row, "user_id")?.map(UserId::from_uuid),
        notes: get(row, "notes")?,
        occurred_at: get(row, "occurred_at")?,
    })
}

pub(crate) const DISCOUNT_COLUMNS: &str = "id, code, usage_count, max_usage, per_user_limit, \
     kind, restrictions, starts_at, expires_at, is_active, row_version, created_at, updated_at, \
     is_deleted, deleted_at";

pub(crate) fn discount_code(row: &PgRow) -> Result<DiscountCode, StoreError> {
    let per_user_limit = get::<Option<i32>>(row, "per_user_limit")?
        .map(|limit| u32::try_from(limit).map_err(|_| invalid("per_user_limit", limit)))
        .transpose()?;
    Ok(DiscountCode {
        id: DiscountCodeId::from_uuid(get(row, "id")?),
        code: get(row, "code")?,
        usage_count: small_count(row, "usage_count")?,
        max_usage: small_count(row, "max_usage")?,
        per_user_limit,
        kind: serde_json::from_value(get(row, "kind")?)?,
        restrictions: serde_json::from_value(get(row, "restrictions")?)?,
        starts_at: get(row, "starts_at")?,
        expires_at: get(row, "expires_at")?,
        is_active: get(row, "is_active")?,
        row_version: version(row)?,
        audit: audit(row)?,
        deletion: deletion(row)?,
    })
}

pub(crate) const USAGE_COLUMNS: &str =
    "id, discount_code_id, order_id, user_id, discount_amount, status, created_at, updated_at";

pub(crate) fn discount_usage(row: &PgRow) -> Result<DiscountUsage, StoreError> {
    let status: String = get(row, "status")?;
    Ok(DiscountUsage {
        id: DiscountUsageId::from_uuid(get(row, "id")?),
        discount_code_id: DiscountCodeId::from_uuid(get(row, "discount_code_id")?),
        order_id: OrderId::from_uuid(get(row, "order_id")?),
        user_id: UserId::from_uuid(get(row, "user_id")?),
        discount_amount: money(row, "discount_amount")?,
        status: DiscountUsageStatus::parse(&status).ok_or_else(|| invalid("status", &status))?,
        created_at: get(row, "created_at")?,
        updated_at: get(row, "updated_at")?,
    })
}

pub(crate) const ORDER_COLUMNS: &str = "id, idempotency_key, user_id, status, subtotal, \
     discount_total, total, wallet_amount, gateway_amount, reservation_reference, \
     discount_code_id, wallet_reservation_id, row_version, created_at, updated_at, is_deleted, \
     deleted_at";

/// Order header; lines are attached by the caller.
pub(crate) fn order(row: &PgRow) -> Result<Order, StoreError> {
    let status: String = get(row, "status")?;
    let key: String = get(row, "idempotency_key")?;
    Ok(Order {
        id: OrderId::from_uuid(get(row, "id")?),
        idempotency_key: IdempotencyKey::parse(&key)
            .ok_or_else(|| invalid("idempotency_key", &key))?,
        user_id: UserId::from_uuid(get(row, "user_id")?),
        status: OrderStatus::parse(&status).ok_or_else(|| invalid("status", &status))?,
        subtotal: money(row, "subtotal")?,
        discount_total: money(row, "discount_total")?,
        total: money(row, "total")?,
        wallet_amount: money(row, "wallet_amount")?,
        gateway_amount: money(row, "gateway_amount")?,
        reservation_reference: ReferenceNumber::new(get::<String>(row, "reservation_reference")?),
        discount_code_id: get::<Option<Uuid>>(row, "discount_code_id")?
            .map(DiscountCodeId::from_uuid),
        wallet_reservation_id: get::<Option<Uuid>>(row, "wallet_reservation_id")?
            .map(WalletReservationId::from_uuid),
        items: Vec::new(),
        row_version: version(row)?,
        audit: audit(row)?,
        deletion: deletion(row)?,
    })
}

pub(crate) fn order_item(row: &PgRow) -> Result<(OrderId, OrderItem), StoreError> {
    let order_id = OrderId::from_uuid(get(row, "order_id")?);
    Ok((
        order_id,
        OrderItem {
            id: OrderItemId::from_uuid(get(row, "id")?),
            variant_id: VariantId::from_uuid(get(row, "variant_id")?),
            quantity: small_count(row, "quantity")?,
            unit_price: money(row, "unit_price")?,
            line_total: money(row, "line_total")?,
        },
    ))
}

pub(crate) const PAYMENT_COLUMNS: &str = "id, authority, order_id, gateway_name, status, amount, \
     expires_at, ref_id, failure_reason, verified_at, created_at, updated_at";

pub(crate) fn payment(row: &PgRow) -> Result<PaymentTransaction, StoreError> {
    let status: String = get(row, "status")?;
    Ok(PaymentTransaction {
        id: PaymentTransactionId::from_uuid(get(row, "id")?),
        authority: get(row, "authority")?,
        order_id: OrderId::from_uuid(get(row, "order_id")?),
        gateway_name: get(row, "gateway_name")?,
        status: PaymentStatus::parse(&status).ok_or_else(|| invalid("status", &status))?,
        amount: money(row, "amount")?,
        expires_at: get(row, "expires_at")?,
        ref_id: get(row, "ref_id")?,
        failure_reason: get(row, "failure_reason")?,
        verified_at: get(row, "verified_at")?,
        created_at: get(row, "created_at")?,
        updated_at: get(row, "updated_at")?,
    })
}

pub(crate) const RESERVATION_COLUMNS: &str =
    "id, user_id, order_id, amount, status, created_at, updated_at";

pub(crate) fn wallet_reservation(row: &PgRow) -> Result<WalletReservation, StoreError> {
    let status: String = get(row, "status")?;
    Ok(WalletReservation {
        id: WalletReservationId::from_uuid(get(row, "id")?),
        user_id: UserId::from_uuid(get(row, "user_id")?),
        order_id: OrderId::from_uuid(get(row, "order_id")?),
        amount: money(row, "amount")?,
        status: WalletReservationStatus::parse(&status)
            .ok_or_else(|| invalid("status", &status))?,
        created_at: get(row, "created_at")?,
        updated_at: get(row, "updated_at")?,
    })
}

pub(crate) const OUTBOX_COLUMNS: &str = "id, message_type, payload, occurred_at, processed_at, \
     error, attempts, locked_until, correlation_id";

pub(crate) fn outbox_message(row: &PgRow) -> Result<OutboxMessage, StoreError> {
    Ok(OutboxMessage {
        id: OutboxMessageId::from_uuid(get(row, "id")?),
        message_type: get(row, "message_type")?,
        payload: get(row, "payload")?,
        occurred_at: get(row, "occurred_at")?,
        processed_at: get(row, "processed_at")?,
        error: get(row, "error")?,
        attempts: small_count(row, "attempts")?,
        locked_until: get(row, "locked_until")?,
        correlation_id: get(row, "correlation_id")?,
    })
}

/// Transaction-scoped advisory lock key of a customer's wallet.
pub(crate) fn wallet_lock_key(user_id: UserId) -> i64 {
    let (high, low) = user_id.as_uuid().as_u64_pair();
    i64::from_ne_bytes((high ^ low).to_ne_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oversized_amounts_are_rejected_instead_of_wrapping() {
        assert!(minor(Money::from_minor(u64::MAX)).is_err());
        assert_eq!(minor(Money::from_minor(1_500)).ok(), Some(1_500));
    }

    #[test]
    fn wallet_lock_keys_are_stable_per_user() {
        let user = UserId::new();
        assert_eq!(wallet_lock_key(user), wallet_lock_key(user));
        assert_ne!(wallet_lock_key(user), wallet_lock_key(UserId::new()));
    }
}
