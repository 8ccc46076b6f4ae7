//! Builders and seeding helpers for test data.
//!
//! Seeding writes the same rows the services would, so the ledger invariants
//! hold from the first assertion: a seeded variant gets an opening
//! `AdminAdjust` row and a seeded wallet gets a credit entry.

use crate::clock::epoch;
use checkout_core::error::StoreError;
use checkout_core::event::DomainEvent;
use checkout_core::model::{
    DiscountCode, DiscountKind, InventoryTransaction, OutboxMessage, ProductVariant,
    WalletLedgerEntry, WalletReferenceType,
};
use checkout_core::store::{
    DiscountRepository, InventoryLedger, Transaction, UnitOfWork, VariantRepository,
    WalletRepository,
};
use checkout_core::types::{
    CategoryId, Money, OrderId, ProductId, ReferenceNumber, UserId, VariantId,
    WalletLedgerEntryId,
};
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

/// A variant without stock, created at [`epoch`].
#[must_use]
pub fn variant(sku: &str) -> ProductVariant {
    ProductVariant::new(VariantId::new(), ProductId::new(), None, sku, epoch())
}

/// A variant of `product_id` in `category_id`.
#[must_use]
pub fn variant_in(sku: &str, product_id: ProductId, category_id: CategoryId) -> ProductVariant {
    ProductVariant::new(
        VariantId::new(),
        product_id,
        Some(category_id),
        sku,
        epoch(),
    )
}

/// A percentage code with no cap.
#[must_use]
pub fn percentage_code(code: &str, percent: u8, max_usage: u32) -> DiscountCode {
    DiscountCode::new(
        code,
        DiscountKind::Percentage {
            percent,
            max_amount: None,
        },
        max_usage,
        epoch(),
    )
}

/// A fixed-amount code.
#[must_use]
pub fn fixed_code(code: &str, amount: u64, max_usage: u32) -> DiscountCode {
    DiscountCode::new(
        code,
        DiscountKind::FixedAmount {
            amount: Money::from_minor(amount),
        },
        max_usage,
        epoch(),
    )
}

/// `count` unrelated outbox rows, one second apart starting at `start`.
#[must_use]
pub fn outbox_messages(count: usize, start: DateTime<Utc>) -> Vec<OutboxMessage> {
    (0..count)
        .filter_map(|i| {
            let event = DomainEvent::OrderCancelled {
                order_id: OrderId::new(),
                user_id: UserId::new(),
                reason: format!("fixture {i}"),
            };
            let at = start + Duration::seconds(i64::try_from(i).unwrap_or(i64::MAX));
            OutboxMessage::from_event(&event, at, Uuid::new_v4()).ok()
        })
        .collect()
}

/// Inserts `variant` with `on_hand` units and the matching opening ledger row.
///
/// # Errors
///
/// Returns the store error if the insert or commit fails.
pub async fn seed_variant(
    store: &dyn UnitOfWork,
    mut variant: ProductVariant,
    on_hand: i64,
) -> Result<ProductVariant, StoreError> {
    let mut tx = store.begin().await?;
    variant.on_hand = on_hand;
    variant.reserved = 0;
    tx.insert_variant(variant.clone()).await?;
    tx.append_inventory_transaction(
        InventoryTransaction::adjust(
            variant.id,
            on_hand,
            ReferenceNumber::new(format!("OPEN-{}", variant.sku)),
            variant.audit.created_at,
        )
        .with_notes("opening stock"),
    )
    .await?;
    tx.commit().await?;
    Ok(variant)
}

/// Inserts a discount code.
///
/// # Errors
///
/// Returns the store error if the insert or commit fails.
pub async fn seed_discount_code(
    store: &dyn UnitOfWork,
    code: DiscountCode,
) -> Result<DiscountCode, StoreError> {
    let mut tx = store.begin().await?;
    tx.insert_discount_code(code.clone()).await?;
    tx.commit().await?;
    Ok(code)
}

/// Credits a wallet with `amount`.
///
/// # Errors
///
/// Returns the store error if the insert or commit fails.
pub async fn seed_wallet(store: &dyn UnitOfWork, user_id: UserId, amount: u64) -> Result<(), StoreError> {
    let mut tx: Box<dyn Transaction> = store.begin().await?;
    tx.lock_wallet(user_id).await?;
    let balance = tx.wallet_balance(user_id).await?;
    let delta = Money::from_minor(amount).as_signed();
    tx.append_wallet_entry(WalletLedgerEntry {
        id: WalletLedgerEntryId::new(),
        user_id,
        amount_delta: delta,
        balance_after: balance + delta,
        reference_type: WalletReferenceType::Credit,
        reference_id: "fixture".to_string(),
        occurred_at: epoch(),
    })
    .await?;
    tx.commit().await?;
    Ok(())
}
