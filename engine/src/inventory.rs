//! Inventory reservation manager.
//!
//! Stock moves only through ledger rows. Each command appends rows and applies
//! the same deltas to the variant's cached counters in one transaction, so the
//! counters always equal the ledger sums:
//!
//! | command  | ledger row  | on hand | reserved |
//! |----------|-------------|---------|----------|
//! | reserve  | Reserve +q  |         | +q       |
//! | commit   | Commit −q   | −q      | −q       |
//! | release  | Release −q  |         | −q       |
//! | adjust   | AdminAdjust | ±d      |          |
//!
//! `reserve` is optimistic: the variant is read without a lock and written
//! back with its row version, so two buyers racing for the last units get
//! one success and one [`CheckoutError::ConcurrencyConflict`]. It never
//! retries. `commit` and `release` lock the variants of a reference in id
//! order and only act on what is still outstanding, which makes both
//! idempotent.

use crate::observe;
use checkout_core::audit::{Auditable, SoftDeletable};
use checkout_core::context::RequestContext;
use checkout_core::environment::Clock;
use checkout_core::error::{BusinessRuleViolation, CheckoutError};
use checkout_core::event::{DomainEvent, StockLine};
use checkout_core::model::{
    InventoryTransaction, ProductVariant, StockLevels, outstanding_reservations,
};
use checkout_core::store::{InventoryLedger, Transaction, UnitOfWork, VariantRepository};
use checkout_core::types::{OrderItemId, ReferenceNumber, RowVersion, VariantId};
use checkout_core::unit_of_work::{discard, finish, record_event};
use chrono::{DateTime, Utc};
use metrics::counter;
use std::sync::Arc;

/// A request to hold stock for one line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReserveStock {
    /// Variant to reserve.
    pub variant_id: VariantId,
    /// Units to reserve.
    pub quantity: u32,
    /// Reference grouping the reservation (usually the order's).
    pub reference: ReferenceNumber,
    /// Version the caller last saw; a mismatch is a conflict.
    pub expected_row_version: Option<RowVersion>,
    /// Order line the units belong to.
    pub order_item_id: Option<OrderItemId>,
}

impl ReserveStock {
    /// Reservation of `quantity` units of `variant_id` under `reference`.
    #[must_use]
    pub const fn new(variant_id: VariantId, quantity: u32, reference: ReferenceNumber) -> Self {
        Self {
            variant_id,
            quantity,
            reference,
            expected_row_version: None,
            order_item_id: None,
        }
    }

    /// Requires the variant to still be at `version`.
    #[must_use]
    pub const fn expecting(mut self, version: RowVersion) -> Self {
        self.expected_row_version = Some(version);
        self
    }

    /// Attaches the order line.
    #[must_use]
    pub const fn for_item(mut self, order_item_id: OrderItemId) -> Self {
        self.order_item_id = Some(order_item_id);
        self
    }
}

/// Reserves, commits, releases and reconciles stock.
#[derive(Clone)]
pub struct InventoryService {
    uow: Arc<dyn UnitOfWork>,
    clock: Arc<dyn Clock>,
}

impl InventoryService {
    /// Service over `uow`.
    #[must_use]
    pub fn new(uow: Arc<dyn UnitOfWork>, clock: Arc<dyn Clock>) -> Self {
        Self { uow, clock }
    }

    /// Holds stock for one line and returns the updated variant.
    ///
    /// # Errors
    ///
    /// - [`BusinessRuleViolation::OutOfStock`] if fewer units are available
    /// - [`CheckoutError::ConcurrencyConflict`] if the variant changed since it
    ///   was read, or is not at the expected row version
    /// - [`CheckoutError::NotFound`] for unknown or deleted variants
    #[tracing::instrument(skip_all, fields(
        correlation_id = %ctx.correlation_id,
        variant_id = %request.variant_id,
        quantity = request.quantity,
        reference = %request.reference,
    ))]
    pub async fn reserve(
        &self,
        ctx: &RequestContext,
        request: ReserveStock,
    ) -> Result<ProductVariant, CheckoutError> {
        let now = self.clock.now();
        let mut tx = self.uow.begin().await?;
        let result: Result<_, CheckoutError> = async {
            let variant = Self::reserve_in(tx.as_mut(), ctx, &request, now).await?;
            let event = DomainEvent::StockReserved {
                reference: request.reference.clone(),
                lines: vec![StockLine {
                    variant_id: request.variant_id,
                    quantity: i64::from(request.quantity),
                }],
            };
            record_event(tx.as_mut(), ctx, &event, now).await?;
            Ok(variant)
        }
        .await;
        let result = finish(tx, result).await;
        observe("inventory.reserve", &result);
        if let Ok(variant) = &result {
            tracing::info!(available = variant.available(), "Stock reserved");
        }
        result
    }

    /// Reserve step usable inside a larger transaction. Does not record an
    /// event; the caller announces the whole reservation.
    ///
    /// # Errors
    ///
    /// See [`InventoryService::reserve`].
    pub async fn reserve_in(
        tx: &mut dyn Transaction,
        ctx: &RequestContext,
        request: &ReserveStock,
        now: DateTime<Utc>,
    ) -> Result<ProductVariant, CheckoutError> {
        if request.quantity == 0 {
            return Err(BusinessRuleViolation::InvalidQuantity(
                "reserved quantity must be positive".to_string(),
            )
            .into());
        }

        let variant = tx
            .get_variant(request.variant_id)
            .await?
            .filter(|v| !v.is_deleted())
            .ok_or_else(|| CheckoutError::not_found("product_variant", request.variant_id))?;

        if let Some(expected) = request.expected_row_version {
            if expected != variant.row_version {
                return Err(CheckoutError::ConcurrencyConflict {
                    entity: "product_variant",
                    id: variant.id.to_string(),
                });
            }
        }

        let available = variant.available();
        if available < i64::from(request.quantity) {
            return Err(BusinessRuleViolation::OutOfStock {
                variant_id: variant.id,
                requested: request.quantity,
                available,
            }
            .into());
        }

        let entry = InventoryTransaction::reserve(
            variant.id,
            request.quantity,
            request.reference.clone(),
            now,
        )
        .with_order_item(request.order_item_id)
        .with_user(ctx.user_id);

        let mut updated = variant.clone();
        updated.apply(&entry);
        updated.touch(now);
        updated.row_version = tx.update_variant(updated.clone(), variant.row_version).await?;
        tx.append_inventory_transaction(entry).await?;

        counter!("inventory_movements_total", "kind" => "reserve").increment(1);
        Ok(updated)
    }

    /// Consumes every outstanding reservation under `reference`.
    ///
    /// Returns the committed lines; empty when nothing was outstanding.
    ///
    /// # Errors
    ///
    /// Returns [`CheckoutError`] if the store fails.
    #[tracing::instrument(skip_all, fields(correlation_id = %ctx.correlation_id, reference = %reference))]
    pub async fn commit(
        &self,
        ctx: &RequestContext,
        reference: &ReferenceNumber,
    ) -> Result<Vec<StockLine>, CheckoutError> {
        let now = self.clock.now();
        let mut tx = self.uow.begin().await?;
        let result = Self::commit_in(tx.as_mut(), ctx, reference, now).await;
        let result = finish(tx, result).await;
        observe("inventory.commit", &result);
        result
    }

    /// Commit step usable inside a larger transaction.
    ///
    /// # Errors
    ///
    /// Returns [`CheckoutError`] if the store fails.
    pub async fn commit_in(
        tx: &mut dyn Transaction,
        ctx: &RequestContext,
        reference: &ReferenceNumber,
        now: DateTime<Utc>,
    ) -> Result<Vec<StockLine>, CheckoutError> {
        let lines = Self::close_reference(tx, ctx, reference, now, Closing::Commit).await?;
        if !lines.is_empty() {
            let event = DomainEvent::StockCommitted {
                reference: reference.clone(),
                lines: lines.clone(),
            };
            record_event(tx, ctx, &event, now).await?;
            tracing::info!(reference = %reference, lines = lines.len(), "Stock committed");
        }
        Ok(lines)
    }

    /// Returns every outstanding reservation under `reference` to the
    /// available pool.
    ///
    /// # Errors
    ///
    /// Returns [`CheckoutError`] if the store fails.
    #[tracing::instrument(skip_all, fields(correlation_id = %ctx.correlation_id, reference = %reference))]
    pub async fn release(
        &self,
        ctx: &RequestContext,
        reference: &ReferenceNumber,
    ) -> Result<Vec<StockLine>, CheckoutError> {
        let now = self.clock.now();
        let mut tx = self.uow.begin().await?;
        let result = Self::release_in(tx.as_mut(), ctx, reference, now).await;
        let result = finish(tx, result).await;
        observe("inventory.release", &result);
        result
    }

    /// Release step usable inside a larger transaction.
    ///
    /// # Errors
    ///
    /// Returns [`CheckoutError`] if the store fails.
    pub async fn release_in(
        tx: &mut dyn Transaction,
        ctx: &RequestContext,
        reference: &ReferenceNumber,
        now: DateTime<Utc>,
    ) -> Result<Vec<StockLine>, CheckoutError> {
        let lines = Self::close_reference(tx, ctx, reference, now, Closing::Release).await?;
        if !lines.is_empty() {
            let event = DomainEvent::StockReleased {
                reference: reference.clone(),
                lines: lines.clone(),
            };
            record_event(tx, ctx, &event, now).await?;
            tracing::info!(reference = %reference, lines = lines.len(), "Stock released");
        }
        Ok(lines)
    }

    async fn close_reference(
        tx: &mut dyn Transaction,
        ctx: &RequestContext,
        reference: &ReferenceNumber,
        now: DateTime<Utc>,
        closing: Closing,
    ) -> Result<Vec<StockLine>, CheckoutError> {
        let rows = tx.inventory_transactions_by_reference(reference.clone()).await?;
        let candidates = outstanding_reservations(&rows);
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        // Sorted by variant id, so concurrent closers lock in the same order.
        let mut variants = Vec::with_capacity(candidates.len());
        for (variant_id, _) in &candidates {
            let variant = tx
                .get_variant_for_update(*variant_id)
                .await?
                .ok_or_else(|| CheckoutError::not_found("product_variant", variant_id))?;
            variants.push(variant);
        }

        // Another transaction may have closed the reference while we waited.
        let rows = tx.inventory_transactions_by_reference(reference.clone()).await?;
        let mut lines = Vec::new();
        for (variant_id, quantity) in outstanding_reservations(&rows) {
            let Some(variant) = variants.iter_mut().find(|v| v.id == variant_id) else {
                continue;
            };
            let entry = closing
                .entry(variant_id, quantity, reference.clone(), now)
                .with_user(ctx.user_id);
            let expected = variant.row_version;
            variant.apply(&entry);
            variant.touch(now);
            variant.row_version = tx.update_variant(variant.clone(), expected).await?;
            tx.append_inventory_transaction(entry).await?;

            counter!("inventory_movements_total", "kind" => closing.label()).increment(1);
            lines.push(StockLine {
                variant_id,
                quantity,
            });
        }
        Ok(lines)
    }

    /// Recomputes a variant's counters from the ledger.
    ///
    /// Returns `true` if the cached counters had drifted and were corrected;
    /// the drift is recorded as a `Reconcile` ledger row.
    ///
    /// # Errors
    ///
    /// Returns [`CheckoutError::NotFound`] for unknown variants.
    #[tracing::instrument(skip_all, fields(correlation_id = %ctx.correlation_id, variant_id = %variant_id))]
    pub async fn reconcile(
        &self,
        ctx: &RequestContext,
        variant_id: VariantId,
    ) -> Result<bool, CheckoutError> {
        let now = self.clock.now();
        let mut tx = self.uow.begin().await?;
        let result = Self::reconcile_in(tx.as_mut(), ctx, variant_id, now).await;
        let result = finish(tx, result).await;
        observe("inventory.reconcile", &result);
        if let Ok(corrected) = result {
            counter!(
                "inventory_reconciliations_total",
                "corrected" => if corrected { "true" } else { "false" }
            )
            .increment(1);
        }
        result
    }

    async fn reconcile_in(
        tx: &mut dyn Transaction,
        ctx: &RequestContext,
        variant_id: VariantId,
        now: DateTime<Utc>,
    ) -> Result<bool, CheckoutError> {
        let variant = tx
            .get_variant_for_update(variant_id)
            .await?
            .ok_or_else(|| CheckoutError::not_found("product_variant", variant_id))?;
        let ledger = tx.ledger_totals(variant_id).await?;
        if ledger == variant.levels() {
            return Ok(false);
        }

        let on_hand_drift = variant.on_hand - ledger.on_hand;
        let reserved_drift = variant.reserved - ledger.reserved;
        let entry = InventoryTransaction::reconcile(
            variant_id,
            on_hand_drift,
            ReferenceNumber::new(format!("RECON-{}", uuid::Uuid::new_v4().simple())),
            now,
        )
        .with_user(ctx.user_id)
        .with_notes(format!(
            "cached on_hand {} reserved {}, ledger on_hand {} reserved {}",
            variant.on_hand, variant.reserved, ledger.on_hand, ledger.reserved
        ));

        let mut corrected = variant.clone();
        corrected.on_hand = ledger.on_hand;
        corrected.reserved = ledger.reserved;
        corrected.touch(now);
        tx.update_variant(corrected, variant.row_version).await?;
        tx.append_inventory_transaction(entry).await?;

        let event = DomainEvent::StockReconciled {
            variant_id,
            on_hand_drift,
            reserved_drift,
        };
        record_event(tx, ctx, &event, now).await?;
        tracing::warn!(
            variant_id = %variant_id,
            on_hand_drift,
            reserved_drift,
            "Stock counters drifted from the ledger and were corrected"
        );
        Ok(true)
    }

    /// Changes physical stock by `delta` (receiving goods, write-offs).
    ///
    /// # Errors
    ///
    /// Returns [`BusinessRuleViolation::InvalidQuantity`] for a zero delta or
    /// one that would leave fewer units on hand than are reserved.
    #[tracing::instrument(skip_all, fields(correlation_id = %ctx.correlation_id, variant_id = %variant_id, delta))]
    pub async fn adjust_stock(
        &self,
        ctx: &RequestContext,
        variant_id: VariantId,
        delta: i64,
        notes: &str,
    ) -> Result<ProductVariant, CheckoutError> {
        let now = self.clock.now();
        let mut tx = self.uow.begin().await?;
        let result: Result<_, CheckoutError> = async {
            if delta == 0 {
                return Err(BusinessRuleViolation::InvalidQuantity(
                    "adjustment must not be zero".to_string(),
                )
                .into());
            }
            let variant = tx
                .get_variant_for_update(variant_id)
                .await?
                .ok_or_else(|| CheckoutError::not_found("product_variant", variant_id))?;
            if variant.available() + delta < 0 {
                return Err(BusinessRuleViolation::InvalidQuantity(format!(
                    "adjustment of {delta} would leave {} available",
                    variant.available() + delta
                ))
                .into());
            }

            let entry = InventoryTransaction::adjust(
                variant_id,
                delta,
                ReferenceNumber::new(format!("ADJ-{}", uuid::Uuid::new_v4().simple())),
                now,
            )
            .with_user(ctx.user_id)
            .with_notes(notes);
            let mut updated = variant.clone();
            updated.apply(&entry);
            updated.touch(now);
            updated.row_version = tx.update_variant(updated.clone(), variant.row_version).await?;
            tx.append_inventory_transaction(entry).await?;

            let event = DomainEvent::StockAdjusted {
                variant_id,
                delta,
                on_hand: updated.on_hand,
            };
            record_event(tx.as_mut(), ctx, &event, now).await?;
            counter!("inventory_movements_total", "kind" => "admin_adjust").increment(1);
            Ok(updated)
        }
        .await;
        let result = finish(tx, result).await;
        observe("inventory.adjust", &result);
        if let Ok(variant) = &result {
            tracing::info!(on_hand = variant.on_hand, "Stock adjusted");
        }
        result
    }

    /// Creates a variant with `initial_stock` units and the opening ledger
    /// row that accounts for them.
    ///
    /// # Errors
    ///
    /// Returns [`CheckoutError::Fatal`] if a variant with the same id exists.
    #[tracing::instrument(skip_all, fields(correlation_id = %ctx.correlation_id, variant_id = %variant.id, sku = %variant.sku))]
    pub async fn register_variant(
        &self,
        ctx: &RequestContext,
        variant: ProductVariant,
        initial_stock: u32,
    ) -> Result<ProductVariant, CheckoutError> {
        let now = self.clock.now();
        let mut tx = self.uow.begin().await?;
        let result: Result<_, CheckoutError> = async {
            let mut variant = variant;
            variant.on_hand = i64::from(initial_stock);
            variant.reserved = 0;
            variant.row_version = RowVersion::INITIAL;
            variant.audit = checkout_core::audit::AuditInfo::new(now);
            tx.insert_variant(variant.clone()).await?;

            if initial_stock > 0 {
                let entry = InventoryTransaction::adjust(
                    variant.id,
                    variant.on_hand,
                    ReferenceNumber::new(format!("OPEN-{}", variant.sku)),
                    now,
                )
                .with_user(ctx.user_id)
                .with_notes("opening stock");
                tx.append_inventory_transaction(entry).await?;
                let event = DomainEvent::StockAdjusted {
                    variant_id: variant.id,
                    delta: variant.on_hand,
                    on_hand: variant.on_hand,
                };
                record_event(tx.as_mut(), ctx, &event, now).await?;
            }
            Ok(variant)
        }
        .await;
        let result = finish(tx, result).await;
        observe("inventory.register", &result);
        result
    }

    /// Current stock levels of a variant.
    ///
    /// # Errors
    ///
    /// Returns [`CheckoutError::NotFound`] for unknown variants.
    pub async fn availability(&self, variant_id: VariantId) -> Result<StockLevels, CheckoutError> {
        let mut tx = self.uow.begin().await?;
        let result = tx
            .get_variant(variant_id)
            .await
            .map_err(CheckoutError::from)
            .and_then(|v| {
                v.map(|v| v.levels())
                    .ok_or_else(|| CheckoutError::not_found("product_variant", variant_id))
            });
        discard(tx, result).await
    }
}

#[derive(Debug, Clone, Copy)]
enum Closing {
    Commit,
    Release,
}

impl Closing {
    fn entry(
        self,
        variant_id: VariantId,
        quantity: i64,
        reference: ReferenceNumber,
        now: DateTime<Utc>,
    ) -> InventoryTransaction {
        match self {
            Self::Commit => InventoryTransaction::commit(variant_id, quantity, reference, now),
            Self::Release => InventoryTransaction::release(variant_id, quantity, reference, now),
        }
    }

    const fn label(self) -> &'static str {
        match self {
            Self::Commit => "commit",
            Self::Release => "release",
        }
    }
}
