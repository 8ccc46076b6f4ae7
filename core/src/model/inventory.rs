//! Product variants and the append-only stock ledger.

use crate::audit::{AuditInfo, SoftDelete};
use crate::impl_audited;
use crate::types::{
    CategoryId, InventoryTransactionId, OrderItemId, ProductId, ReferenceNumber, RowVersion,
    UserId, VariantId,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One purchasable SKU with its cached stock counters.
///
/// `on_hand` and `reserved` are caches of the ledger sums; the ledger stays
/// the source of truth and [`StockLevels::from_ledger`] recomputes them.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductVariant {
    /// Variant identifier.
    pub id: VariantId,
    /// Owning product.
    pub product_id: ProductId,
    /// Category used by scoped discount codes.
    pub category_id: Option<CategoryId>,
    /// Stock keeping unit.
    pub sku: String,
    /// Physical stock.
    pub on_hand: i64,
    /// Stock held by unconfirmed orders.
    pub reserved: i64,
    /// Optimistic concurrency token.
    pub row_version: RowVersion,
    /// Audit fields.
    pub audit: AuditInfo,
    /// Soft-delete marker.
    pub deletion: SoftDelete,
}

impl_audited!(ProductVariant);

impl ProductVariant {
    /// A variant with no stock yet.
    #[must_use]
    pub fn new(
        id: VariantId,
        product_id: ProductId,
        category_id: Option<CategoryId>,
        sku: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            product_id,
            category_id,
            sku: sku.into(),
            on_hand: 0,
            reserved: 0,
            row_version: RowVersion::INITIAL,
            audit: AuditInfo::new(now),
            deletion: SoftDelete::default(),
        }
    }

    /// Stock that can still be reserved.
    #[must_use]
    pub const fn available(&self) -> i64 {
        self.on_hand - self.reserved
    }

    /// Cached counters as a [`StockLevels`] value.
    #[must_use]
    pub const fn levels(&self) -> StockLevels {
        StockLevels {
            on_hand: self.on_hand,
            reserved: self.reserved,
        }
    }

    /// Applies a ledger row to the cached counters.
    pub fn apply(&mut self, entry: &InventoryTransaction) {
        self.on_hand += entry.on_hand_delta();
        self.reserved += entry.reserved_delta();
    }
}

/// Kind of stock movement recorded in the ledger.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InventoryTransactionType {
    /// Stock claimed by a checkout.
    Reserve,
    /// Reserved stock consumed by a paid order.
    Commit,
    /// Reserved stock returned to the available pool.
    Release,
    /// Audit record of a counter correction.
    Reconcile,
    /// Manual or receiving adjustment of physical stock.
    AdminAdjust,
}

impl InventoryTransactionType {
    /// Database representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Reserve => "reserve",
            Self::Commit => "commit",
            Self::Release => "release",
            Self::Reconcile => "reconcile",
            Self::AdminAdjust => "admin_adjust",
        }
    }

    /// Parses the database representation.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "reserve" => Some(Self::Reserve),
            "commit" => Some(Self::Commit),
            "release" => Some(Self::Release),
            "reconcile" => Some(Self::Reconcile),
            "admin_adjust" => Some(Self::AdminAdjust),
            _ => None,
        }
    }
}

impl fmt::Display for InventoryTransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One immutable row of the stock ledger.
///
/// | kind        | `quantity_change` | on hand | reserved |
/// |-------------|-------------------|---------|----------|
/// | Reserve     | +q                | 0       | +q       |
/// | Commit      | −q                | −q      | −q       |
/// | Release     | −q                | 0       | −q       |
/// | AdminAdjust | ±d                | ±d      | 0        |
/// | Reconcile   | drift             | 0       | 0        |
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryTransaction {
    /// Row identifier.
    pub id: InventoryTransactionId,
    /// Variant whose stock moved.
    pub variant_id: VariantId,
    /// Kind of movement.
    pub kind: InventoryTransactionType,
    /// Signed quantity of the movement.
    pub quantity_change: i64,
    /// Groups rows belonging to one order or attempt.
    pub reference_number: ReferenceNumber,
    /// Order line the movement belongs to.
    pub order_item_id: Option<OrderItemId>,
    /// Customer that triggered the movement.
    pub user_id: Option<UserId>,
    /// Free-form note.
    pub notes: String,
    /// When the row was written.
    pub occurred_at: DateTime<Utc>,
}

impl InventoryTransaction {
    fn row(
        variant_id: VariantId,
        kind: InventoryTransactionType,
        quantity_change: i64,
        reference_number: ReferenceNumber,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: InventoryTransactionId::new(),
            variant_id,
            kind,
            quantity_change,
            reference_number,
            order_item_id: None,
            user_id: None,
            notes: String::new(),
            occurred_at,
        }
    }

    /// A `Reserve` row for `quantity` units.
    #[must_use]
    pub fn reserve(
        variant_id: VariantId,
        quantity: u32,
        reference_number: ReferenceNumber,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self::row(
            variant_id,
            InventoryTransactionType::Reserve,
            i64::from(quantity),
            reference_number,
            occurred_at,
        )
    }

    /// A `Commit` row finalizing `quantity` reserved units.
    #[must_use]
    pub fn commit(
        variant_id: VariantId,
        quantity: i64,
        reference_number: ReferenceNumber,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self::row(
            variant_id,
            InventoryTransactionType::Commit,
            -quantity,
            reference_number,
            occurred_at,
        )
    }

    /// A `Release` row returning `quantity` reserved units.
    #[must_use]
    pub fn release(
        variant_id: VariantId,
        quantity: i64,
        reference_number: ReferenceNumber,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self::row(
            variant_id,
            InventoryTransactionType::Release,
            -quantity,
            reference_number,
            occurred_at,
        )
    }

    /// An `AdminAdjust` row changing physical stock by `delta`.
    #[must_use]
    pub fn adjust(
        variant_id: VariantId,
        delta: i64,
        reference_number: ReferenceNumber,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self::row(
            variant_id,
            InventoryTransactionType::AdminAdjust,
            delta,
            reference_number,
            occurred_at,
        )
    }

    /// A `Reconcile` audit row recording the on-hand drift that was corrected.
    #[must_use]
    pub fn reconcile(
        variant_id: VariantId,
        on_hand_drift: i64,
        reference_number: ReferenceNumber,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self::row(
            variant_id,
            InventoryTransactionType::Reconcile,
            on_hand_drift,
            reference_number,
            occurred_at,
        )
    }

    /// Attaches the order line.
    #[must_use]
    pub const fn with_order_item(mut self, order_item_id: Option<OrderItemId>) -> Self {
        self.order_item_id = order_item_id;
        self
    }

    /// Attaches the customer.
    #[must_use]
    pub const fn with_user(mut self, user_id: Option<UserId>) -> Self {
        self.user_id = user_id;
        self
    }

    /// Attaches a note.
    #[must_use]
    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = notes.into();
        self
    }

    /// Effect of this row on physical stock.
    #[must_use]
    pub const fn on_hand_delta(&self) -> i64 {
        match self.kind {
            InventoryTransactionType::Commit | InventoryTransactionType::AdminAdjust => {
                self.quantity_change
            }
            InventoryTransactionType::Reserve
            | InventoryTransactionType::Release
            | InventoryTransactionType::Reconcile => 0,
        }
    }

    /// Effect of this row on reserved stock.
    #[must_use]
    pub const fn reserved_delta(&self) -> i64 {
        match self.kind {
            InventoryTransactionType::Reserve
            | InventoryTransactionType::Commit
            | InventoryTransactionType::Release => self.quantity_change,
            InventoryTransactionType::AdminAdjust | InventoryTransactionType::Reconcile => 0,
        }
    }
}

/// Physical and reserved stock of a variant.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockLevels {
    /// Physical stock.
    pub on_hand: i64,
    /// Reserved stock.
    pub reserved: i64,
}

impl StockLevels {
    /// Stock that can still be reserved.
    #[must_use]
    pub const fn available(&self) -> i64 {
        self.on_hand - self.reserved
    }

    /// Sums ledger rows into stock levels.
    pub fn from_ledger<'a>(entries: impl IntoIterator<Item = &'a InventoryTransaction>) -> Self {
        entries.into_iter().fold(Self::default(), |acc, entry| Self {
            on_hand: acc.on_hand + entry.on_hand_delta(),
            reserved: acc.reserved + entry.reserved_delta(),
        })
    }
}

/// Outstanding (neither committed nor released) quantity per variant under
/// one reference.
///
/// Returned pairs are sorted by variant id so callers lock rows in a
/// consistent order.
#[must_use]
pub fn outstanding_reservations(entries: &[InventoryTransaction]) -> Vec<(VariantId, i64)> {
    let mut outstanding: std::collections::BTreeMap<VariantId, i64> =
        std::collections::BTreeMap::new();
    for entry in entries {
        match entry.kind {
            InventoryTransactionType::Reserve
            | InventoryTransactionType::Commit
            | InventoryTransactionType::Release => {
                *outstanding.entry(entry.variant_id).or_default() += entry.reserved_delta();
            }
            InventoryTransactionType::AdminAdjust | InventoryTransactionType::Reconcile => {}
        }
    }
    outstanding.into_iter().filter(|(_, qty)| *qty > 0).collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn reference() -> ReferenceNumber {
        ReferenceNumber::new("ORD-test")
    }

    #[test]
    fn ledger_effects_match_the_table() {
        let v = VariantId::new();
        let now = Utc::now();
        let rows = [
            InventoryTransaction::adjust(v, 10, reference(), now),
            InventoryTransaction::reserve(v, 4, reference(), now),
            InventoryTransaction::commit(v, 3, reference(), now),
            InventoryTransaction::release(v, 1, reference(), now),
            InventoryTransaction::reconcile(v, 7, reference(), now),
        ];

        let levels = StockLevels::from_ledger(&rows);

        assert_eq!(levels, StockLevels { on_hand: 7, reserved: 0 });
        assert_eq!(levels.available(), 7);
    }

    #[test]
    fn outstanding_ignores_terminal_lines() {
        let a = VariantId::new();
        let b = VariantId::new();
        let now = Utc::now();
        let rows = vec![
            InventoryTransaction::reserve(a, 2, reference(), now),
            InventoryTransaction::reserve(b, 5, reference(), now),
            InventoryTransaction::commit(a, 2, reference(), now),
        ];

        assert_eq!(outstanding_reservations(&rows), vec![(b, 5)]);
    }

    #[test]
    fn outstanding_is_sorted_by_variant() {
        let now = Utc::now();
        let mut ids = [VariantId::new(), VariantId::new(), VariantId::new()];
        let rows: Vec<_> = ids
            .iter()
            .map(|v| InventoryTransaction::reserve(*v, 1, reference(), now))
            .collect();
        ids.sort();

        let variants: Vec<_> = outstanding_reservations(&rows)
            .into_iter()
            .map(|(v, _)| v)
            .collect();

        assert_eq!(variants, ids.to_vec());
    }

    #[test]
    fn type_round_trips_through_storage_name() {
        for kind in [
            InventoryTransactionType::Reserve,
            InventoryTransactionType::Commit,
            InventoryTransactionType::Release,
            InventoryTransactionType::Reconcile,
            InventoryTransactionType::AdminAdjust,
        ] {
            assert_eq!(InventoryTransactionType::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(InventoryTransactionType::parse("bogus"), None);
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        fn movement() -> impl Strategy<Value = (u8, i64)> {
            (0u8..5, 1i64..50)
        }

        proptest! {
            #[test]
            fn cached_counters_track_the_ledger(moves in prop::collection::vec(movement(), 0..40)) {
                let v = VariantId::new();
                let now = Utc::now();
                let mut variant = ProductVariant::new(v, ProductId::new(), None, "SKU", now);
                let mut rows = Vec::new();
                for (kind, qty) in moves {
                    let row = match kind {
                        0 => InventoryTransaction::adjust(v, qty, reference(), now),
                        1 => InventoryTransaction::reserve(v, u32::try_from(qty).unwrap(), reference(), now),
                        2 => InventoryTransaction::commit(v, qty, reference(), now),
                        3 => InventoryTransaction::release(v, qty, reference(), now),
                        _ => InventoryTransaction::reconcile(v, qty, reference(), now),
                    };
                    variant.apply(&row);
                    rows.push(row);
                }

                prop_assert_eq!(variant.levels(), StockLevels::from_ledger(&rows));
            }
        }
    }
}
