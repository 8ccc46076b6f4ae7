//! Persistent records of the checkout engine.
//!
//! Aggregates reference each other by id only. Mutable aggregates carry a
//! [`RowVersion`](crate::types::RowVersion) and composed audit fields;
//! ledgers and outbox rows are append-only.

pub mod discount;
pub mod inventory;
pub mod order;
pub mod outbox;
pub mod payment;
pub mod wallet;

pub use discount::{
    DiscountApplication, DiscountCode, DiscountKind, DiscountLine, DiscountRestrictions,
    DiscountScope, DiscountUsage, DiscountUsageStatus, normalize_code,
};
pub use inventory::{
    InventoryTransaction, InventoryTransactionType, ProductVariant, StockLevels,
    outstanding_reservations,
};
pub use order::{Order, OrderItem, OrderStatus};
pub use outbox::OutboxMessage;
pub use payment::{CallbackStatus, PaymentStatus, PaymentTransaction};
pub use wallet::{
    WalletLedgerEntry, WalletReferenceType, WalletReservation, WalletReservationStatus,
    balance_of,
};
