//! # Checkout Core
//!
//! Domain types, persistence contracts and the transaction boundary of the
//! checkout consistency engine.
//!
//! The engine turns a cart into a paid order while many customers compete for
//! the same stock, the same discount codes and the same wallets. This crate
//! holds everything the services and the storage backends agree on:
//!
//! - [`types`]: identifier newtypes, [`Money`](types::Money), row versions
//! - [`model`]: variants, the stock ledger, discount codes, orders, payments,
//!   wallets and outbox rows
//! - [`event`]: the closed set of [`DomainEvent`](event::DomainEvent)s
//! - [`store`]: repository traits, [`Transaction`](store::Transaction) and
//!   [`UnitOfWork`](store::UnitOfWork)
//! - [`gateway`] and [`subscriber`]: the external collaborators
//! - [`error`]: the error taxonomy
//!
//! ## Concurrency strategy
//!
//! Stock is guarded optimistically with a row version compared on write;
//! discount codes, payments and wallets are guarded pessimistically with row
//! locks held for the transaction. No in-process lock coordinates requests.
//!
//! ## Example
//!
//! ```
//! use checkout_core::model::{InventoryTransaction, StockLevels};
//! use checkout_core::types::{ReferenceNumber, VariantId};
//! use chrono::Utc;
//!
//! let variant = VariantId::new();
//! let reference = ReferenceNumber::new("ORD-1");
//! let now = Utc::now();
//! let ledger = [
//!     InventoryTransaction::adjust(variant, 10, reference.clone(), now),
//!     InventoryTransaction::reserve(variant, 3, reference, now),
//! ];
//!
//! let levels = StockLevels::from_ledger(&ledger);
//! assert_eq!(levels.available(), 7);
//! ```

pub use chrono::{DateTime, Utc};

pub mod audit;
pub mod context;
pub mod environment;
pub mod error;
pub mod event;
pub mod gateway;
pub mod model;
pub mod store;
pub mod subscriber;
pub mod types;
pub mod unit_of_work;

pub use context::RequestContext;
pub use error::{BusinessRuleViolation, CheckoutError, DiscountRejection, StoreError};
pub use event::DomainEvent;
pub use store::{Transaction, UnitOfWork};
