//! # Checkout Engine
//!
//! The services that move stock and money for a checkout:
//!
//! - [`inventory`]: reserve, commit, release and reconcile stock through the
//!   ledger
//! - [`discount`]: redeem discount codes under a row lock
//! - [`wallet`]: hold, debit and credit customer wallets
//! - [`payment`]: request, verify and settle gateway payments
//! - [`checkout`]: turn a cart into an order in one transaction
//! - [`cleanup`]: expire abandoned payments in the background
//!
//! Every command opens a transaction from a
//! [`UnitOfWork`](checkout_core::UnitOfWork), commits on success and rolls
//! back on any error. The `*_in` functions run against a caller's transaction
//! so checkout and payment settlement can compose them.
//!
//! ## Example
//!
//! ```ignore
//! use checkout_engine::{CartLine, CheckoutService, CheckoutSettings, PlaceOrder};
//!
//! let checkout = CheckoutService::new(store, clock, gateways, CheckoutSettings::default());
//! let outcome = checkout
//!     .place_order(&ctx, PlaceOrder {
//!         idempotency_key: "cart-7f3a".into(),
//!         lines: vec![CartLine { variant_id, quantity: 2, unit_price }],
//!         discount_code: Some("SPRING10".into()),
//!         wallet_amount: None,
//!         contact: None,
//!     })
//!     .await?;
//! ```

use checkout_core::error::CheckoutError;
use metrics::counter;

pub mod checkout;
pub mod cleanup;
pub mod discount;
pub mod inventory;
pub mod payment;
pub mod settings;
pub mod wallet;

pub use checkout::{CartLine, CheckoutOutcome, CheckoutService, PlaceOrder};
pub use cleanup::PaymentCleanupJob;
pub use discount::{ApplyDiscount, DiscountService};
pub use inventory::{InventoryService, ReserveStock};
pub use payment::PaymentService;
pub use settings::{CheckoutSettings, CheckoutSettingsBuilder};
pub use wallet::WalletService;

/// Logs and counts a failed command.
pub(crate) fn observe<T>(command: &'static str, result: &Result<T, CheckoutError>) {
    let Err(error) = result else {
        return;
    };
    counter!("checkout_command_failures_total", "command" => command, "kind" => error.kind())
        .increment(1);
    match error {
        CheckoutError::Fatal(_) => tracing::error!(command, error = %error, "Command failed"),
        CheckoutError::Gateway(_) => tracing::warn!(command, error = %error, "Gateway call failed"),
        CheckoutError::NotFound { .. }
        | CheckoutError::ConcurrencyConflict { .. }
        | CheckoutError::BusinessRule(_) => {
            tracing::warn!(command, error = %error, "Command rejected");
        }
    }
}
