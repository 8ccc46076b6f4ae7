//! # Checkout Testing
//!
//! Test doubles for the checkout engine:
//!
//! - [`InMemoryStore`]: a [`UnitOfWork`](checkout_core::UnitOfWork) with the
//!   locking and visibility rules of the Postgres backend
//! - [`FixedClock`] / [`MockClock`]: deterministic time
//! - [`ScriptedGateway`]: payment gateway with queued answers
//! - [`RecordingSubscriber`] / [`FlakySubscriber`]: outbox consumers
//! - [`fixtures`]: builders and seeding helpers
//! - [`properties`]: `proptest` strategies
//!
//! ## Example
//!
//! ```
//! use checkout_testing::{InMemoryStore, fixtures};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), checkout_core::StoreError> {
//! let store = InMemoryStore::new();
//! let variant = fixtures::seed_variant(&store, fixtures::variant("SKU-1"), 10).await?;
//!
//! assert_eq!(store.ledger_levels(variant.id).on_hand, 10);
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod fixtures;
pub mod gateway;
pub mod properties;
pub mod store;
pub mod subscriber;

pub use clock::{FixedClock, MockClock, epoch, mock_clock, test_clock};
pub use gateway::ScriptedGateway;
pub use store::{InMemoryStore, InMemoryTransaction};
pub use subscriber::{FlakySubscriber, RecordingSubscriber};
