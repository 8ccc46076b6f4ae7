//! `PostgreSQL` backend for the checkout consistency engine.
//!
//! [`PostgresStore`] hands out [`PgTransaction`]s that implement every
//! repository trait of `checkout-core`, so the engine services run unchanged
//! against a real database:
//!
//! - stock and order rows use optimistic `row_version` checks
//! - discount codes and payments are locked with `SELECT … FOR UPDATE`
//! - wallets are serialized per customer with `pg_advisory_xact_lock`
//! - outbox batches are claimed with `FOR UPDATE SKIP LOCKED`
//! - `orders.idempotency_key` is unique, so a duplicate checkout fails with
//!   [`StoreError::UniqueViolation`]
//!
//! # Example
//!
//! ```no_run
//! use checkout_postgres::PostgresStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = PostgresStore::connect("postgres://localhost/checkout", 10).await?;
//! store.migrate().await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]

mod rows;
mod transaction;

pub use transaction::PgTransaction;

use checkout_core::error::StoreError;
use checkout_core::store::{StoreFuture, Transaction, UnitOfWork};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use std::time::Duration;

/// Unit of work backed by a connection pool.
#[derive(Clone, Debug)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Wraps an existing pool.
    #[must_use]
    pub const fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connects a pool of at most `max_connections`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if no connection can be established.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await
            .map_err(|e| StoreError::Database(format!("Failed to connect: {e}")))?;
        Ok(Self { pool })
    }

    /// The underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Applies the bundled schema migrations.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if a migration fails.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(format!("Migration failed: {e}")))?;
        tracing::info!("Checkout schema migrations applied");
        Ok(())
    }
}

impl UnitOfWork for PostgresStore {
    fn begin(&self) -> StoreFuture<'_, Box<dyn Transaction>> {
        Box::pin(async move {
            let tx = self
                .pool
                .begin()
                .await
                .map_err(|e| StoreError::Database(format!("Failed to start transaction: {e}")))?;
            Ok(Box::new(PgTransaction::new(tx)) as Box<dyn Transaction>)
        })
    }
}
