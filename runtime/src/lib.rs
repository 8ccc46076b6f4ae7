//! # Checkout Runtime
//!
//! Everything that runs around the checkout engine rather than inside a
//! command:
//!
//! - **Outbox dispatcher**: drains committed outbox rows to subscribers
//! - **Gateways**: Zarinpal over HTTP, an in-process sandbox, and a
//!   circuit-breaking wrapper
//! - **Subscribers**: webhook delivery for search, cache and notifications
//! - **Resilience**: retry with backoff, circuit breaker
//! - **Workers**: periodic jobs with graceful shutdown
//! - **Metrics**: Prometheus exporter
//!
//! ## Example
//!
//! ```ignore
//! use checkout_runtime::outbox::{OutboxDispatcher, OutboxSettings};
//! use checkout_runtime::worker::PeriodicWorker;
//!
//! let settings = OutboxSettings::builder().batch_size(100).build();
//! let interval = settings.poll_interval;
//! let dispatcher = OutboxDispatcher::new(store, clock, settings)
//!     .with_subscriber(search_index);
//!
//! let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
//! let handle = PeriodicWorker::new(Arc::new(dispatcher), interval, shutdown_rx).spawn();
//! ```

/// Circuit breaker for external calls
pub mod circuit_breaker;

/// Payment gateway implementations
pub mod gateway;

/// Prometheus metrics
pub mod metrics;

/// Transactional outbox publisher
pub mod outbox;

/// Retry with exponential backoff
pub mod retry;

/// Webhook subscribers
pub mod subscribers;

/// Periodic background jobs
pub mod worker;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitError};
pub use gateway::{GuardedGateway, SandboxGateway, ZarinpalConfig, ZarinpalGateway};
pub use outbox::{DispatchReport, OutboxDispatcher, OutboxSettings};
pub use retry::{RetryPolicy, retry_with_backoff, retry_with_predicate};
pub use subscribers::HttpSubscriber;
pub use worker::{JobError, JobFuture, JobRun, PeriodicJob, PeriodicWorker};
