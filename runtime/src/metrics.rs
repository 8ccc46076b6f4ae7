//! Prometheus metrics.
//!
//! Services record through the `metrics` facade; [`MetricsServer`] installs
//! the Prometheus recorder and serves `/metrics`.
//!
//! | metric | kind | labels |
//! |--------|------|--------|
//! | `checkout_orders_total` | counter | `outcome` |
//! | `checkout_duration_seconds` | histogram | |
//! | `checkout_command_failures_total` | counter | `command`, `kind` |
//! | `inventory_movements_total` | counter | `kind` |
//! | `inventory_reconciliations_total` | counter | `corrected` |
//! | `discount_applications_total` | counter | `outcome` |
//! | `wallet_movements_total` | counter | `kind` |
//! | `payment_transactions_total` | counter | `status` |
//! | `payment_gateway_duration_seconds` | histogram | `gateway`, `call` |
//! | `payment_cleanup_expired_total` | counter | |
//! | `outbox_messages_published_total` | counter | |
//! | `outbox_delivery_failures_total` | counter | `subscriber` |
//! | `outbox_messages_parked_total` | counter | |
//! | `outbox_claimed_batch_size` | histogram | |
//! | `gateway_circuit_transitions_total` | counter | `breaker`, `to` |
//! | `gateway_circuit_rejections_total` | counter | `breaker` |
//! | `worker_runs_total` | counter | `job`, `outcome` |
//!
//! # Example
//!
//! ```rust,no_run
//! use checkout_runtime::metrics::MetricsServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//! # Ok(())
//! # }
//! ```

use metrics::{Unit, describe_counter, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use thiserror::Error;

pub use metrics::{counter, gauge, histogram};

/// Errors from metrics setup.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// The exporter could not be configured.
    #[error("failed to build metrics exporter: {0}")]
    Build(String),
    /// Another recorder is already installed.
    #[error("failed to install metrics recorder: {0}")]
    Install(String),
}

/// Prometheus recorder plus its HTTP listener.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Server that will listen on `addr`.
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Installs the global recorder and spawns the HTTP listener on the
    /// current tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError`] if the exporter cannot be built or a recorder
    /// is already installed.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        describe_metrics();

        let (recorder, exporter) = PrometheusBuilder::new()
            .with_http_listener(self.addr)
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?
            .build()
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        let handle = recorder.handle();
        metrics::set_global_recorder(recorder).map_err(|e| MetricsError::Install(e.to_string()))?;

        let addr = self.addr;
        tokio::spawn(async move {
            // The exporter's error type is neither Debug nor Display.
            if exporter.await.is_err() {
                tracing::error!(addr = %addr, "Metrics listener stopped");
            }
        });

        tracing::info!(addr = %self.addr, "Metrics available at http://{}/metrics", self.addr);
        self.handle = Some(handle);
        Ok(())
    }

    /// Current metrics in the Prometheus text format, once started.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Registers descriptions for every metric the engine emits.
pub fn describe_metrics() {
    describe_counter!("checkout_orders_total", "Checkout submissions by outcome");
    describe_histogram!(
        "checkout_duration_seconds",
        Unit::Seconds,
        "Time spent placing an order"
    );
    describe_counter!(
        "checkout_command_failures_total",
        "Commands that rolled back, by command and error kind"
    );

    describe_counter!("inventory_movements_total", "Stock ledger rows written, by kind");
    describe_counter!(
        "inventory_reconciliations_total",
        "Reconciliation runs, by whether a correction was made"
    );

    describe_counter!("discount_applications_total", "Discount code applications by outcome");
    describe_counter!("wallet_movements_total", "Wallet holds and ledger movements, by kind");

    describe_counter!(
        "payment_transactions_total",
        "Payment transactions reaching a status"
    );
    describe_histogram!(
        "payment_gateway_duration_seconds",
        Unit::Seconds,
        "Latency of payment gateway calls"
    );
    describe_counter!(
        "payment_cleanup_expired_total",
        "Abandoned payments failed by the cleanup job"
    );

    describe_counter!(
        "outbox_messages_published_total",
        "Outbox messages accepted by every subscriber"
    );
    describe_counter!(
        "outbox_delivery_failures_total",
        "Failed deliveries, by subscriber"
    );
    describe_counter!(
        "outbox_messages_parked_total",
        "Outbox messages that exhausted their attempts"
    );
    describe_histogram!("outbox_claimed_batch_size", "Messages claimed per poll");

    describe_counter!(
        "gateway_circuit_transitions_total",
        "Circuit breaker state changes"
    );
    describe_counter!(
        "gateway_circuit_rejections_total",
        "Calls rejected by an open circuit breaker"
    );

    describe_counter!("worker_runs_total", "Periodic job runs by outcome");
}
