//! Abandoned payment cleanup as a background job.

use crate::payment::PaymentService;
use checkout_core::context::RequestContext;
use checkout_runtime::worker::{JobFuture, JobRun, PeriodicJob};

/// Runs [`PaymentService::cleanup_abandoned_payments`] on every tick.
#[derive(Clone)]
pub struct PaymentCleanupJob {
    payments: PaymentService,
}

impl PaymentCleanupJob {
    /// Job over `payments`.
    #[must_use]
    pub const fn new(payments: PaymentService) -> Self {
        Self { payments }
    }
}

impl PeriodicJob for PaymentCleanupJob {
    fn name(&self) -> &str {
        "payment-cleanup"
    }

    fn run_once(&self) -> JobFuture<'_> {
        Box::pin(async move {
            let ctx = RequestContext::system();
            let processed = self.payments.cleanup_abandoned_payments(&ctx).await?;
            let batch = usize::try_from(self.payments.settings().cleanup_batch_size).unwrap_or(usize::MAX);
            Ok(JobRun {
                processed,
                more: processed >= batch,
            })
        })
    }
}
