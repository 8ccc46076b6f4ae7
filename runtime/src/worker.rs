//! Background loops.
//!
//! A [`PeriodicJob`] does one bounded unit of work per call (one outbox batch,
//! one page of abandoned payments). [`PeriodicWorker`] calls it on an interval
//! until the shutdown channel flips to `true`. A failed run is logged and the
//! loop keeps going; when a run reports a full batch the worker polls again
//! immediately instead of sleeping.

use checkout_core::error::{CheckoutError, StoreError};
use metrics::counter;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Failure of one job run.
#[derive(Error, Debug)]
pub enum JobError {
    /// Persistence failed.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// A command failed.
    #[error(transparent)]
    Checkout(#[from] CheckoutError),
}

/// What one run did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobRun {
    /// Items handled.
    pub processed: usize,
    /// Whether more work is probably waiting.
    pub more: bool,
}

/// Boxed future returned by [`PeriodicJob::run_once`].
pub type JobFuture<'a> = Pin<Box<dyn Future<Output = Result<JobRun, JobError>> + Send + 'a>>;

/// A unit of recurring background work.
pub trait PeriodicJob: Send + Sync {
    /// Name used in logs and metrics.
    fn name(&self) -> &str;

    /// Does one bounded batch of work.
    ///
    /// # Errors
    ///
    /// Returns [`JobError`] if the batch could not be completed; the worker
    /// logs it and tries again on the next tick.
    fn run_once(&self) -> JobFuture<'_>;
}

/// Runs a [`PeriodicJob`] until shutdown.
pub struct PeriodicWorker {
    job: Arc<dyn PeriodicJob>,
    interval: Duration,
    shutdown: watch::Receiver<bool>,
}

impl PeriodicWorker {
    /// Worker polling every `interval` until `shutdown` becomes `true`.
    #[must_use]
    pub fn new(
        job: Arc<dyn PeriodicJob>,
        interval: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            job,
            interval,
            shutdown,
        }
    }

    /// Spawns the loop on the current runtime.
    #[must_use]
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Runs the loop on the calling task.
    pub async fn run(mut self) {
        let name = self.job.name().to_string();
        tracing::info!(job = %name, interval_ms = u64::try_from(self.interval.as_millis()).unwrap_or(u64::MAX), "Worker started");

        while !*self.shutdown.borrow() {
            let more = match self.job.run_once().await {
                Ok(run) => {
                    counter!("worker_runs_total", "job" => name.clone(), "outcome" => "ok")
                        .increment(1);
                    if run.processed > 0 {
                        tracing::debug!(job = %name, processed = run.processed, "Worker run finished");
                    }
                    run.more
                }
                Err(error) => {
                    counter!("worker_runs_total", "job" => name.clone(), "outcome" => "error")
                        .increment(1);
                    tracing::error!(job = %name, error = %error, "Worker run failed");
                    false
                }
            };

            if more {
                tokio::task::yield_now().await;
                continue;
            }

            tokio::select! {
                () = tokio::time::sleep(self.interval) => {}
                changed = self.shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        tracing::info!(job = %name, "Worker stopped");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        runs: AtomicUsize,
        fail_first: bool,
    }

    impl PeriodicJob for Counting {
        fn name(&self) -> &str {
            "counting"
        }

        fn run_once(&self) -> JobFuture<'_> {
            Box::pin(async move {
                let n = self.runs.fetch_add(1, Ordering::SeqCst);
                if self.fail_first && n == 0 {
                    return Err(JobError::Store(StoreError::Database("down".into())));
                }
                Ok(JobRun {
                    processed: 1,
                    more: false,
                })
            })
        }
    }

    #[tokio::test]
    async fn keeps_running_after_a_failed_run_and_stops_on_shutdown() {
        let job = Arc::new(Counting {
            runs: AtomicUsize::new(0),
            fail_first: true,
        });
        let (tx, rx) = watch::channel(false);
        let handle = PeriodicWorker::new(job.clone(), Duration::from_millis(5), rx).spawn();

        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();

        assert!(job.runs.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn does_not_run_when_already_shut_down() {
        let job = Arc::new(Counting {
            runs: AtomicUsize::new(0),
            fail_first: false,
        });
        let (_tx, rx) = watch::channel(true);

        PeriodicWorker::new(job.clone(), Duration::from_millis(5), rx)
            .run()
            .await;

        assert_eq!(job.runs.load(Ordering::SeqCst), 0);
    }
}
