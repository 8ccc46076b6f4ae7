//! Outbox dispatcher.
//!
//! Each poll runs three steps:
//!
//! 1. In a short transaction, lease up to `batch_size` unprocessed messages
//!    (oldest first, skipping rows another dispatcher holds) and commit the
//!    lease.
//! 2. With no transaction open, hand each message to every subscriber
//!    interested in its type, concurrently.
//! 3. In a new transaction per message, mark it processed if every
//!    subscriber accepted it, otherwise record the error, count the attempt
//!    and clear the lease.
//!
//! A dispatcher that crashes between steps leaves the lease to expire and the
//! message is delivered again, so delivery is at-least-once. Messages whose
//! attempts reach `max_attempts` are parked until [`OutboxDispatcher::requeue`]
//! resets them.

use crate::worker::{JobFuture, JobRun, PeriodicJob};
use checkout_core::environment::Clock;
use checkout_core::error::StoreError;
use checkout_core::model::OutboxMessage;
use checkout_core::store::UnitOfWork;
use checkout_core::subscriber::OutboxSubscriber;
use checkout_core::types::OutboxMessageId;
use checkout_core::unit_of_work::finish;
use futures::future::join_all;
use metrics::{counter, histogram};
use std::sync::Arc;
use std::time::Duration;

/// Dispatcher tuning.
#[derive(Debug, Clone)]
pub struct OutboxSettings {
    /// Messages claimed per poll.
    pub batch_size: u32,
    /// How long a claim stays valid.
    pub lease: Duration,
    /// Attempts after which a message is parked.
    pub max_attempts: u32,
    /// Pause between polls when the outbox is drained.
    pub poll_interval: Duration,
}

impl Default for OutboxSettings {
    fn default() -> Self {
        Self {
            batch_size: 50,
            lease: Duration::from_secs(30),
            max_attempts: 10,
            poll_interval: Duration::from_millis(500),
        }
    }
}

impl OutboxSettings {
    /// Builder starting from the defaults.
    #[must_use]
    pub fn builder() -> OutboxSettingsBuilder {
        OutboxSettingsBuilder {
            settings: Self::default(),
        }
    }
}

/// Builder for [`OutboxSettings`].
#[derive(Debug, Clone)]
pub struct OutboxSettingsBuilder {
    settings: OutboxSettings,
}

impl OutboxSettingsBuilder {
    /// Messages claimed per poll (at least 1).
    #[must_use]
    pub fn batch_size(mut self, batch_size: u32) -> Self {
        self.settings.batch_size = batch_size.max(1);
        self
    }

    /// How long a claim stays valid.
    #[must_use]
    pub const fn lease(mut self, lease: Duration) -> Self {
        self.settings.lease = lease;
        self
    }

    /// Attempts after which a message is parked (at least 1).
    #[must_use]
    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.settings.max_attempts = max_attempts.max(1);
        self
    }

    /// Pause between polls when the outbox is drained.
    #[must_use]
    pub const fn poll_interval(mut self, interval: Duration) -> Self {
        self.settings.poll_interval = interval;
        self
    }

    /// Finishes the settings.
    #[must_use]
    pub fn build(self) -> OutboxSettings {
        self.settings
    }
}

/// Outcome of one poll.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Messages leased.
    pub claimed: usize,
    /// Messages every subscriber accepted.
    pub published: usize,
    /// Messages with at least one failed delivery.
    pub failed: usize,
    /// Failed messages that reached the attempt limit.
    pub parked: usize,
}

/// Publishes committed outbox messages to subscribers.
pub struct OutboxDispatcher {
    uow: Arc<dyn UnitOfWork>,
    subscribers: Vec<Arc<dyn OutboxSubscriber>>,
    clock: Arc<dyn Clock>,
    settings: OutboxSettings,
}

impl OutboxDispatcher {
    /// Dispatcher without subscribers.
    #[must_use]
    pub fn new(uow: Arc<dyn UnitOfWork>, clock: Arc<dyn Clock>, settings: OutboxSettings) -> Self {
        Self {
            uow,
            subscribers: Vec::new(),
            clock,
            settings,
        }
    }

    /// Adds a subscriber.
    #[must_use]
    pub fn with_subscriber(mut self, subscriber: Arc<dyn OutboxSubscriber>) -> Self {
        self.subscribers.push(subscriber);
        self
    }

    /// Settings in use.
    #[must_use]
    pub const fn settings(&self) -> &OutboxSettings {
        &self.settings
    }

    /// Claims, publishes and settles one batch.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if claiming or settling fails. Messages already
    /// settled in this poll stay settled; the rest keep their lease until it
    /// expires.
    pub async fn dispatch_batch(&self) -> Result<DispatchReport, StoreError> {
        let batch = self.claim().await?;
        let mut report = DispatchReport {
            claimed: batch.len(),
            ..DispatchReport::default()
        };
        #[allow(clippy::cast_precision_loss)]
        histogram!("outbox_claimed_batch_size").record(batch.len() as f64);

        for message in batch {
            match self.deliver(&message).await {
                Ok(()) => {
                    self.settle(message.id, None).await?;
                    report.published += 1;
                    counter!("outbox_messages_published_total").increment(1);
                }
                Err(error) => {
                    self.settle(message.id, Some(error.clone())).await?;
                    report.failed += 1;
                    if message.attempts.saturating_add(1) >= self.settings.max_attempts {
                        report.parked += 1;
                        counter!("outbox_messages_parked_total").increment(1);
                        tracing::error!(
                            message_id = %message.id,
                            message_type = %message.message_type,
                            attempts = message.attempts + 1,
                            error = %error,
                            "Outbox message parked after exhausting attempts"
                        );
                    } else {
                        tracing::warn!(
                            message_id = %message.id,
                            message_type = %message.message_type,
                            attempt = message.attempts + 1,
                            error = %error,
                            "Outbox delivery failed, will retry"
                        );
                    }
                }
            }
        }

        if report.claimed > 0 {
            tracing::debug!(
                claimed = report.claimed,
                published = report.published,
                failed = report.failed,
                "Outbox batch dispatched"
            );
        }
        Ok(report)
    }

    async fn claim(&self) -> Result<Vec<OutboxMessage>, StoreError> {
        let now = self.clock.now();
        let lease = chrono::Duration::from_std(self.settings.lease)
            .unwrap_or_else(|_| chrono::Duration::seconds(30));
        let mut tx = self.uow.begin().await?;
        let claimed = tx
            .claim_outbox_batch(
                now,
                now + lease,
                self.settings.batch_size,
                self.settings.max_attempts,
            )
            .await;
        finish(tx, claimed).await
    }

    async fn deliver(&self, message: &OutboxMessage) -> Result<(), String> {
        let interested: Vec<_> = self
            .subscribers
            .iter()
            .filter(|s| s.interested_in(&message.message_type))
            .collect();
        let results = join_all(interested.iter().map(|s| s.handle(message))).await;

        let mut failures = Vec::new();
        for (subscriber, result) in interested.iter().zip(results) {
            if let Err(error) = result {
                counter!(
                    "outbox_delivery_failures_total",
                    "subscriber" => subscriber.name().to_string()
                )
                .increment(1);
                failures.push(format!("{}: {error}", subscriber.name()));
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(failures.join("; "))
        }
    }

    async fn settle(&self, id: OutboxMessageId, error: Option<String>) -> Result<(), StoreError> {
        let mut tx = self.uow.begin().await?;
        let result = match error {
            None => tx.mark_outbox_processed(id, self.clock.now()).await,
            Some(error) => tx.mark_outbox_failed(id, error).await,
        };
        finish(tx, result).await
    }

    /// Makes a parked or failing message eligible again.
    ///
    /// Returns `false` if the message was already processed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::RowNotFound`] for an unknown id, or the store
    /// error if the update fails.
    pub async fn requeue(&self, id: OutboxMessageId) -> Result<bool, StoreError> {
        let mut tx = self.uow.begin().await?;
        let result = tx.requeue_outbox_message(id).await;
        let requeued = finish(tx, result).await?;
        if requeued {
            tracing::info!(message_id = %id, "Outbox message requeued");
        }
        Ok(requeued)
    }
}

impl PeriodicJob for OutboxDispatcher {
    fn name(&self) -> &str {
        "outbox-dispatcher"
    }

    fn run_once(&self) -> JobFuture<'_> {
        Box::pin(async move {
            let report = self.dispatch_batch().await?;
            Ok(JobRun {
                processed: report.claimed,
                more: report.claimed >= self.settings.batch_size as usize,
            })
        })
    }
}
