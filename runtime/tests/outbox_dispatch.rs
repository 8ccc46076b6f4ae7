//! Outbox dispatcher behaviour against the in-memory store.

#![allow(clippy::unwrap_used)]

use checkout_core::environment::Clock;
use checkout_core::model::OutboxMessage;
use checkout_core::store::{OutboxRepository, Transaction, UnitOfWork};
use checkout_runtime::outbox::{DispatchReport, OutboxDispatcher, OutboxSettings};
use checkout_runtime::worker::PeriodicWorker;
use checkout_testing::{FlakySubscriber, InMemoryStore, MockClock, RecordingSubscriber, epoch, fixtures, mock_clock};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_test::assert_ok;

async fn seed(store: &InMemoryStore, messages: &[OutboxMessage]) {
    let mut tx = store.begin().await.unwrap();
    for message in messages {
        tx.append_outbox_message(message.clone()).await.unwrap();
    }
    tx.commit().await.unwrap();
}

fn dispatcher(store: &InMemoryStore, clock: &MockClock, settings: OutboxSettings) -> OutboxDispatcher {
    OutboxDispatcher::new(Arc::new(store.clone()), Arc::new(clock.clone()), settings)
}

#[tokio::test]
async fn publishes_in_occurrence_order_and_marks_processed() {
    let store = InMemoryStore::new();
    let clock = mock_clock();
    let mut messages = fixtures::outbox_messages(3, epoch());
    messages.reverse();
    seed(&store, &messages).await;

    let recorder = RecordingSubscriber::new("search");
    let dispatcher = dispatcher(&store, &clock, OutboxSettings::default())
        .with_subscriber(Arc::new(recorder.clone()));

    let report = assert_ok!(dispatcher.dispatch_batch().await);

    assert_eq!(
        report,
        DispatchReport {
            claimed: 3,
            published: 3,
            failed: 0,
            parked: 0
        }
    );
    let received: Vec<_> = recorder.received().iter().map(|m| m.occurred_at).collect();
    let mut sorted = received.clone();
    sorted.sort();
    assert_eq!(received, sorted);
    assert!(store.outbox_messages().iter().all(|m| m.processed_at.is_some()));

    let again = assert_ok!(dispatcher.dispatch_batch().await);
    assert_eq!(again.claimed, 0);
    assert_eq!(recorder.received().len(), 3);
}

#[tokio::test]
async fn row_stays_unprocessed_until_every_subscriber_succeeds() {
    let store = InMemoryStore::new();
    let clock = mock_clock();
    seed(&store, &fixtures::outbox_messages(1, epoch())).await;

    let healthy = RecordingSubscriber::new("cache");
    let flaky = FlakySubscriber::failing("notifications", 2);
    let dispatcher = dispatcher(&store, &clock, OutboxSettings::default())
        .with_subscriber(Arc::new(healthy.clone()))
        .with_subscriber(Arc::new(flaky.clone()));

    for attempt in 1..=2 {
        let report = assert_ok!(dispatcher.dispatch_batch().await);
        assert_eq!(report.failed, 1);

        let row = &store.outbox_messages()[0];
        assert!(row.processed_at.is_none());
        assert_eq!(row.attempts, attempt);
        assert!(row.error.as_deref().unwrap().starts_with("notifications:"));
        assert!(row.locked_until.is_none());
    }

    let report = assert_ok!(dispatcher.dispatch_batch().await);
    assert_eq!(report.published, 1);
    assert!(store.outbox_messages()[0].processed_at.is_some());
    assert_eq!(flaky.calls(), 3);
    // At-least-once: the healthy subscriber saw every attempt.
    assert_eq!(healthy.received().len(), 3);
}

#[tokio::test]
async fn uninterested_subscribers_do_not_block_processing() {
    let store = InMemoryStore::new();
    let clock = mock_clock();
    seed(&store, &fixtures::outbox_messages(1, epoch())).await;

    let stock_only = RecordingSubscriber::new("search").only(&["StockCommitted.v1"]);
    let dispatcher = dispatcher(&store, &clock, OutboxSettings::default())
        .with_subscriber(Arc::new(stock_only.clone()));

    let report = assert_ok!(dispatcher.dispatch_batch().await);

    assert_eq!(report.published, 1);
    assert!(stock_only.received().is_empty());
}

#[tokio::test]
async fn exhausted_rows_are_parked_until_requeued() {
    let store = InMemoryStore::new();
    let clock = mock_clock();
    let messages = fixtures::outbox_messages(1, epoch());
    let id = messages[0].id;
    seed(&store, &messages).await;

    let settings = OutboxSettings::builder().max_attempts(2).build();
    let dispatcher = dispatcher(&store, &clock, settings)
        .with_subscriber(Arc::new(FlakySubscriber::failing("notifications", 2)));

    assert_eq!(assert_ok!(dispatcher.dispatch_batch().await).parked, 0);
    assert_eq!(assert_ok!(dispatcher.dispatch_batch().await).parked, 1);
    assert_eq!(assert_ok!(dispatcher.dispatch_batch().await).claimed, 0);
    assert!(store.outbox_messages()[0].is_parked(2));

    assert!(dispatcher.requeue(id).await.unwrap());

    let report = assert_ok!(dispatcher.dispatch_batch().await);
    assert_eq!(report.published, 1);
    assert!(!dispatcher.requeue(id).await.unwrap());
}

#[tokio::test]
async fn abandoned_lease_is_retried_after_it_expires() {
    let store = InMemoryStore::new();
    let clock = mock_clock();
    seed(&store, &fixtures::outbox_messages(1, epoch())).await;

    // A dispatcher claims the row and dies before settling it.
    let lease = chrono::Duration::seconds(30);
    let mut tx = store.begin().await.unwrap();
    let claimed = tx
        .claim_outbox_batch(clock.now(), clock.now() + lease, 10, 10)
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1);
    tx.commit().await.unwrap();

    let recorder = RecordingSubscriber::new("search");
    let dispatcher = dispatcher(&store, &clock, OutboxSettings::default())
        .with_subscriber(Arc::new(recorder.clone()));

    assert_eq!(assert_ok!(dispatcher.dispatch_batch().await).claimed, 0);

    clock.advance(lease + chrono::Duration::seconds(1));
    let report = assert_ok!(dispatcher.dispatch_batch().await);

    assert_eq!(report.published, 1);
    assert_eq!(recorder.received().len(), 1);
}

#[tokio::test]
async fn failed_claim_commit_leaves_rows_for_the_next_poll() {
    let store = InMemoryStore::new();
    let clock = mock_clock();
    seed(&store, &fixtures::outbox_messages(2, epoch())).await;

    let recorder = RecordingSubscriber::new("search");
    let dispatcher = dispatcher(&store, &clock, OutboxSettings::default())
        .with_subscriber(Arc::new(recorder.clone()));

    store.fail_next_commit();
    assert!(dispatcher.dispatch_batch().await.is_err());
    assert!(recorder.received().is_empty());
    assert!(
        store
            .outbox_messages()
            .iter()
            .all(|m| m.locked_until.is_none() && m.processed_at.is_none())
    );

    let report = assert_ok!(dispatcher.dispatch_batch().await);
    assert_eq!(report.published, 2);
    assert_eq!(recorder.received().len(), 2);
}

#[tokio::test]
async fn concurrent_dispatchers_split_the_backlog() {
    let store = InMemoryStore::new();
    let clock = mock_clock();
    seed(&store, &fixtures::outbox_messages(40, epoch())).await;

    let recorder = RecordingSubscriber::new("search");
    let settings = OutboxSettings::builder().batch_size(5).build();
    let first = Arc::new(
        dispatcher(&store, &clock, settings.clone()).with_subscriber(Arc::new(recorder.clone())),
    );
    let second = Arc::new(
        dispatcher(&store, &clock, settings).with_subscriber(Arc::new(recorder.clone())),
    );

    let mut handles = Vec::new();
    for dispatcher in [first, second] {
        handles.push(tokio::spawn(async move {
            loop {
                if assert_ok!(dispatcher.dispatch_batch().await).claimed == 0 {
                    break;
                }
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let ids: HashSet<_> = recorder.received().iter().map(|m| m.id).collect();
    assert_eq!(ids.len(), 40);
    assert_eq!(recorder.received().len(), 40);
    assert!(store.outbox_messages().iter().all(|m| m.processed_at.is_some()));
}

#[tokio::test]
async fn worker_drains_the_outbox_and_stops_on_shutdown() {
    let store = InMemoryStore::new();
    let clock = mock_clock();
    seed(&store, &fixtures::outbox_messages(12, epoch())).await;

    let recorder = RecordingSubscriber::new("search");
    let settings = OutboxSettings::builder()
        .batch_size(5)
        .poll_interval(Duration::from_millis(10))
        .build();
    let interval = settings.poll_interval;
    let dispatcher = dispatcher(&store, &clock, settings).with_subscriber(Arc::new(recorder.clone()));

    let (shutdown, shutdown_rx) = tokio::sync::watch::channel(false);
    let handle = PeriodicWorker::new(Arc::new(dispatcher), interval, shutdown_rx).spawn();

    tokio::time::timeout(Duration::from_secs(2), async {
        while recorder.received().len() < 12 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    shutdown.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .unwrap()
        .unwrap();
}
