mod common;

use chrono::{Duration, Utc};
use std::sync::Arc;

use common::fixtures::{FakeNotifier, Harness, checkout_completed_event};
use videohub::notifications::{NotificationTask, NotificationWorker, RetryPolicy};

fn quick_retries() -> RetryPolicy {
    RetryPolicy {
        max_retries: 2,
        delay: std::time::Duration::ZERO,
    }
}

#[tokio::test]
async fn test_worker_delivers_confirmation_for_activated_payment() {
    let harness = Harness::new();
    let alice = harness.add_user("alice").await;
    let event = checkout_completed_event("evt_1", "cs_1", "pi_1", alice.id, 1, true);
    harness.deliver(&event, Utc::now()).await.unwrap();

    let notifier = Arc::new(FakeNotifier::default());
    let worker = NotificationWorker::new(harness.stores.clone(), notifier.clone(), quick_retries());

    let tasks = harness.queued_notifications();
    assert_eq!(tasks.len(), 1);
    for task in tasks {
        worker.handle(task).await;
    }

    let payment = harness
        .stores
        .payments
        .get_by_payment_intent_id("pi_1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        *notifier.confirmations.lock().unwrap(),
        vec![(alice.id, payment.id)]
    );
}

#[tokio::test]
async fn test_failed_delivery_is_retried_then_dropped() {
    let harness = Harness::new();
    let alice = harness.add_user("alice").await;
    let event = checkout_completed_event("evt_1", "cs_1", "pi_1", alice.id, 1, true);
    harness.deliver(&event, Utc::now()).await.unwrap();

    let notifier = Arc::new(FakeNotifier::default());
    notifier.fail_for(alice.id);
    let worker = NotificationWorker::new(harness.stores.clone(), notifier.clone(), quick_retries());

    for task in harness.queued_notifications() {
        worker.handle(task).await;
    }

    assert_eq!(*notifier.attempts.lock().unwrap(), 3);
    assert!(notifier.confirmations.lock().unwrap().is_empty());

    // The entitlement is unaffected by the notification failure
    let subscription = harness
        .stores
        .subscriptions
        .get_by_user(alice.id)
        .await
        .unwrap()
        .unwrap();
    assert!(subscription.grants_access_at(Utc::now() + Duration::days(1)));
}

#[tokio::test]
async fn test_task_for_missing_records_is_skipped() {
    let harness = Harness::new();
    let notifier = Arc::new(FakeNotifier::default());
    let worker = NotificationWorker::new(harness.stores.clone(), notifier.clone(), quick_retries());

    worker
        .process(&NotificationTask::SubscriptionConfirmation {
            user_id: uuid::Uuid::now_v7(),
            payment_id: uuid::Uuid::now_v7(),
        })
        .await
        .unwrap();

    assert_eq!(*notifier.attempts.lock().unwrap(), 0);
}

#[tokio::test]
async fn test_spawned_workers_drain_the_queue_and_stop() {
    let harness = Harness::new();
    let alice = harness.add_user("alice").await;
    let bob = harness.add_user("bob").await;
    let now = Utc::now();
    harness
        .deliver(
            &checkout_completed_event("evt_a", "cs_a", "pi_a", alice.id, 1, true),
            now,
        )
        .await
        .unwrap();
    harness
        .deliver(
            &checkout_completed_event("evt_b", "cs_b", "pi_b", bob.id, 3, true),
            now,
        )
        .await
        .unwrap();

    let notifier = Arc::new(FakeNotifier::default());
    let worker = NotificationWorker::new(harness.stores.clone(), notifier.clone(), quick_retries());

    // Hand the queued tasks to a fresh channel whose sender we can drop
    let (tx, rx) = flume::unbounded();
    for task in harness.queued_notifications() {
        tx.send(task).unwrap();
    }
    drop(tx);

    for handle in worker.spawn(rx, 2) {
        handle.await.unwrap();
    }

    let mut notified: Vec<_> = notifier
        .confirmations
        .lock()
        .unwrap()
        .iter()
        .map(|(user_id, _)| *user_id)
        .collect();
    notified.sort();
    let mut expected = vec![alice.id, bob.id];
    expected.sort();
    assert_eq!(notified, expected);
}
