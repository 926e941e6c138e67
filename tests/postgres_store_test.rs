mod common;

use chrono::{Duration, TimeZone, Utc};
use diesel::prelude::*;
use serial_test::serial;
use uuid::Uuid;

use common::TestDatabase;
use common::fixtures::{WEBHOOK_SECRET, checkout_completed_event, payment_intent_event, signed};
use videohub::notifications::NotificationQueue;
use videohub::payments::PaymentStatus;
use videohub::reconciliation::ReconciliationEngine;
use videohub::schema::users;
use videohub::store::Stores;
use videohub::subscriptions::DAYS_PER_MONTH;
use videohub::webhook_signature::DEFAULT_TOLERANCE_SECS;
use videohub::{PgPool, WebhookOutcome};

fn now() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
}

async fn insert_user(pool: &PgPool, username: &str) -> Uuid {
    let pool = pool.clone();
    let username = username.to_string();
    tokio::task::spawn_blocking(move || {
        let mut conn = pool.get().unwrap();
        diesel::insert_into(users::table)
            .values((
                users::username.eq(&username),
                users::email.eq(format!("{}@example.com", username)),
            ))
            .returning(users::id)
            .get_result::<Uuid>(&mut conn)
            .unwrap()
    })
    .await
    .unwrap()
}

#[tokio::test]
#[ignore] // Requires PostgreSQL
#[serial]
async fn test_postgres_reconciliation_activates_exactly_once() {
    let db = TestDatabase::new().await.unwrap();
    let pool = db.pool();
    let user_id = insert_user(&pool, "alice").await;

    let stores = Stores::postgres(pool.clone());
    let (queue, notifications) = NotificationQueue::new();
    let engine =
        ReconciliationEngine::new(stores.clone(), queue, WEBHOOK_SECRET, DEFAULT_TOLERANCE_SECS);

    let checkout = checkout_completed_event("evt_cs", "cs_1", "pi_1", user_id, 1, true);
    let succeeded = payment_intent_event("evt_pi", "payment_intent.succeeded", "pi_1");
    let (checkout_body, checkout_sig) = signed(&checkout, now());
    let (succeeded_body, succeeded_sig) = signed(&succeeded, now());

    let engine_a = engine.clone();
    let engine_b = engine.clone();
    let (a, b) = tokio::join!(
        async move {
            engine_a
                .handle_webhook_at(&checkout_body, Some(&checkout_sig), now())
                .await
        },
        async move {
            engine_b
                .handle_webhook_at(&succeeded_body, Some(&succeeded_sig), now())
                .await
        },
    );
    a.unwrap();
    b.unwrap();

    let payment = stores
        .payments
        .get_by_payment_intent_id("pi_1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(payment.status, PaymentStatus::Succeeded);

    let subscription = stores.subscriptions.get_by_user(user_id).await.unwrap().unwrap();
    assert_eq!(
        subscription.end_date,
        now() + Duration::days(DAYS_PER_MONTH)
    );
    assert_eq!(notifications.drain().count(), 1);
}

#[tokio::test]
#[ignore] // Requires PostgreSQL
#[serial]
async fn test_postgres_replay_is_duplicate() {
    let db = TestDatabase::new().await.unwrap();
    let pool = db.pool();
    let user_id = insert_user(&pool, "bob").await;

    let stores = Stores::postgres(pool);
    let (queue, _notifications) = NotificationQueue::new();
    let engine =
        ReconciliationEngine::new(stores.clone(), queue, WEBHOOK_SECRET, DEFAULT_TOLERANCE_SECS);

    let event = checkout_completed_event("evt_1", "cs_1", "pi_1", user_id, 2, true);
    let (body, sig) = signed(&event, now());

    assert_eq!(
        engine.handle_webhook_at(&body, Some(&sig), now()).await.unwrap(),
        WebhookOutcome::Processed
    );
    assert_eq!(
        engine.handle_webhook_at(&body, Some(&sig), now()).await.unwrap(),
        WebhookOutcome::Duplicate
    );

    let record = stores
        .webhook_events
        .get_by_stripe_event_id("evt_1")
        .await
        .unwrap()
        .unwrap();
    assert!(record.processed);
    assert_eq!(record.attempts, 1);

    let subscription = stores.subscriptions.get_by_user(user_id).await.unwrap().unwrap();
    assert_eq!(
        subscription.end_date,
        now() + Duration::days(2 * DAYS_PER_MONTH)
    );
}

#[tokio::test]
#[ignore] // Requires PostgreSQL
#[serial]
async fn test_postgres_watch_time_accumulates_per_day() {
    let db = TestDatabase::new().await.unwrap();
    let pool = db.pool();
    let user_id = insert_user(&pool, "carol").await;
    let stores = Stores::postgres(pool);
    let today = now().date_naive();

    let row = stores.watch_limits.get_or_create(user_id, today).await.unwrap();
    assert_eq!(row.watched_seconds, 0);

    stores
        .watch_limits
        .add_watch_time(user_id, today, 3000)
        .await
        .unwrap();
    let row = stores
        .watch_limits
        .add_watch_time(user_id, today, 900)
        .await
        .unwrap();
    assert_eq!(row.watched_seconds, 3900);

    stores
        .watch_limits
        .add_watch_time(user_id, today - Duration::days(40), 60)
        .await
        .unwrap();
    let deleted = stores
        .watch_limits
        .delete_before(today - Duration::days(30))
        .await
        .unwrap();
    assert_eq!(deleted, 1);
}

#[tokio::test]
#[ignore] // Requires PostgreSQL
#[serial]
async fn test_postgres_watch_time_overflow_is_an_error() {
    let db = TestDatabase::new().await.unwrap();
    let pool = db.pool();
    let user_id = insert_user(&pool, "erin").await;
    let stores = Stores::postgres(pool);
    let today = now().date_naive();

    stores
        .watch_limits
        .add_watch_time(user_id, today, i32::MAX - 10)
        .await
        .unwrap();
    assert!(
        stores
            .watch_limits
            .add_watch_time(user_id, today, 11)
            .await
            .is_err()
    );

    let row = stores.watch_limits.get_or_create(user_id, today).await.unwrap();
    assert_eq!(row.watched_seconds, i32::MAX - 10);
}

#[tokio::test]
#[ignore] // Requires PostgreSQL
#[serial]
async fn test_postgres_stale_pending_purge() {
    let db = TestDatabase::new().await.unwrap();
    let pool = db.pool();
    let user_id = insert_user(&pool, "dave").await;
    let stores = Stores::postgres(pool.clone());

    let (queue, _notifications) = NotificationQueue::new();
    let engine =
        ReconciliationEngine::new(stores.clone(), queue, WEBHOOK_SECRET, DEFAULT_TOLERANCE_SECS);
    // An unpaid checkout leaves a processing record, which the purge keeps
    let event = checkout_completed_event("evt_1", "cs_1", "pi_1", user_id, 1, false);
    let (body, sig) = signed(&event, now());
    engine.handle_webhook_at(&body, Some(&sig), now()).await.unwrap();

    let deleted = stores
        .payments
        .delete_stale_pending(Utc::now() + Duration::days(2))
        .await
        .unwrap();
    assert_eq!(deleted, 0);
    assert!(
        stores
            .payments
            .get_by_payment_intent_id("pi_1")
            .await
            .unwrap()
            .is_some()
    );
}
