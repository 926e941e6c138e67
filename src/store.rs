//! Persistence seams for the billing core.
//!
//! Every store has a PostgreSQL implementation (the `*_repo` modules) and an
//! in-memory one ([`crate::memory_store::MemoryStore`]) used by tests and local
//! development. Services only ever see `Arc<dyn ...>` handles bundled in
//! [`Stores`].

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use std::sync::Arc;
use uuid::Uuid;

use crate::payments::{CompletionOutcome, NewPayment, Payment, StatusChange};
use crate::stripe_customers::{NewStripeCustomer, StripeCustomer};
use crate::stripe_webhooks::{ClaimOutcome, NewStripeWebhookEvent, StripeWebhookEvent};
use crate::subscriptions::Subscription;
use crate::users::User;
use crate::watch_limits::DailyWatchLimit;
use crate::web::PgPool;

/// Payment records keyed by gateway payment-intent id
#[async_trait]
pub trait PaymentStore: Send + Sync {
    async fn get_by_payment_intent_id(&self, payment_intent_id: &str) -> Result<Option<Payment>>;

    async fn get_by_id(&self, id: Uuid) -> Result<Option<Payment>>;

    /// Payment history for a user, newest first
    async fn list_by_user(&self, user_id: Uuid) -> Result<Vec<Payment>>;

    /// Insert unless a record for the payment intent already exists.
    ///
    /// Returns the stored record and whether this call created it.
    async fn insert_if_absent(&self, new_payment: NewPayment) -> Result<(Payment, bool)>;

    /// Attach the checkout session id and promote `pending` to `processing`.
    /// Later statuses are left alone.
    async fn attach_checkout_session(
        &self,
        payment_intent_id: &str,
        checkout_session_id: &str,
    ) -> Result<StatusChange>;

    /// Move the payment into `succeeded` and apply the purchased entitlement
    /// atomically. Concurrent calls for the same payment intent are
    /// serialized so the entitlement is applied exactly once.
    async fn complete_payment(
        &self,
        payment_intent_id: &str,
        now: DateTime<Utc>,
    ) -> Result<CompletionOutcome>;

    /// Move an open payment into `failed`
    async fn fail_payment(&self, payment_intent_id: &str) -> Result<StatusChange>;

    /// Mark the payment refunded regardless of its current status
    async fn refund_payment(&self, payment_intent_id: &str) -> Result<StatusChange>;

    /// Delete `pending` payments created before `cutoff`
    async fn delete_stale_pending(&self, cutoff: DateTime<Utc>) -> Result<usize>;
}

/// Durable log of inbound gateway notifications
#[async_trait]
pub trait WebhookEventStore: Send + Sync {
    /// Record the event, or re-claim a failed or abandoned earlier delivery
    async fn claim(&self, new_event: NewStripeWebhookEvent, now: DateTime<Utc>)
    -> Result<ClaimOutcome>;

    async fn mark_processed(&self, stripe_event_id: &str, now: DateTime<Utc>) -> Result<()>;

    async fn mark_failed(&self, stripe_event_id: &str, error: &str, now: DateTime<Utc>)
    -> Result<()>;

    async fn get_by_stripe_event_id(&self, stripe_event_id: &str)
    -> Result<Option<StripeWebhookEvent>>;
}

/// Per-user entitlement records
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn get_by_user(&self, user_id: Uuid) -> Result<Option<Subscription>>;

    /// Deactivate every active subscription whose end date is before `now`
    async fn deactivate_expired(&self, now: DateTime<Utc>) -> Result<usize>;

    /// Active subscriptions whose end date lies in `[from, to)`
    async fn active_ending_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Subscription>>;
}

/// Per-user, per-day watch-time counters
#[async_trait]
pub trait WatchLimitStore: Send + Sync {
    /// Today's row for the user, created with zero seconds if missing
    async fn get_or_create(&self, user_id: Uuid, date: NaiveDate) -> Result<DailyWatchLimit>;

    /// Add seconds to the day's counter, creating the row if needed
    async fn add_watch_time(
        &self,
        user_id: Uuid,
        date: NaiveDate,
        seconds: i32,
    ) -> Result<DailyWatchLimit>;

    /// Delete rows dated strictly before `date`
    async fn delete_before(&self, date: NaiveDate) -> Result<usize>;
}

/// Read-only view of the user directory
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn get_user(&self, user_id: Uuid) -> Result<Option<User>>;
}

/// User to gateway customer mapping
#[async_trait]
pub trait CustomerStore: Send + Sync {
    async fn get_by_user_id(&self, user_id: Uuid) -> Result<Option<StripeCustomer>>;

    /// Store a mapping, keeping the existing one if another request won the race
    async fn create(&self, new_customer: NewStripeCustomer) -> Result<StripeCustomer>;
}

/// Store handles shared by every service
#[derive(Clone)]
pub struct Stores {
    pub payments: Arc<dyn PaymentStore>,
    pub webhook_events: Arc<dyn WebhookEventStore>,
    pub subscriptions: Arc<dyn SubscriptionStore>,
    pub watch_limits: Arc<dyn WatchLimitStore>,
    pub users: Arc<dyn UserDirectory>,
    pub customers: Arc<dyn CustomerStore>,
}

impl Stores {
    pub fn postgres(pool: PgPool) -> Self {
        use crate::payments_repo::PaymentsRepository;
        use crate::stripe_customers_repo::StripeCustomersRepository;
        use crate::stripe_webhooks_repo::StripeWebhooksRepository;
        use crate::subscriptions_repo::SubscriptionsRepository;
        use crate::users_repo::UsersRepository;
        use crate::watch_limits_repo::WatchLimitsRepository;

        Self {
            payments: Arc::new(PaymentsRepository::new(pool.clone())),
            webhook_events: Arc::new(StripeWebhooksRepository::new(pool.clone())),
            subscriptions: Arc::new(SubscriptionsRepository::new(pool.clone())),
            watch_limits: Arc::new(WatchLimitsRepository::new(pool.clone())),
            users: Arc::new(UsersRepository::new(pool.clone())),
            customers: Arc::new(StripeCustomersRepository::new(pool)),
        }
    }

    /// All stores backed by one shared in-memory state
    pub fn in_memory(store: Arc<crate::memory_store::MemoryStore>) -> Self {
        Self {
            payments: store.clone(),
            webhook_events: store.clone(),
            subscriptions: store.clone(),
            watch_limits: store.clone(),
            users: store.clone(),
            customers: store,
        }
    }
}
