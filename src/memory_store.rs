//! In-process implementation of every store trait.
//!
//! All state sits behind one async mutex, so each operation is atomic with
//! respect to every other one. Used by the integration tests and for running
//! the service without a database.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::payments::{CompletionOutcome, NewPayment, Payment, PaymentStatus, StatusChange};
use crate::store::{
    CustomerStore, PaymentStore, SubscriptionStore, UserDirectory, WatchLimitStore,
    WebhookEventStore,
};
use crate::stripe_customers::{NewStripeCustomer, StripeCustomer};
use crate::stripe_webhooks::{ClaimOutcome, NewStripeWebhookEvent, StripeWebhookEvent};
use crate::subscriptions::{Subscription, next_window};
use crate::users::User;
use crate::watch_limits::DailyWatchLimit;

#[derive(Default)]
struct State {
    users: HashMap<Uuid, User>,
    customers: HashMap<Uuid, StripeCustomer>,
    /// Keyed by payment intent id
    payments: HashMap<String, Payment>,
    /// Keyed by gateway event id
    webhook_events: HashMap<String, StripeWebhookEvent>,
    /// Keyed by user id
    subscriptions: HashMap<Uuid, Subscription>,
    watch_limits: HashMap<(Uuid, NaiveDate), DailyWatchLimit>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_user(&self, user: User) {
        self.state.lock().await.users.insert(user.id, user);
    }

    /// Store a payment as-is, replacing any record for the same payment intent
    pub async fn put_payment(&self, payment: Payment) {
        self.state
            .lock()
            .await
            .payments
            .insert(payment.stripe_payment_intent_id.clone(), payment);
    }

    /// Store a subscription as-is, replacing the user's existing one
    pub async fn put_subscription(&self, subscription: Subscription) {
        self.state
            .lock()
            .await
            .subscriptions
            .insert(subscription.user_id, subscription);
    }

    /// Store a webhook event record as-is
    pub async fn put_webhook_event(&self, event: StripeWebhookEvent) {
        self.state
            .lock()
            .await
            .webhook_events
            .insert(event.stripe_event_id.clone(), event);
    }

    pub async fn payment_count(&self) -> usize {
        self.state.lock().await.payments.len()
    }

    pub async fn subscription_count(&self) -> usize {
        self.state.lock().await.subscriptions.len()
    }

    pub async fn webhook_event_count(&self) -> usize {
        self.state.lock().await.webhook_events.len()
    }

    pub async fn watch_limit_count(&self) -> usize {
        self.state.lock().await.watch_limits.len()
    }
}

fn status_change(
    payments: &mut HashMap<String, Payment>,
    payment_intent_id: &str,
    next: PaymentStatus,
    allowed: impl Fn(PaymentStatus) -> bool,
) -> StatusChange {
    let Some(payment) = payments.get_mut(payment_intent_id) else {
        return StatusChange::NotFound;
    };

    if !allowed(payment.status) {
        return StatusChange::Unchanged(payment.clone());
    }

    payment.status = next;
    payment.updated_at = Utc::now();
    StatusChange::Changed(payment.clone())
}

#[async_trait]
impl PaymentStore for MemoryStore {
    async fn get_by_payment_intent_id(&self, payment_intent_id: &str) -> Result<Option<Payment>> {
        Ok(self.state.lock().await.payments.get(payment_intent_id).cloned())
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<Payment>> {
        let state = self.state.lock().await;
        Ok(state.payments.values().find(|p| p.id == id).cloned())
    }

    async fn list_by_user(&self, user_id: Uuid) -> Result<Vec<Payment>> {
        let state = self.state.lock().await;
        let mut payments: Vec<Payment> = state
            .payments
            .values()
            .filter(|p| p.user_id == user_id)
            .cloned()
            .collect();
        payments.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(payments)
    }

    async fn insert_if_absent(&self, new_payment: NewPayment) -> Result<(Payment, bool)> {
        let mut state = self.state.lock().await;

        if let Some(existing) = state.payments.get(&new_payment.stripe_payment_intent_id) {
            return Ok((existing.clone(), false));
        }

        let now = Utc::now();
        let payment = Payment {
            id: Uuid::now_v7(),
            user_id: new_payment.user_id,
            stripe_payment_intent_id: new_payment.stripe_payment_intent_id,
            stripe_checkout_session_id: new_payment.stripe_checkout_session_id,
            amount: new_payment.amount,
            currency: new_payment.currency,
            status: new_payment.status,
            subscription_months: new_payment.subscription_months,
            description: new_payment.description,
            metadata: new_payment.metadata,
            created_at: now,
            updated_at: now,
            completed_at: None,
        };
        state
            .payments
            .insert(payment.stripe_payment_intent_id.clone(), payment.clone());

        Ok((payment, true))
    }

    async fn attach_checkout_session(
        &self,
        payment_intent_id: &str,
        checkout_session_id: &str,
    ) -> Result<StatusChange> {
        let mut state = self.state.lock().await;
        let Some(payment) = state.payments.get_mut(payment_intent_id) else {
            return Ok(StatusChange::NotFound);
        };

        payment.stripe_checkout_session_id = Some(checkout_session_id.to_string());
        payment.updated_at = Utc::now();

        if payment.status == PaymentStatus::Pending {
            payment.status = PaymentStatus::Processing;
            Ok(StatusChange::Changed(payment.clone()))
        } else {
            Ok(StatusChange::Unchanged(payment.clone()))
        }
    }

    async fn complete_payment(
        &self,
        payment_intent_id: &str,
        now: DateTime<Utc>,
    ) -> Result<CompletionOutcome> {
        let mut state = self.state.lock().await;
        let State {
            payments,
            subscriptions,
            ..
        } = &mut *state;

        let Some(payment) = payments.get_mut(payment_intent_id) else {
            return Ok(CompletionOutcome::NotFound);
        };

        if payment.status == PaymentStatus::Succeeded {
            return Ok(CompletionOutcome::AlreadySucceeded(payment.clone()));
        }
        if !payment.status.can_transition_to(PaymentStatus::Succeeded) {
            return Ok(CompletionOutcome::Rejected(payment.clone()));
        }

        payment.status = PaymentStatus::Succeeded;
        payment.completed_at = Some(now);
        payment.updated_at = now;

        let (window, _) = next_window(
            subscriptions.get(&payment.user_id),
            payment.subscription_months,
            now,
        );
        let subscription = subscriptions
            .entry(payment.user_id)
            .and_modify(|existing| {
                existing.start_date = window.start_date;
                existing.end_date = window.end_date;
                existing.is_active = true;
                existing.updated_at = now;
            })
            .or_insert_with(|| Subscription {
                id: Uuid::now_v7(),
                user_id: payment.user_id,
                start_date: window.start_date,
                end_date: window.end_date,
                is_active: true,
                created_at: now,
                updated_at: now,
            })
            .clone();

        Ok(CompletionOutcome::Completed {
            payment: payment.clone(),
            subscription,
        })
    }

    async fn fail_payment(&self, payment_intent_id: &str) -> Result<StatusChange> {
        let mut state = self.state.lock().await;
        Ok(status_change(
            &mut state.payments,
            payment_intent_id,
            PaymentStatus::Failed,
            |status| status.can_transition_to(PaymentStatus::Failed),
        ))
    }

    async fn refund_payment(&self, payment_intent_id: &str) -> Result<StatusChange> {
        let mut state = self.state.lock().await;
        Ok(status_change(
            &mut state.payments,
            payment_intent_id,
            PaymentStatus::Refunded,
            |status| status != PaymentStatus::Refunded,
        ))
    }

    async fn delete_stale_pending(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut state = self.state.lock().await;
        let before = state.payments.len();
        state
            .payments
            .retain(|_, p| !(p.status == PaymentStatus::Pending && p.created_at < cutoff));
        Ok(before - state.payments.len())
    }
}

#[async_trait]
impl WebhookEventStore for MemoryStore {
    async fn claim(
        &self,
        new_event: NewStripeWebhookEvent,
        now: DateTime<Utc>,
    ) -> Result<ClaimOutcome> {
        let mut state = self.state.lock().await;

        if let Some(existing) = state.webhook_events.get_mut(&new_event.stripe_event_id) {
            if !existing.is_reclaimable_at(now) {
                return Ok(ClaimOutcome::Duplicate);
            }
            existing.processed = false;
            existing.processing_error = None;
            existing.attempts += 1;
            existing.claimed_at = now;
            existing.processed_at = None;
            return Ok(ClaimOutcome::Claimed(existing.clone()));
        }

        let event = StripeWebhookEvent {
            id: Uuid::now_v7(),
            stripe_event_id: new_event.stripe_event_id,
            event_type: new_event.event_type,
            payload: new_event.payload,
            processed: false,
            processing_error: None,
            attempts: 1,
            claimed_at: new_event.claimed_at,
            created_at: now,
            processed_at: None,
        };
        state
            .webhook_events
            .insert(event.stripe_event_id.clone(), event.clone());

        Ok(ClaimOutcome::Claimed(event))
    }

    async fn mark_processed(&self, stripe_event_id: &str, now: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(event) = state.webhook_events.get_mut(stripe_event_id) {
            event.processed = true;
            event.processing_error = None;
            event.processed_at = Some(now);
        }
        Ok(())
    }

    async fn mark_failed(
        &self,
        stripe_event_id: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(event) = state.webhook_events.get_mut(stripe_event_id) {
            event.processed = true;
            event.processing_error = Some(error.to_string());
            event.processed_at = Some(now);
        }
        Ok(())
    }

    async fn get_by_stripe_event_id(
        &self,
        stripe_event_id: &str,
    ) -> Result<Option<StripeWebhookEvent>> {
        Ok(self.state.lock().await.webhook_events.get(stripe_event_id).cloned())
    }
}

#[async_trait]
impl SubscriptionStore for MemoryStore {
    async fn get_by_user(&self, user_id: Uuid) -> Result<Option<Subscription>> {
        Ok(self.state.lock().await.subscriptions.get(&user_id).cloned())
    }

    async fn deactivate_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut state = self.state.lock().await;
        let mut count = 0;
        for subscription in state.subscriptions.values_mut() {
            if subscription.is_active && subscription.end_date < now {
                subscription.is_active = false;
                subscription.updated_at = now;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn active_ending_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Subscription>> {
        let state = self.state.lock().await;
        let mut matching: Vec<Subscription> = state
            .subscriptions
            .values()
            .filter(|s| s.is_active && s.end_date >= from && s.end_date < to)
            .cloned()
            .collect();
        matching.sort_by_key(|s| s.end_date);
        Ok(matching)
    }
}

#[async_trait]
impl WatchLimitStore for MemoryStore {
    async fn get_or_create(&self, user_id: Uuid, date: NaiveDate) -> Result<DailyWatchLimit> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let row = state
            .watch_limits
            .entry((user_id, date))
            .or_insert_with(|| DailyWatchLimit {
                id: Uuid::now_v7(),
                user_id,
                date,
                watched_seconds: 0,
                created_at: now,
                updated_at: now,
            });
        Ok(row.clone())
    }

    async fn add_watch_time(
        &self,
        user_id: Uuid,
        date: NaiveDate,
        seconds: i32,
    ) -> Result<DailyWatchLimit> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let row = state
            .watch_limits
            .entry((user_id, date))
            .or_insert_with(|| DailyWatchLimit {
                id: Uuid::now_v7(),
                user_id,
                date,
                watched_seconds: 0,
                created_at: now,
                updated_at: now,
            });
        row.watched_seconds = row
            .watched_seconds
            .checked_add(seconds)
            .context("watched_seconds out of range")?;
        row.updated_at = now;
        Ok(row.clone())
    }

    async fn delete_before(&self, date: NaiveDate) -> Result<usize> {
        let mut state = self.state.lock().await;
        let before = state.watch_limits.len();
        state.watch_limits.retain(|(_, day), _| *day >= date);
        Ok(before - state.watch_limits.len())
    }
}

#[async_trait]
impl UserDirectory for MemoryStore {
    async fn get_user(&self, user_id: Uuid) -> Result<Option<User>> {
        let state = self.state.lock().await;
        Ok(state.users.get(&user_id).filter(|u| u.is_active).cloned())
    }
}

#[async_trait]
impl CustomerStore for MemoryStore {
    async fn get_by_user_id(&self, user_id: Uuid) -> Result<Option<StripeCustomer>> {
        Ok(self.state.lock().await.customers.get(&user_id).cloned())
    }

    async fn create(&self, new_customer: NewStripeCustomer) -> Result<StripeCustomer> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let customer = state
            .customers
            .entry(new_customer.user_id)
            .or_insert_with(|| StripeCustomer {
                id: Uuid::now_v7(),
                user_id: new_customer.user_id,
                stripe_customer_id: new_customer.stripe_customer_id,
                created_at: now,
                updated_at: now,
            });
        Ok(customer.clone())
    }
}
