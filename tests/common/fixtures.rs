use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use videohub::checkout::{
    CheckoutRequest, CheckoutService, CheckoutSessionSummary, CreatedCheckoutSession,
    GatewayError, PaymentGateway, PaymentIntentSummary, RefundResult,
};
use videohub::memory_store::MemoryStore;
use videohub::notifications::{NotificationQueue, NotificationTask, Notifier};
use videohub::payments::{Payment, PaymentStatus, amount_from_minor_units};
use videohub::reconciliation::ReconciliationEngine;
use videohub::store::Stores;
use videohub::subscriptions::Subscription;
use videohub::users::User;
use videohub::webhook_signature::{self, DEFAULT_TOLERANCE_SECS};

pub const WEBHOOK_SECRET: &str = "whsec_test_secret";

pub fn user(username: &str) -> User {
    let now = Utc::now();
    User {
        id: Uuid::now_v7(),
        username: username.to_string(),
        email: format!("{}@example.com", username),
        first_name: String::new(),
        last_name: String::new(),
        is_active: true,
        created_at: now,
        updated_at: now,
    }
}

pub fn payment(user_id: Uuid, payment_intent_id: &str, status: PaymentStatus) -> Payment {
    let now = Utc::now();
    Payment {
        id: Uuid::now_v7(),
        user_id,
        stripe_payment_intent_id: payment_intent_id.to_string(),
        stripe_checkout_session_id: None,
        amount: amount_from_minor_units(1200),
        currency: "USD".to_string(),
        status,
        subscription_months: 1,
        description: "VideoHub Premium Subscription - 1 month(s)".to_string(),
        metadata: serde_json::json!({}),
        created_at: now,
        updated_at: now,
        completed_at: None,
    }
}

pub fn subscription(user_id: Uuid, end_date: DateTime<Utc>, is_active: bool) -> Subscription {
    let start_date = end_date - Duration::days(30);
    Subscription {
        id: Uuid::now_v7(),
        user_id,
        start_date,
        end_date,
        is_active,
        created_at: start_date,
        updated_at: start_date,
    }
}

/// In-memory billing core with a reachable notification queue
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub stores: Stores,
    pub engine: ReconciliationEngine,
    pub notifications: flume::Receiver<NotificationTask>,
}

impl Harness {
    pub fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let stores = Stores::in_memory(store.clone());
        let (queue, notifications) = NotificationQueue::new();
        let engine = ReconciliationEngine::new(
            stores.clone(),
            queue,
            WEBHOOK_SECRET,
            DEFAULT_TOLERANCE_SECS,
        );

        Self {
            store,
            stores,
            engine,
            notifications,
        }
    }

    pub async fn add_user(&self, username: &str) -> User {
        let user = user(username);
        self.store.insert_user(user.clone()).await;
        user
    }

    pub fn queued_notifications(&self) -> Vec<NotificationTask> {
        self.notifications.drain().collect()
    }

    /// Sign and deliver an event body the way the gateway would
    pub async fn deliver(
        &self,
        event: &serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<videohub::WebhookOutcome, videohub::WebhookError> {
        let (body, header) = signed(event, now);
        self.engine
            .handle_webhook_at(&body, Some(&header), now)
            .await
    }
}

/// Serialized body plus a valid `Stripe-Signature` header for it
pub fn signed(event: &serde_json::Value, now: DateTime<Utc>) -> (Vec<u8>, String) {
    let body = serde_json::to_vec(event).unwrap();
    let header = webhook_signature::sign(&body, WEBHOOK_SECRET, now.timestamp()).unwrap();
    (body, header)
}

pub fn checkout_completed_event(
    event_id: &str,
    session_id: &str,
    payment_intent_id: &str,
    user_id: Uuid,
    months: i32,
    paid: bool,
) -> serde_json::Value {
    serde_json::json!({
        "id": event_id,
        "type": "checkout.session.completed",
        "created": 1_700_000_000,
        "data": {
            "object": {
                "id": session_id,
                "object": "checkout.session",
                "payment_intent": payment_intent_id,
                "payment_status": if paid { "paid" } else { "unpaid" },
                "amount_total": 1200 * i64::from(months),
                "currency": "usd",
                "metadata": {
                    "user_id": user_id.to_string(),
                    "subscription_months": months.to_string(),
                }
            }
        }
    })
}

pub fn payment_intent_event(
    event_id: &str,
    event_type: &str,
    payment_intent_id: &str,
) -> serde_json::Value {
    serde_json::json!({
        "id": event_id,
        "type": event_type,
        "created": 1_700_000_000,
        "data": {
            "object": {
                "id": payment_intent_id,
                "object": "payment_intent",
            }
        }
    })
}

pub fn charge_refunded_event(event_id: &str, payment_intent_id: &str) -> serde_json::Value {
    serde_json::json!({
        "id": event_id,
        "type": "charge.refunded",
        "created": 1_700_000_000,
        "data": {
            "object": {
                "id": format!("ch_{}", payment_intent_id),
                "object": "charge",
                "payment_intent": payment_intent_id,
            }
        }
    })
}

/// Records every notification; fails for users listed in `failing_users`
#[derive(Default)]
pub struct FakeNotifier {
    pub confirmations: Mutex<Vec<(Uuid, Uuid)>>,
    pub reminders: Mutex<Vec<Uuid>>,
    pub failing_users: Mutex<Vec<Uuid>>,
    pub attempts: Mutex<u32>,
}

impl FakeNotifier {
    pub fn fail_for(&self, user_id: Uuid) {
        self.failing_users.lock().unwrap().push(user_id);
    }

    fn check(&self, user_id: Uuid) -> Result<()> {
        *self.attempts.lock().unwrap() += 1;
        if self.failing_users.lock().unwrap().contains(&user_id) {
            anyhow::bail!("SMTP connection refused");
        }
        Ok(())
    }
}

#[async_trait]
impl Notifier for FakeNotifier {
    async fn send_subscription_confirmation(
        &self,
        user: &User,
        payment: &Payment,
        _subscription: &Subscription,
    ) -> Result<()> {
        self.check(user.id)?;
        self.confirmations
            .lock()
            .unwrap()
            .push((user.id, payment.id));
        Ok(())
    }

    async fn send_expiry_reminder(&self, user: &User, _subscription: &Subscription) -> Result<()> {
        self.check(user.id)?;
        self.reminders.lock().unwrap().push(user.id);
        Ok(())
    }
}

/// Gateway double that records requests instead of calling Stripe
#[derive(Default)]
pub struct FakeGateway {
    pub customers_created: Mutex<Vec<Uuid>>,
    pub checkout_requests: Mutex<Vec<CheckoutRequest>>,
    pub fail_checkout: Mutex<bool>,
    /// Answer for `retrieve_checkout_session`
    pub session: Mutex<Option<CheckoutSessionSummary>>,
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    async fn create_customer(&self, user: &User) -> Result<String, GatewayError> {
        let mut created = self.customers_created.lock().unwrap();
        created.push(user.id);
        Ok(format!("cus_test_{}", created.len()))
    }

    async fn create_checkout_session(
        &self,
        request: &CheckoutRequest,
    ) -> Result<CreatedCheckoutSession, GatewayError> {
        if *self.fail_checkout.lock().unwrap() {
            return Err(GatewayError::Unavailable("card network down".to_string()));
        }
        let mut requests = self.checkout_requests.lock().unwrap();
        requests.push(request.clone());
        let session_id = format!("cs_test_{}", requests.len());
        Ok(CreatedCheckoutSession {
            session_url: format!("https://checkout.stripe.test/{}", session_id),
            session_id,
            customer_id: request.customer_id.clone(),
        })
    }

    async fn retrieve_checkout_session(
        &self,
        session_id: &str,
    ) -> Result<CheckoutSessionSummary, GatewayError> {
        self.session
            .lock()
            .unwrap()
            .clone()
            .filter(|session| session.session_id == session_id)
            .ok_or_else(|| GatewayError::InvalidId(session_id.to_string()))
    }

    async fn retrieve_payment_intent(
        &self,
        payment_intent_id: &str,
    ) -> Result<PaymentIntentSummary, GatewayError> {
        Ok(PaymentIntentSummary {
            payment_intent_id: payment_intent_id.to_string(),
            status: "succeeded".to_string(),
            amount: 1200,
            currency: "USD".to_string(),
        })
    }

    async fn refund(
        &self,
        payment_intent_id: &str,
        amount_cents: Option<i64>,
    ) -> Result<RefundResult, GatewayError> {
        Ok(RefundResult {
            refund_id: format!("re_{}", payment_intent_id),
            status: Some("succeeded".to_string()),
            amount: amount_cents.unwrap_or(1200),
        })
    }
}

pub fn checkout_service(stores: Stores, gateway: Arc<FakeGateway>) -> CheckoutService {
    CheckoutService::new(stores, gateway, 1200, "https://videohub.test")
}
