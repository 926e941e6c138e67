//! Turns gateway webhook deliveries into payment and entitlement changes.
//!
//! Deliveries can arrive duplicated, out of order and concurrently. The
//! engine relies on three things to stay correct under that:
//!
//! 1. the webhook event log claim, so one event id runs its handler once
//!    unless the previous attempt failed;
//! 2. the payment state machine, so `succeeded` is entered at most once;
//! 3. [`PaymentStore::complete_payment`](crate::store::PaymentStore::complete_payment),
//!    which commits the transition and the entitlement together.

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::notifications::{NotificationQueue, NotificationTask};
use crate::payments::{
    CompletionOutcome, NewPayment, PaymentStatus, StatusChange, amount_from_minor_units,
    subscription_description,
};
use crate::store::Stores;
use crate::stripe_client::StripeConfig;
use crate::stripe_events::{CheckoutSessionCompleted, EventKind, GatewayEvent, parse_event};
use crate::stripe_webhooks::{ClaimOutcome, NewStripeWebhookEvent};
use crate::subscriptions::{MAX_SUBSCRIPTION_MONTHS, MIN_SUBSCRIPTION_MONTHS};
use crate::webhook_signature::{self, SignatureError};

#[derive(Debug, Error)]
pub enum WebhookError {
    /// Rejected before anything is recorded
    #[error("invalid signature: {0}")]
    InvalidSignature(#[from] SignatureError),
    /// Signed but not a parseable event; nothing is recorded
    #[error("invalid payload: {0}")]
    Parse(#[from] serde_json::Error),
    /// Recorded as the event's processing error; the gateway should redeliver
    #[error("{0:#}")]
    Processing(anyhow::Error),
}

/// How a delivery was handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookOutcome {
    Processed,
    /// Already processed or currently being processed
    Duplicate,
    /// Event type the billing core does not react to
    Ignored,
}

#[derive(Clone)]
pub struct ReconciliationEngine {
    stores: Stores,
    notifications: NotificationQueue,
    webhook_secret: String,
    tolerance_secs: i64,
}

impl ReconciliationEngine {
    pub fn new(
        stores: Stores,
        notifications: NotificationQueue,
        webhook_secret: impl Into<String>,
        tolerance_secs: i64,
    ) -> Self {
        Self {
            stores,
            notifications,
            webhook_secret: webhook_secret.into(),
            tolerance_secs,
        }
    }

    pub fn from_config(
        stores: Stores,
        notifications: NotificationQueue,
        config: &StripeConfig,
    ) -> Self {
        Self::new(
            stores,
            notifications,
            config.webhook_secret.clone(),
            config.webhook_tolerance_secs,
        )
    }

    /// Verify, record and apply one webhook delivery
    pub async fn handle_webhook(
        &self,
        raw_payload: &[u8],
        signature_header: Option<&str>,
    ) -> Result<WebhookOutcome, WebhookError> {
        self.handle_webhook_at(raw_payload, signature_header, Utc::now())
            .await
    }

    pub async fn handle_webhook_at(
        &self,
        raw_payload: &[u8],
        signature_header: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<WebhookOutcome, WebhookError> {
        metrics::counter!("stripe.webhook.received").increment(1);
        let start = std::time::Instant::now();

        let header = signature_header.ok_or(SignatureError::MissingHeader);
        let verified = header.and_then(|header| {
            webhook_signature::verify(
                raw_payload,
                header,
                &self.webhook_secret,
                self.tolerance_secs,
                now.timestamp(),
            )
        });
        if let Err(e) = verified {
            warn!(error = %e, "Rejected webhook with invalid signature");
            metrics::counter!("stripe.webhook.signature_invalid").increment(1);
            return Err(WebhookError::InvalidSignature(e));
        }

        let event = parse_event(raw_payload).inspect_err(|e| {
            warn!(error = %e, "Rejected signed webhook with unparseable payload");
        })?;

        let result = self.process_event(event, now).await;

        metrics::histogram!("stripe.webhook.processing_ms")
            .record(start.elapsed().as_millis() as f64);
        result
    }

    /// Claim the event in the log, dispatch it and record the result
    pub async fn process_event(
        &self,
        event: GatewayEvent,
        now: DateTime<Utc>,
    ) -> Result<WebhookOutcome, WebhookError> {
        let claim = self
            .stores
            .webhook_events
            .claim(
                NewStripeWebhookEvent {
                    stripe_event_id: event.id.clone(),
                    event_type: event.event_type.clone(),
                    payload: event.payload.clone(),
                    claimed_at: now,
                },
                now,
            )
            .await
            .map_err(WebhookError::Processing)?;

        let record = match claim {
            ClaimOutcome::Claimed(record) => record,
            ClaimOutcome::Duplicate => {
                info!(event_id = %event.id, event_type = %event.event_type, "Skipping duplicate webhook");
                metrics::counter!("stripe.webhook.duplicate").increment(1);
                return Ok(WebhookOutcome::Duplicate);
            }
        };
        if record.attempts > 1 {
            info!(
                event_id = %event.id,
                attempts = record.attempts,
                "Re-processing previously failed webhook"
            );
        }

        match self.dispatch(&event, now).await {
            Ok(outcome) => {
                self.stores
                    .webhook_events
                    .mark_processed(&event.id, now)
                    .await
                    .map_err(WebhookError::Processing)?;
                metrics::counter!("stripe.webhook.processed", "event_type" => event.event_type.clone())
                    .increment(1);
                Ok(outcome)
            }
            Err(e) => {
                error!(event_id = %event.id, event_type = %event.event_type, error = %e, "Failed to process webhook event");
                metrics::counter!("stripe.webhook.failed").increment(1);
                if let Err(mark_error) = self
                    .stores
                    .webhook_events
                    .mark_failed(&event.id, &format!("{:#}", e), now)
                    .await
                {
                    error!(error = %mark_error, "Failed to mark webhook as failed");
                }
                Err(WebhookError::Processing(e))
            }
        }
    }

    async fn dispatch(&self, event: &GatewayEvent, now: DateTime<Utc>) -> Result<WebhookOutcome> {
        match &event.kind {
            EventKind::CheckoutSessionCompleted(session) => {
                self.handle_checkout_session_completed(session, now).await?;
            }
            EventKind::PaymentIntentSucceeded { payment_intent_id } => {
                self.handle_payment_intent_succeeded(payment_intent_id, now)
                    .await?;
            }
            EventKind::PaymentIntentFailed { payment_intent_id } => {
                self.handle_payment_intent_failed(payment_intent_id).await?;
            }
            EventKind::ChargeRefunded { payment_intent_id } => {
                self.handle_charge_refunded(payment_intent_id.as_deref())
                    .await?;
            }
            EventKind::Ignored => {
                debug!(event_type = %event.event_type, "Ignoring unhandled webhook event type");
                return Ok(WebhookOutcome::Ignored);
            }
        }
        Ok(WebhookOutcome::Processed)
    }

    /// Resolve the purchasing user from checkout metadata. Absent, malformed
    /// or unknown ids all yield `None`.
    async fn resolve_user(&self, metadata: &HashMap<String, String>) -> Result<Option<Uuid>> {
        let Some(raw_user_id) = metadata.get("user_id") else {
            info!("Checkout session has no user_id metadata, ignoring");
            return Ok(None);
        };
        let Ok(user_id) = Uuid::parse_str(raw_user_id) else {
            warn!(user_id = %raw_user_id, "Checkout session has malformed user_id, ignoring");
            return Ok(None);
        };
        if self.stores.users.get_user(user_id).await?.is_none() {
            warn!(%user_id, "Checkout session references unknown user, ignoring");
            return Ok(None);
        }
        Ok(Some(user_id))
    }

    pub async fn handle_checkout_session_completed(
        &self,
        session: &CheckoutSessionCompleted,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let Some(user_id) = self.resolve_user(&session.metadata).await? else {
            return Ok(());
        };
        let Some(payment_intent_id) = session.payment_intent_id.as_deref() else {
            warn!(session_id = %session.session_id, "Checkout session has no payment intent, ignoring");
            return Ok(());
        };

        let months = subscription_months(&session.metadata);
        let metadata = serde_json::to_value(&session.metadata)?;

        let (payment, created) = self
            .stores
            .payments
            .insert_if_absent(NewPayment {
                user_id,
                stripe_payment_intent_id: payment_intent_id.to_string(),
                stripe_checkout_session_id: Some(session.session_id.clone()),
                amount: amount_from_minor_units(session.amount_total),
                currency: session.currency.clone(),
                status: PaymentStatus::Processing,
                subscription_months: months,
                description: subscription_description(months),
                metadata,
            })
            .await?;

        if created {
            info!(
                payment_id = %payment.id,
                %payment_intent_id,
                %user_id,
                months,
                "Recorded payment from checkout session"
            );
        } else {
            self.stores
                .payments
                .attach_checkout_session(payment_intent_id, &session.session_id)
                .await?;
        }

        if session.paid {
            self.transition_to_succeeded(payment_intent_id, now).await?;
        }

        Ok(())
    }

    pub async fn handle_payment_intent_succeeded(
        &self,
        payment_intent_id: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.transition_to_succeeded(payment_intent_id, now).await?;
        Ok(())
    }

    pub async fn handle_payment_intent_failed(&self, payment_intent_id: &str) -> Result<()> {
        match self.stores.payments.fail_payment(payment_intent_id).await? {
            StatusChange::NotFound => {
                debug!(%payment_intent_id, "Failed payment intent has no payment record");
            }
            StatusChange::Changed(payment) => {
                info!(payment_id = %payment.id, %payment_intent_id, "Payment failed");
                metrics::counter!("stripe.payments.failed").increment(1);
            }
            StatusChange::Unchanged(payment) if payment.status == PaymentStatus::Failed => {}
            StatusChange::Unchanged(payment) => {
                warn!(
                    payment_id = %payment.id,
                    status = %payment.status,
                    "Ignoring failure notice for settled payment"
                );
            }
        }
        Ok(())
    }

    pub async fn handle_charge_refunded(&self, payment_intent_id: Option<&str>) -> Result<()> {
        let Some(payment_intent_id) = payment_intent_id else {
            debug!("Refunded charge has no payment intent");
            return Ok(());
        };

        match self.stores.payments.refund_payment(payment_intent_id).await? {
            StatusChange::NotFound => {
                debug!(%payment_intent_id, "Refunded charge has no payment record");
            }
            StatusChange::Changed(payment) => {
                info!(payment_id = %payment.id, %payment_intent_id, "Payment refunded");
                metrics::counter!("stripe.payments.refunded").increment(1);
            }
            StatusChange::Unchanged(_) => {}
        }
        Ok(())
    }

    /// Move a payment to `succeeded`. The entitlement and the confirmation
    /// notice are only produced by the call that performs the transition.
    pub async fn transition_to_succeeded(
        &self,
        payment_intent_id: &str,
        now: DateTime<Utc>,
    ) -> Result<CompletionOutcome> {
        let outcome = self
            .stores
            .payments
            .complete_payment(payment_intent_id, now)
            .await?;

        match &outcome {
            CompletionOutcome::NotFound => {
                debug!(%payment_intent_id, "Succeeded payment intent has no payment record");
            }
            CompletionOutcome::AlreadySucceeded(payment) => {
                debug!(payment_id = %payment.id, "Payment already succeeded");
            }
            CompletionOutcome::Rejected(payment) => {
                warn!(
                    payment_id = %payment.id,
                    status = %payment.status,
                    "Refusing to mark payment succeeded from its current status"
                );
            }
            CompletionOutcome::Completed {
                payment,
                subscription,
            } => {
                info!(
                    payment_id = %payment.id,
                    user_id = %payment.user_id,
                    end_date = %subscription.end_date,
                    "Payment succeeded, subscription active"
                );
                metrics::counter!("stripe.payments.succeeded").increment(1);
                metrics::counter!("subscriptions.activated").increment(1);

                self.notifications
                    .enqueue(NotificationTask::SubscriptionConfirmation {
                        user_id: payment.user_id,
                        payment_id: payment.id,
                    });
            }
        }

        Ok(outcome)
    }
}

/// Months purchased, from checkout metadata. Missing or unusable values
/// count as one month; values past the purchasable maximum are capped.
fn subscription_months(metadata: &HashMap<String, String>) -> i32 {
    match metadata.get("subscription_months") {
        None => MIN_SUBSCRIPTION_MONTHS,
        Some(raw) => match raw.trim().parse::<i32>() {
            Ok(months) if months > MAX_SUBSCRIPTION_MONTHS => {
                warn!(
                    subscription_months = %raw,
                    "subscription_months metadata above {}, capping", MAX_SUBSCRIPTION_MONTHS
                );
                MAX_SUBSCRIPTION_MONTHS
            }
            Ok(months) if months >= MIN_SUBSCRIPTION_MONTHS => months,
            _ => {
                warn!(subscription_months = %raw, "Unusable subscription_months metadata, using 1");
                1
            }
        },
    }
}
