use chrono::{DateTime, Duration, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An unprocessed event older than this is assumed abandoned by a crashed
/// worker and may be claimed again by a redelivery
pub const STALE_CLAIM_MINUTES: i64 = 10;

/// Durable record of one inbound gateway notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StripeWebhookEvent {
    pub id: Uuid,
    pub stripe_event_id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub processed: bool,
    pub processing_error: Option<String>,
    pub attempts: i32,
    pub claimed_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl StripeWebhookEvent {
    /// Whether a new delivery of this event may run the handlers again.
    ///
    /// Successfully processed events and in-flight claims are duplicates.
    /// Failed attempts and claims abandoned past the stale window are not.
    pub fn is_reclaimable_at(&self, now: DateTime<Utc>) -> bool {
        if self.processing_error.is_some() {
            return true;
        }
        !self.processed && self.claimed_at < now - Duration::minutes(STALE_CLAIM_MINUTES)
    }
}

/// Diesel model for the stripe_webhook_events table
#[derive(Debug, Clone, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::stripe_webhook_events)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct StripeWebhookEventModel {
    pub id: Uuid,
    pub stripe_event_id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub processed: bool,
    pub processing_error: Option<String>,
    pub attempts: i32,
    pub claimed_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

/// Insert model for new webhook events
#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::stripe_webhook_events)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct NewStripeWebhookEvent {
    pub stripe_event_id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub claimed_at: DateTime<Utc>,
}

impl From<StripeWebhookEventModel> for StripeWebhookEvent {
    fn from(model: StripeWebhookEventModel) -> Self {
        Self {
            id: model.id,
            stripe_event_id: model.stripe_event_id,
            event_type: model.event_type,
            payload: model.payload,
            processed: model.processed,
            processing_error: model.processing_error,
            attempts: model.attempts,
            claimed_at: model.claimed_at,
            created_at: model.created_at,
            processed_at: model.processed_at,
        }
    }
}

/// Result of trying to record an inbound event
#[derive(Debug, Clone)]
pub enum ClaimOutcome {
    /// This delivery owns processing of the event
    Claimed(StripeWebhookEvent),
    /// Already processed, or being processed by another delivery
    Duplicate,
}
