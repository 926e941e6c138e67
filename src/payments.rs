use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_derive_enum::DbEnum;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Price of one subscription month in minor currency units (12.00 USD)
pub const DEFAULT_MONTHLY_PRICE_CENTS: i64 = 1200;

/// Pending payments older than this are purged by the maintenance sweep
pub const STALE_PENDING_HOURS: i64 = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, DbEnum)]
#[db_enum(existing_type_path = "crate::schema::sql_types::PaymentStatus")]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    #[db_enum(rename = "pending")]
    Pending,
    #[db_enum(rename = "processing")]
    Processing,
    #[db_enum(rename = "succeeded")]
    Succeeded,
    #[db_enum(rename = "failed")]
    Failed,
    #[db_enum(rename = "canceled")]
    Canceled,
    #[db_enum(rename = "refunded")]
    Refunded,
}

impl PaymentStatus {
    /// Whether the state machine allows moving from `self` to `next`.
    ///
    /// `succeeded` is only entered from `pending`/`processing`, `failed` and
    /// `canceled` are terminal, and a succeeded payment can only be refunded.
    /// The refund handler deliberately bypasses this check.
    pub fn can_transition_to(self, next: PaymentStatus) -> bool {
        use PaymentStatus::*;

        match (self, next) {
            (Pending, Processing | Succeeded | Failed | Canceled) => true,
            (Processing, Succeeded | Failed | Canceled) => true,
            (Succeeded, Refunded) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Processing => "processing",
            PaymentStatus::Succeeded => "succeeded",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Canceled => "canceled",
            PaymentStatus::Refunded => "refunded",
        }
    }
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// API model for payments
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payment {
    pub id: Uuid,
    pub user_id: Uuid,
    pub stripe_payment_intent_id: String,
    pub stripe_checkout_session_id: Option<String>,
    pub amount: BigDecimal,
    pub currency: String,
    pub status: PaymentStatus,
    pub subscription_months: i32,
    pub description: String,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Diesel model for the payments table
#[derive(Debug, Clone, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::payments)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct PaymentModel {
    pub id: Uuid,
    pub user_id: Uuid,
    pub stripe_payment_intent_id: String,
    pub stripe_checkout_session_id: Option<String>,
    pub amount: BigDecimal,
    pub currency: String,
    pub status: PaymentStatus,
    pub subscription_months: i32,
    pub description: String,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Insert model for new payments
#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::payments)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct NewPayment {
    pub user_id: Uuid,
    pub stripe_payment_intent_id: String,
    pub stripe_checkout_session_id: Option<String>,
    pub amount: BigDecimal,
    pub currency: String,
    pub status: PaymentStatus,
    pub subscription_months: i32,
    pub description: String,
    pub metadata: serde_json::Value,
}

impl From<PaymentModel> for Payment {
    fn from(model: PaymentModel) -> Self {
        Self {
            id: model.id,
            user_id: model.user_id,
            stripe_payment_intent_id: model.stripe_payment_intent_id,
            stripe_checkout_session_id: model.stripe_checkout_session_id,
            amount: model.amount,
            currency: model.currency,
            status: model.status,
            subscription_months: model.subscription_months,
            description: model.description,
            metadata: model.metadata,
            created_at: model.created_at,
            updated_at: model.updated_at,
            completed_at: model.completed_at,
        }
    }
}

/// Convert an amount in minor currency units (cents) into a 2-place decimal
pub fn amount_from_minor_units(minor_units: i64) -> BigDecimal {
    (BigDecimal::from(minor_units) / BigDecimal::from(100)).with_scale(2)
}

pub fn subscription_description(months: i32) -> String {
    format!("VideoHub Premium Subscription - {} month(s)", months)
}

/// Result of moving a payment into `succeeded`.
///
/// The payment transition and the entitlement change commit together, so
/// `Completed` is the only variant that carries a subscription.
#[derive(Debug, Clone)]
pub enum CompletionOutcome {
    NotFound,
    AlreadySucceeded(Payment),
    Rejected(Payment),
    Completed {
        payment: Payment,
        subscription: crate::subscriptions::Subscription,
    },
}

/// Result of a status change that has no entitlement side effect
#[derive(Debug, Clone)]
pub enum StatusChange {
    NotFound,
    Unchanged(Payment),
    Changed(Payment),
}
