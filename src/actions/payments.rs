use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{error, warn};
use uuid::Uuid;

use crate::auth::AuthUser;
use crate::checkout::{CHECKOUT_FAILED_MESSAGE, CheckoutError};
use crate::payments::Payment;
use crate::subscriptions::Subscription;
use crate::web::AppState;

use super::{DataListResponse, DataResponse, json_error};

/// View model for payments (API response)
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentView {
    pub id: String,
    pub stripe_payment_intent_id: String,
    pub status: String,
    pub amount: String,
    pub currency: String,
    pub subscription_months: i32,
    pub description: String,
    pub created_at: String,
    pub completed_at: Option<String>,
}

impl From<Payment> for PaymentView {
    fn from(p: Payment) -> Self {
        Self {
            id: p.id.to_string(),
            stripe_payment_intent_id: p.stripe_payment_intent_id,
            status: p.status.to_string(),
            amount: p.amount.with_scale(2).to_string(),
            currency: p.currency,
            subscription_months: p.subscription_months,
            description: p.description,
            created_at: p.created_at.to_rfc3339(),
            completed_at: p.completed_at.map(|at| at.to_rfc3339()),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionView {
    pub start_date: String,
    pub end_date: String,
    pub is_active: bool,
    pub is_expired: bool,
    pub days_remaining: i64,
}

impl From<Subscription> for SubscriptionView {
    fn from(s: Subscription) -> Self {
        let now = Utc::now();
        Self {
            start_date: s.start_date.to_rfc3339(),
            end_date: s.end_date.to_rfc3339(),
            is_active: s.is_active,
            is_expired: s.is_expired_at(now),
            days_remaining: s.days_remaining_at(now),
        }
    }
}

/// Request body for creating a checkout session
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateCheckoutRequest {
    #[serde(default = "default_months")]
    pub subscription_months: i32,
    pub success_url: Option<String>,
    pub cancel_url: Option<String>,
}

fn default_months() -> i32 {
    1
}

/// Response for checkout session creation
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutResponse {
    pub session_id: String,
    pub session_url: String,
}

/// POST /payments/checkout
/// Create a Stripe Checkout Session for a subscription purchase
pub async fn create_checkout(
    auth_user: AuthUser,
    State(state): State<AppState>,
    Json(request): Json<CreateCheckoutRequest>,
) -> Response {
    let user_id = auth_user.0.id;

    match state
        .checkout
        .create_checkout_session(
            user_id,
            request.subscription_months,
            request.success_url,
            request.cancel_url,
        )
        .await
    {
        Ok(session) => Json(DataResponse {
            data: CheckoutResponse {
                session_id: session.session_id,
                session_url: session.session_url,
            },
        })
        .into_response(),
        Err(e @ CheckoutError::InvalidMonths(_)) => {
            json_error(StatusCode::BAD_REQUEST, e.user_message())
        }
        Err(e) => {
            error!(%user_id, error = %e, "Failed to create checkout session");
            json_error(StatusCode::BAD_GATEWAY, e.user_message())
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CheckoutSuccessQuery {
    pub session_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutSuccessView {
    pub session_id: String,
    pub paid: bool,
    /// `None` until the webhook for this session has been reconciled
    pub payment: Option<PaymentView>,
}

/// GET /payments/success?session_id=...
/// Landing endpoint after checkout; reports what has been reconciled so far
pub async fn checkout_success(
    auth_user: AuthUser,
    State(state): State<AppState>,
    Query(query): Query<CheckoutSuccessQuery>,
) -> Response {
    let session = match state
        .checkout
        .gateway()
        .retrieve_checkout_session(&query.session_id)
        .await
    {
        Ok(session) => session,
        Err(e) => {
            warn!(session_id = %query.session_id, error = %e, "Failed to retrieve checkout session");
            return json_error(StatusCode::BAD_GATEWAY, CHECKOUT_FAILED_MESSAGE);
        }
    };

    let payment = match &session.payment_intent_id {
        Some(payment_intent_id) => {
            match state
                .stores
                .payments
                .get_by_payment_intent_id(payment_intent_id)
                .await
            {
                Ok(payment) => payment.filter(|p| p.user_id == auth_user.0.id),
                Err(e) => {
                    error!(%payment_intent_id, error = %e, "Failed to load payment");
                    return json_error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to get payment");
                }
            }
        }
        None => None,
    };

    Json(DataResponse {
        data: CheckoutSuccessView {
            session_id: session.session_id,
            paid: session.paid,
            payment: payment.map(PaymentView::from),
        },
    })
    .into_response()
}

/// GET /payments
/// List current user's payments
pub async fn list_my_payments(auth_user: AuthUser, State(state): State<AppState>) -> Response {
    match state.stores.payments.list_by_user(auth_user.0.id).await {
        Ok(payments) => {
            let views: Vec<PaymentView> = payments.into_iter().map(PaymentView::from).collect();
            Json(DataListResponse { data: views }).into_response()
        }
        Err(e) => {
            error!(user_id = %auth_user.0.id, error = %e, "Failed to list user payments");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to list payments")
        }
    }
}

/// GET /payments/{id}
/// Get payment details
pub async fn get_payment(
    auth_user: AuthUser,
    State(state): State<AppState>,
    Path(payment_id): Path<Uuid>,
) -> Response {
    match state.stores.payments.get_by_id(payment_id).await {
        // Other users' payments are reported as missing
        Ok(Some(payment)) if payment.user_id == auth_user.0.id => Json(DataResponse {
            data: PaymentView::from(payment),
        })
        .into_response(),
        Ok(_) => json_error(StatusCode::NOT_FOUND, "Payment not found"),
        Err(e) => {
            error!(payment_id = %payment_id, error = %e, "Failed to get payment");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to get payment")
        }
    }
}

/// GET /subscription
/// Current user's subscription, `null` when they never subscribed
pub async fn get_my_subscription(auth_user: AuthUser, State(state): State<AppState>) -> Response {
    match state.stores.subscriptions.get_by_user(auth_user.0.id).await {
        Ok(subscription) => Json(DataResponse {
            data: subscription.map(SubscriptionView::from),
        })
        .into_response(),
        Err(e) => {
            error!(user_id = %auth_user.0.id, error = %e, "Failed to get subscription");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to get subscription")
        }
    }
}
