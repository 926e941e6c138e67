use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::{debug, error};

use crate::reconciliation::{WebhookError, WebhookOutcome};
use crate::web::AppState;

pub const SIGNATURE_HEADER: &str = "Stripe-Signature";

/// POST /payments/webhook
/// Verify and reconcile one Stripe webhook delivery
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(signature) = headers.get(SIGNATURE_HEADER) else {
        metrics::counter!("stripe.webhook.signature_invalid").increment(1);
        return (StatusCode::BAD_REQUEST, "Missing signature").into_response();
    };
    let Ok(signature) = signature.to_str() else {
        metrics::counter!("stripe.webhook.signature_invalid").increment(1);
        return (StatusCode::BAD_REQUEST, "Invalid signature").into_response();
    };

    match state.engine.handle_webhook(&body, Some(signature)).await {
        Ok(outcome) => {
            if outcome != WebhookOutcome::Processed {
                debug!(?outcome, "Webhook acknowledged without changes");
            }
            (StatusCode::OK, "Webhook received").into_response()
        }
        Err(WebhookError::InvalidSignature(_)) => {
            (StatusCode::BAD_REQUEST, "Invalid signature").into_response()
        }
        Err(WebhookError::Parse(_)) => (StatusCode::BAD_REQUEST, "Invalid payload").into_response(),
        Err(e @ WebhookError::Processing(_)) => {
            error!(error = %e, "Webhook processing failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Webhook processing failed: {}", e),
            )
                .into_response()
        }
    }
}
