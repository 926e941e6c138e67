use anyhow::{Context, Result};
use tracing::{info, warn};

use videohub::checkout::{PaymentGateway, StripeGateway};
use videohub::payments_repo::PaymentsRepository;
use videohub::stripe_client::StripeConfig;
use videohub::web::PgPool;

/// Issue a Stripe refund for a payment intent.
///
/// The local payment flips to `refunded` when Stripe delivers the
/// `charge.refunded` webhook, so this command only talks to the gateway.
pub async fn handle_refund(
    pool: PgPool,
    payment_intent_id: String,
    amount_cents: Option<i64>,
) -> Result<()> {
    let payments_repo = PaymentsRepository::new(pool);
    match payments_repo
        .get_by_payment_intent_id(&payment_intent_id)
        .await?
    {
        Some(payment) => info!(
            payment_id = %payment.id,
            user_id = %payment.user_id,
            status = %payment.status,
            amount = %payment.amount,
            "Refunding payment"
        ),
        None => warn!(%payment_intent_id, "No local payment record for payment intent"),
    }

    let stripe_config = StripeConfig::from_env()?;
    let gateway = StripeGateway::new(&stripe_config);

    let intent = gateway
        .retrieve_payment_intent(&payment_intent_id)
        .await
        .with_context(|| format!("Failed to retrieve {}", payment_intent_id))?;
    info!(
        status = %intent.status,
        amount = intent.amount,
        currency = %intent.currency,
        "Retrieved payment intent"
    );
    if let Some(amount) = amount_cents {
        anyhow::ensure!(
            amount > 0 && amount <= intent.amount,
            "refund amount must be between 1 and {} cents",
            intent.amount
        );
    }

    let refund = gateway
        .refund(&payment_intent_id, amount_cents)
        .await
        .with_context(|| format!("Failed to refund {}", payment_intent_id))?;

    info!(
        refund_id = %refund.refund_id,
        status = refund.status.as_deref().unwrap_or("unknown"),
        amount = refund.amount,
        "Refund created"
    );
    Ok(())
}
