use anyhow::{Context, Result};
use stripe::Client;

use crate::payments::DEFAULT_MONTHLY_PRICE_CENTS;
use crate::webhook_signature::DEFAULT_TOLERANCE_SECS;

/// Configuration for Stripe integration.
///
/// Built once at startup and handed to the services that talk to Stripe.
#[derive(Clone)]
pub struct StripeConfig {
    pub client: Client,
    pub webhook_secret: String,
    /// Accepted age of a webhook signature timestamp
    pub webhook_tolerance_secs: i64,
    /// Price of one subscription month in cents
    pub monthly_price_cents: i64,
    /// Base URL used for default checkout success/cancel redirects
    pub base_url: String,
}

impl StripeConfig {
    /// Initialize Stripe configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let secret_key =
            std::env::var("STRIPE_SECRET_KEY").context("STRIPE_SECRET_KEY must be set")?;
        let webhook_secret =
            std::env::var("STRIPE_WEBHOOK_SECRET").context("STRIPE_WEBHOOK_SECRET must be set")?;
        let webhook_tolerance_secs: i64 = std::env::var("STRIPE_WEBHOOK_TOLERANCE_SECS")
            .unwrap_or_else(|_| DEFAULT_TOLERANCE_SECS.to_string())
            .parse()
            .context("STRIPE_WEBHOOK_TOLERANCE_SECS must be a valid number")?;
        let monthly_price_cents: i64 = std::env::var("SUBSCRIPTION_PRICE_CENTS")
            .unwrap_or_else(|_| DEFAULT_MONTHLY_PRICE_CENTS.to_string())
            .parse()
            .context("SUBSCRIPTION_PRICE_CENTS must be a valid number")?;
        let base_url =
            std::env::var("BASE_URL").unwrap_or_else(|_| "http://localhost:3000".to_string());

        let client = Client::new(secret_key);

        Ok(Self {
            client,
            webhook_secret,
            webhook_tolerance_secs,
            monthly_price_cents,
            base_url,
        })
    }
}

impl std::fmt::Debug for StripeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StripeConfig")
            .field("webhook_secret", &"[REDACTED]")
            .field("webhook_tolerance_secs", &self.webhook_tolerance_secs)
            .field("monthly_price_cents", &self.monthly_price_cents)
            .field("base_url", &self.base_url)
            .finish()
    }
}
