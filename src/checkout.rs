use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use stripe::{
    CheckoutSession, CheckoutSessionId, CheckoutSessionMode, CheckoutSessionPaymentStatus,
    CreateCheckoutSession, CreateCheckoutSessionLineItems, CreateCheckoutSessionLineItemsPriceData,
    CreateCheckoutSessionLineItemsPriceDataProductData, CreateCheckoutSessionPaymentMethodTypes,
    CreateCustomer, CreateRefund, Currency, Customer, CustomerId, PaymentIntent, PaymentIntentId,
    Refund,
};
use thiserror::Error;
use tracing::{error, info};
use uuid::Uuid;

use crate::store::Stores;
use crate::stripe_client::StripeConfig;
use crate::stripe_customers::{NewStripeCustomer, StripeCustomer};
use crate::users::User;

pub use crate::subscriptions::{MAX_SUBSCRIPTION_MONTHS, MIN_SUBSCRIPTION_MONTHS};

pub const CHECKOUT_FAILED_MESSAGE: &str = "Failed to create payment session. Please try again.";
pub const INVALID_DURATION_MESSAGE: &str = "Invalid subscription duration.";

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("stripe request failed: {0}")]
    Stripe(#[from] stripe::StripeError),
    #[error("invalid stripe id {0:?}")]
    InvalidId(String),
    #[error("gateway unavailable: {0}")]
    Unavailable(String),
}

/// What the gateway needs to open a hosted checkout page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutRequest {
    pub customer_id: String,
    pub user_id: Uuid,
    pub subscription_months: i32,
    pub amount_cents: i64,
    pub product_name: String,
    pub product_description: String,
    pub success_url: String,
    pub cancel_url: String,
}

impl CheckoutRequest {
    /// Metadata the webhook handler reads back from the completed session
    pub fn metadata(&self) -> HashMap<String, String> {
        HashMap::from([
            ("user_id".to_string(), self.user_id.to_string()),
            (
                "subscription_months".to_string(),
                self.subscription_months.to_string(),
            ),
        ])
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedCheckoutSession {
    pub session_id: String,
    pub session_url: String,
    pub customer_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutSessionSummary {
    pub session_id: String,
    pub payment_intent_id: Option<String>,
    pub paid: bool,
    pub amount_total: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentIntentSummary {
    pub payment_intent_id: String,
    pub status: String,
    pub amount: i64,
    pub currency: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefundResult {
    pub refund_id: String,
    pub status: Option<String>,
    pub amount: i64,
}

/// Remote payment gateway operations
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Create a gateway customer for the user, returning its id
    async fn create_customer(&self, user: &User) -> Result<String, GatewayError>;

    async fn create_checkout_session(
        &self,
        request: &CheckoutRequest,
    ) -> Result<CreatedCheckoutSession, GatewayError>;

    async fn retrieve_checkout_session(
        &self,
        session_id: &str,
    ) -> Result<CheckoutSessionSummary, GatewayError>;

    async fn retrieve_payment_intent(
        &self,
        payment_intent_id: &str,
    ) -> Result<PaymentIntentSummary, GatewayError>;

    /// Refund a payment intent, fully when `amount_cents` is `None`
    async fn refund(
        &self,
        payment_intent_id: &str,
        amount_cents: Option<i64>,
    ) -> Result<RefundResult, GatewayError>;
}

/// [`PaymentGateway`] backed by the Stripe API
#[derive(Clone)]
pub struct StripeGateway {
    client: stripe::Client,
}

impl StripeGateway {
    pub fn new(config: &StripeConfig) -> Self {
        Self {
            client: config.client.clone(),
        }
    }
}

fn parse_id<T: std::str::FromStr>(raw: &str) -> Result<T, GatewayError> {
    raw.parse()
        .map_err(|_| GatewayError::InvalidId(raw.to_string()))
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    async fn create_customer(&self, user: &User) -> Result<String, GatewayError> {
        let display_name = user.display_name();
        let mut params = CreateCustomer::new();
        params.email = Some(&user.email);
        params.name = Some(&display_name);
        params.metadata = Some(HashMap::from([
            ("user_id".to_string(), user.id.to_string()),
            ("username".to_string(), user.username.clone()),
        ]));

        let customer = Customer::create(&self.client, params).await?;
        Ok(customer.id.to_string())
    }

    async fn create_checkout_session(
        &self,
        request: &CheckoutRequest,
    ) -> Result<CreatedCheckoutSession, GatewayError> {
        let customer_id: CustomerId = parse_id(&request.customer_id)?;

        let mut params = CreateCheckoutSession::new();
        params.customer = Some(customer_id);
        params.success_url = Some(&request.success_url);
        params.cancel_url = Some(&request.cancel_url);
        params.mode = Some(CheckoutSessionMode::Payment);
        params.payment_method_types = Some(vec![CreateCheckoutSessionPaymentMethodTypes::Card]);
        params.metadata = Some(request.metadata());
        params.line_items = Some(vec![CreateCheckoutSessionLineItems {
            price_data: Some(CreateCheckoutSessionLineItemsPriceData {
                currency: Currency::USD,
                product_data: Some(CreateCheckoutSessionLineItemsPriceDataProductData {
                    name: request.product_name.clone(),
                    description: Some(request.product_description.clone()),
                    ..Default::default()
                }),
                unit_amount: Some(request.amount_cents),
                ..Default::default()
            }),
            quantity: Some(1),
            ..Default::default()
        }]);

        let session = CheckoutSession::create(&self.client, params).await?;

        Ok(CreatedCheckoutSession {
            session_id: session.id.to_string(),
            session_url: session.url.unwrap_or_default(),
            customer_id: request.customer_id.clone(),
        })
    }

    async fn retrieve_checkout_session(
        &self,
        session_id: &str,
    ) -> Result<CheckoutSessionSummary, GatewayError> {
        let id: CheckoutSessionId = parse_id(session_id)?;
        let session = CheckoutSession::retrieve(&self.client, &id, &[]).await?;

        Ok(CheckoutSessionSummary {
            session_id: session.id.to_string(),
            payment_intent_id: session
                .payment_intent
                .as_ref()
                .map(|intent| intent.id().to_string()),
            paid: session.payment_status == CheckoutSessionPaymentStatus::Paid,
            amount_total: session.amount_total,
        })
    }

    async fn retrieve_payment_intent(
        &self,
        payment_intent_id: &str,
    ) -> Result<PaymentIntentSummary, GatewayError> {
        let id: PaymentIntentId = parse_id(payment_intent_id)?;
        let intent = PaymentIntent::retrieve(&self.client, &id, &[]).await?;

        Ok(PaymentIntentSummary {
            payment_intent_id: intent.id.to_string(),
            status: intent.status.to_string(),
            amount: intent.amount,
            currency: intent.currency.to_string().to_uppercase(),
        })
    }

    async fn refund(
        &self,
        payment_intent_id: &str,
        amount_cents: Option<i64>,
    ) -> Result<RefundResult, GatewayError> {
        let id: PaymentIntentId = parse_id(payment_intent_id)?;
        let mut params = CreateRefund::new();
        params.payment_intent = Some(id);
        params.amount = amount_cents;

        let refund = Refund::create(&self.client, params).await?;

        Ok(RefundResult {
            refund_id: refund.id.to_string(),
            status: refund.status.map(|status| status.to_string()),
            amount: refund.amount,
        })
    }
}

#[derive(Debug, Error)]
pub enum CheckoutError {
    #[error("subscription months must be between 1 and 12, got {0}")]
    InvalidMonths(i32),
    #[error("user {0} not found")]
    UserNotFound(Uuid),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl CheckoutError {
    /// Message safe to show to the buyer
    pub fn user_message(&self) -> &'static str {
        match self {
            CheckoutError::InvalidMonths(_) => INVALID_DURATION_MESSAGE,
            _ => CHECKOUT_FAILED_MESSAGE,
        }
    }
}

fn plural_months(months: i32) -> String {
    if months > 1 {
        format!("{} months", months)
    } else {
        format!("{} month", months)
    }
}

/// Opens hosted checkout pages for subscription purchases
#[derive(Clone)]
pub struct CheckoutService {
    stores: Stores,
    gateway: Arc<dyn PaymentGateway>,
    monthly_price_cents: i64,
    base_url: String,
}

impl CheckoutService {
    pub fn new(
        stores: Stores,
        gateway: Arc<dyn PaymentGateway>,
        monthly_price_cents: i64,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            stores,
            gateway,
            monthly_price_cents,
            base_url: base_url.into(),
        }
    }

    pub fn from_config(stores: Stores, gateway: Arc<dyn PaymentGateway>, config: &StripeConfig) -> Self {
        Self::new(
            stores,
            gateway,
            config.monthly_price_cents,
            config.base_url.clone(),
        )
    }

    pub fn gateway(&self) -> &Arc<dyn PaymentGateway> {
        &self.gateway
    }

    /// Return the user's gateway customer, creating it on first checkout
    pub async fn get_or_create_customer(&self, user: &User) -> Result<StripeCustomer, CheckoutError> {
        if let Some(existing) = self.stores.customers.get_by_user_id(user.id).await? {
            return Ok(existing);
        }

        let stripe_customer_id = self.gateway.create_customer(user).await?;
        info!(user_id = %user.id, %stripe_customer_id, "Created Stripe customer");

        let customer = self
            .stores
            .customers
            .create(NewStripeCustomer {
                user_id: user.id,
                stripe_customer_id,
            })
            .await?;
        Ok(customer)
    }

    pub async fn create_checkout_session(
        &self,
        user_id: Uuid,
        subscription_months: i32,
        success_url: Option<String>,
        cancel_url: Option<String>,
    ) -> Result<CreatedCheckoutSession, CheckoutError> {
        if !(MIN_SUBSCRIPTION_MONTHS..=MAX_SUBSCRIPTION_MONTHS).contains(&subscription_months) {
            return Err(CheckoutError::InvalidMonths(subscription_months));
        }

        let user = self
            .stores
            .users
            .get_user(user_id)
            .await?
            .ok_or(CheckoutError::UserNotFound(user_id))?;

        let customer = self.get_or_create_customer(&user).await?;
        let duration = plural_months(subscription_months);

        let request = CheckoutRequest {
            customer_id: customer.stripe_customer_id,
            user_id,
            subscription_months,
            amount_cents: self.monthly_price_cents * i64::from(subscription_months),
            product_name: format!("VideoHub Premium Subscription ({})", duration),
            product_description: format!("Unlimited movie watching for {}", duration),
            success_url: success_url.unwrap_or_else(|| {
                format!(
                    "{}/payments/success?session_id={{CHECKOUT_SESSION_ID}}",
                    self.base_url
                )
            }),
            cancel_url: cancel_url
                .unwrap_or_else(|| format!("{}/payments/canceled", self.base_url)),
        };

        let session = self
            .gateway
            .create_checkout_session(&request)
            .await
            .inspect_err(|e| {
                error!(%user_id, error = %e, "Failed to create checkout session");
                metrics::counter!("stripe.api.errors").increment(1);
            })?;

        info!(
            %user_id,
            session_id = %session.session_id,
            amount_cents = request.amount_cents,
            "Created checkout session"
        );
        metrics::counter!("stripe.checkout.sessions_created").increment(1);
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plural_months() {
        assert_eq!(plural_months(1), "1 month");
        assert_eq!(plural_months(12), "12 months");
    }

    #[test]
    fn test_request_metadata() {
        let user_id = Uuid::now_v7();
        let request = CheckoutRequest {
            customer_id: "cus_1".to_string(),
            user_id,
            subscription_months: 3,
            amount_cents: 3600,
            product_name: String::new(),
            product_description: String::new(),
            success_url: String::new(),
            cancel_url: String::new(),
        };

        let metadata = request.metadata();
        assert_eq!(metadata.get("user_id"), Some(&user_id.to_string()));
        assert_eq!(metadata.get("subscription_months"), Some(&"3".to_string()));
    }

    #[test]
    fn test_user_messages() {
        assert_eq!(
            CheckoutError::InvalidMonths(13).user_message(),
            INVALID_DURATION_MESSAGE
        );
        assert_eq!(
            CheckoutError::Gateway(GatewayError::Unavailable("down".to_string())).user_message(),
            CHECKOUT_FAILED_MESSAGE
        );
    }
}
