use anyhow::Result;
use async_trait::async_trait;
use lettre::{
    AsyncSmtpTransport, AsyncTransport, Tokio1Executor,
    message::{Mailbox, Message, header::ContentType},
    transport::smtp::{authentication::Credentials, client::TlsParametersBuilder},
};

use crate::notifications::Notifier;
use crate::payments::Payment;
use crate::subscriptions::Subscription;
use crate::users::User;

/// Get the staging prefix for email subjects
/// Returns "[STAGING] " if VIDEOHUB_ENV=staging, empty string otherwise
fn get_staging_prefix() -> &'static str {
    match std::env::var("VIDEOHUB_ENV").unwrap_or_default().as_str() {
        "staging" => "[STAGING] ",
        _ => "",
    }
}

/// Create a properly formatted Mailbox with display name
fn create_mailbox(name: &str, email: &str) -> Result<Mailbox> {
    let address = email.parse()?;
    Ok(Mailbox::new(Some(name.to_string()), address))
}

pub struct EmailService {
    mailer: AsyncSmtpTransport<Tokio1Executor>,
    from_email: String,
    from_name: String,
    base_url: String,
}

impl EmailService {
    pub fn new() -> Result<Self> {
        let smtp_server = std::env::var("SMTP_SERVER")
            .map_err(|_| anyhow::anyhow!("SMTP_SERVER environment variable not set"))?;

        let smtp_port: u16 = std::env::var("SMTP_PORT")
            .unwrap_or_else(|_| "587".to_string())
            .parse()
            .map_err(|_| anyhow::anyhow!("Invalid SMTP_PORT"))?;

        let smtp_username = std::env::var("SMTP_USERNAME")
            .map_err(|_| anyhow::anyhow!("SMTP_USERNAME environment variable not set"))?;

        let smtp_password = std::env::var("SMTP_PASSWORD")
            .map_err(|_| anyhow::anyhow!("SMTP_PASSWORD environment variable not set"))?;

        let from_email = std::env::var("FROM_EMAIL")
            .map_err(|_| anyhow::anyhow!("FROM_EMAIL environment variable not set"))?;

        let from_name = std::env::var("FROM_NAME").unwrap_or_else(|_| "VideoHub".to_string());

        let base_url =
            std::env::var("BASE_URL").unwrap_or_else(|_| "http://localhost:3000".to_string());

        let creds = Credentials::new(smtp_username, smtp_password);

        // Port 1025 is a local capture server (Mailpit) without TLS, 465 is
        // implicit TLS, anything else upgrades with STARTTLS
        let mailer = if smtp_port == 1025 {
            tracing::info!("Using insecure SMTP connection for port 1025 (Mailpit) without TLS");
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&smtp_server)
                .port(smtp_port)
                .tls(lettre::transport::smtp::client::Tls::None)
                .build()
        } else if smtp_port == 465 {
            tracing::info!("Using implicit TLS (SMTPS) for port 465");
            let tls_params = TlsParametersBuilder::new(smtp_server.clone())
                .build()
                .map_err(|e| anyhow::anyhow!("Failed to create TLS parameters: {}", e))?;
            AsyncSmtpTransport::<Tokio1Executor>::relay(&smtp_server)?
                .port(smtp_port)
                .credentials(creds)
                .tls(lettre::transport::smtp::client::Tls::Wrapper(tls_params))
                .build()
        } else {
            tracing::info!("Using STARTTLS for port {}", smtp_port);
            let tls_params = TlsParametersBuilder::new(smtp_server.clone())
                .build()
                .map_err(|e| anyhow::anyhow!("Failed to create TLS parameters: {}", e))?;
            AsyncSmtpTransport::<Tokio1Executor>::relay(&smtp_server)?
                .port(smtp_port)
                .credentials(creds)
                .tls(lettre::transport::smtp::client::Tls::Required(tls_params))
                .build()
        };

        Ok(Self {
            mailer,
            from_email,
            from_name,
            base_url,
        })
    }

    async fn send_plain(&self, user: &User, subject: String, body: String) -> Result<()> {
        let email = Message::builder()
            .from(create_mailbox(&self.from_name, &self.from_email)?)
            .to(create_mailbox(&user.display_name(), &user.email)?)
            .subject(subject)
            .header(ContentType::TEXT_PLAIN)
            .body(body)?;

        self.mailer.send(email).await?;
        Ok(())
    }
}

fn confirmation_body(
    user: &User,
    payment: &Payment,
    subscription: &Subscription,
    days_remaining: i64,
    base_url: &str,
) -> String {
    format!(
        r#"Hello {},

Thank you for your purchase! Your VideoHub Premium subscription is now active.

Plan: {}
Amount paid: {} {}
Valid until: {}
Days remaining: {}

You can now watch without a daily limit:
{}

Best regards,
The VideoHub Team"#,
        user.display_name(),
        payment.description,
        payment.amount,
        payment.currency,
        subscription.end_date.format("%B %-d, %Y"),
        days_remaining,
        base_url
    )
}

fn reminder_body(
    user: &User,
    subscription: &Subscription,
    days_remaining: i64,
    base_url: &str,
) -> String {
    format!(
        r#"Hello {},

Your VideoHub Premium subscription expires on {} ({} days remaining).

Renew now to keep watching without a daily limit:
{}/payments/checkout

Best regards,
The VideoHub Team"#,
        user.display_name(),
        subscription.end_date.format("%B %-d, %Y"),
        days_remaining,
        base_url
    )
}

#[async_trait]
impl Notifier for EmailService {
    async fn send_subscription_confirmation(
        &self,
        user: &User,
        payment: &Payment,
        subscription: &Subscription,
    ) -> Result<()> {
        let subject = format!(
            "{}VideoHub Premium Subscription Activated",
            get_staging_prefix()
        );
        let days_remaining = subscription.days_remaining_at(chrono::Utc::now());
        let body = confirmation_body(user, payment, subscription, days_remaining, &self.base_url);

        self.send_plain(user, subject, body).await
    }

    async fn send_expiry_reminder(&self, user: &User, subscription: &Subscription) -> Result<()> {
        let subject = format!(
            "{}Your VideoHub Subscription is Expiring Soon",
            get_staging_prefix()
        );
        let days_remaining = subscription.days_remaining_at(chrono::Utc::now());
        let body = reminder_body(user, subscription, days_remaining, &self.base_url);

        self.send_plain(user, subject, body).await
    }
}
