use anyhow::{Context, Result};
use std::env;
use std::sync::Arc;
use tracing::{error, info};

use videohub::auth::JwtService;
use videohub::checkout::{CheckoutService, StripeGateway};
use videohub::email::EmailService;
use videohub::maintenance::{MaintenanceJobs, MaintenanceSchedule, MaintenanceScheduler};
use videohub::notifications::{
    DEFAULT_NOTIFICATION_WORKERS, NotificationQueue, NotificationWorker, Notifier, RetryPolicy,
};
use videohub::quota::QuotaLedger;
use videohub::reconciliation::ReconciliationEngine;
use videohub::store::Stores;
use videohub::stripe_client::StripeConfig;
use videohub::web::{AppState, PgPool, start_web_server};

use super::run_migrations;

/// Serve HTTP with the notification workers and the maintenance scheduler
pub async fn handle_serve(
    interface: String,
    port: u16,
    no_scheduler: bool,
    pool: PgPool,
) -> Result<()> {
    let videohub_env = env::var("VIDEOHUB_ENV").unwrap_or_default();
    info!(
        "Environment: {}",
        if videohub_env.is_empty() {
            "development"
        } else {
            videohub_env.as_str()
        }
    );

    // Install the recorder before zeroing metrics so they are registered
    let metrics_handle = videohub::metrics::init_metrics()?;
    videohub::metrics::initialize_billing_metrics();
    tokio::spawn(videohub::metrics::process_metrics_task());

    let applied = run_migrations(pool.clone()).await?;
    info!("Database schema up to date ({} migrations applied)", applied);

    let stripe_config = StripeConfig::from_env()?;
    info!(?stripe_config, "Loaded Stripe configuration");
    let jwt = Arc::new(JwtService::from_env()?);
    let notifier: Arc<dyn Notifier> =
        Arc::new(EmailService::new().context("Failed to configure email service")?);

    let stores = Stores::postgres(pool);

    let num_workers = match env::var("NOTIFICATION_WORKERS") {
        Ok(value) => value
            .parse::<usize>()
            .context("NOTIFICATION_WORKERS must be a positive number")?
            .max(1),
        Err(_) => DEFAULT_NOTIFICATION_WORKERS,
    };
    let (notifications, notification_rx) = NotificationQueue::new();
    NotificationWorker::new(stores.clone(), notifier.clone(), RetryPolicy::default())
        .spawn(notification_rx, num_workers);

    if no_scheduler {
        info!("Maintenance scheduler disabled");
    } else {
        let schedule = MaintenanceSchedule::from_env()?;
        info!(?schedule, "Starting maintenance scheduler");
        let handles =
            MaintenanceScheduler::new(MaintenanceJobs::new(stores.clone(), notifier), schedule)
                .spawn();
        // Monitor the scheduler loops so we know if one dies
        for handle in handles {
            tokio::spawn(async move {
                if let Err(e) = handle.await {
                    error!("Maintenance task panicked: {}", e);
                }
            });
        }
    }

    let engine = ReconciliationEngine::from_config(stores.clone(), notifications, &stripe_config);
    let gateway = Arc::new(StripeGateway::new(&stripe_config));
    let checkout = CheckoutService::from_config(stores.clone(), gateway, &stripe_config);

    let app_state = AppState {
        quota: QuotaLedger::new(stores.clone()),
        stores,
        engine,
        checkout,
        jwt,
        metrics: Some(metrics_handle),
    };

    start_web_server(interface, port, app_state).await
}
