use anyhow::Result;
use axum::{
    Router,
    body::Body,
    http::Request,
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
};
use diesel::PgConnection;
use diesel::r2d2::{ConnectionManager, Pool};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

use tower_http::cors::CorsLayer;
use tracing::{error, info};

use crate::actions;
use crate::auth::JwtService;
use crate::checkout::CheckoutService;
use crate::quota::QuotaLedger;
use crate::reconciliation::ReconciliationEngine;
use crate::store::Stores;

pub type PgPool = Pool<ConnectionManager<PgConnection>>;

#[derive(Clone)]
pub struct AppState {
    pub stores: Stores,
    pub engine: ReconciliationEngine,
    pub quota: QuotaLedger,
    pub checkout: CheckoutService,
    pub jwt: Arc<JwtService>,
    /// Absent when no Prometheus recorder is installed
    pub metrics: Option<PrometheusHandle>,
}

// Middleware for request logging with correlation ID
async fn request_logging_middleware(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let request_id = Uuid::new_v4().to_string()[..8].to_string();
    let start_time = Instant::now();

    info!("Started {} {} [{}]", method, path, request_id);

    let response = next.run(request).await;
    let duration = start_time.elapsed();
    let status = response.status();

    metrics::histogram!("http_request_duration_seconds").record(duration.as_secs_f64());
    info!(
        "Completed {} {} [{}] {} in {:.2}ms",
        method,
        path,
        request_id,
        status.as_u16(),
        duration.as_secs_f64() * 1000.0
    );

    response
}

// Middleware to capture HTTP errors to Sentry
async fn sentry_error_middleware(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();

    let response = next.run(request).await;

    if response.status().is_server_error() {
        let status = response.status();
        error!("HTTP {} error on {} {}", status.as_u16(), method, uri);

        sentry::configure_scope(|scope| {
            scope.set_tag("http.method", method.as_str());
            scope.set_tag("http.url", uri.to_string());
            scope.set_tag("http.status_code", status.as_u16().to_string());
        });

        sentry::capture_message(
            &format!("HTTP {} error on {} {}", status.as_u16(), method, uri),
            sentry::Level::Error,
        );
    }

    response
}

/// Build the application router
pub fn router(app_state: AppState) -> Router {
    Router::new()
        // Payments
        .route("/payments", get(actions::list_my_payments))
        .route("/payments/webhook", post(actions::stripe_webhook))
        .route("/payments/checkout", post(actions::create_checkout))
        .route("/payments/success", get(actions::checkout_success))
        .route("/payments/{id}", get(actions::get_payment))
        .route("/subscription", get(actions::get_my_subscription))
        // Watch quota
        .route("/watch/limit", get(actions::get_watch_limit))
        .route("/watch/check", get(actions::check_can_watch))
        .route("/watch/progress", post(actions::record_watch_progress))
        .route("/metrics", get(actions::render_metrics))
        .with_state(app_state)
        .layer(middleware::from_fn(request_logging_middleware))
        .layer(middleware::from_fn(sentry_error_middleware))
        .layer(CorsLayer::permissive())
}

pub async fn start_web_server(interface: String, port: u16, app_state: AppState) -> Result<()> {
    sentry::configure_scope(|scope| {
        scope.set_tag("operation", "web-server");
    });
    info!("Starting web server on {}:{}", interface, port);

    let app = router(app_state);

    let listener = tokio::net::TcpListener::bind(format!("{}:{}", interface, port)).await?;
    info!("Web server listening on http://{}:{}", interface, port);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Web server stopped");
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received shutdown signal (Ctrl+C), draining connections..."),
        Err(e) => {
            error!("Unable to listen for shutdown signal: {}", e);
            std::future::pending::<()>().await;
        }
    }
}
