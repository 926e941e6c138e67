use anyhow::{Context, Result};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::{Duration, Instant};

/// Install the Prometheus recorder.
/// Returns a handle that renders the scrape body for `/metrics`.
pub fn init_metrics() -> Result<PrometheusHandle> {
    PrometheusBuilder::new()
        // Buckets: 1ms, 5ms, 10ms, 25ms, 50ms, 100ms, 250ms, 500ms, 1s, 2.5s, 5s, 10s
        .set_buckets_for_metric(
            Matcher::Full("http_request_duration_seconds".to_string()),
            &[
                0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
            ],
        )
        .context("failed to set buckets for http_request_duration_seconds")?
        .install_recorder()
        .context("failed to install Prometheus recorder")
}

/// Background task to update process metrics
/// Updates uptime and memory usage metrics every 5 seconds
pub async fn process_metrics_task() {
    let start_time = Instant::now();

    loop {
        metrics::gauge!("process.uptime.seconds").set(start_time.elapsed().as_secs() as f64);
        metrics::gauge!("process.is_up").set(1.0);

        #[cfg(target_os = "linux")]
        {
            if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
                for line in status.lines() {
                    if line.starts_with("VmRSS:") {
                        if let Some(kb_str) = line.split_whitespace().nth(1)
                            && let Ok(kb) = kb_str.parse::<f64>()
                        {
                            metrics::gauge!("process.memory.bytes").set(kb * 1024.0);
                        }
                        break;
                    }
                }
            }
        }

        tokio::time::sleep(Duration::from_secs(5)).await;
    }
}

/// Initialize billing metrics to zero so they appear in Prometheus queries
/// even before any event occurs
pub fn initialize_billing_metrics() {
    // Webhook intake
    metrics::counter!("stripe.webhook.received").absolute(0);
    metrics::counter!("stripe.webhook.signature_invalid").absolute(0);
    metrics::counter!("stripe.webhook.processed").absolute(0);
    metrics::counter!("stripe.webhook.duplicate").absolute(0);
    metrics::counter!("stripe.webhook.failed").absolute(0);

    // Payments and entitlements
    metrics::counter!("stripe.payments.succeeded").absolute(0);
    metrics::counter!("stripe.payments.failed").absolute(0);
    metrics::counter!("stripe.payments.refunded").absolute(0);
    metrics::counter!("subscriptions.activated").absolute(0);
    metrics::counter!("stripe.checkout.sessions_created").absolute(0);
    metrics::counter!("stripe.api.errors").absolute(0);

    // Notifications
    metrics::counter!("notifications.sent").absolute(0);
    metrics::counter!("notifications.failed").absolute(0);
    metrics::counter!("notifications.enqueued").absolute(0);
    metrics::counter!("notifications.dropped").absolute(0);
    metrics::gauge!("notifications.queue_depth").set(0.0);

    // Watch quota
    metrics::counter!("watch.seconds_recorded").absolute(0);
}
