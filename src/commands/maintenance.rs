use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;

use videohub::email::EmailService;
use videohub::maintenance::{MaintenanceJob, MaintenanceJobs};
use videohub::store::Stores;
use videohub::web::PgPool;

/// Run a single maintenance job and exit
pub async fn handle_maintenance(pool: PgPool, job: MaintenanceJob) -> Result<()> {
    sentry::configure_scope(|scope| {
        scope.set_tag("operation", "maintenance");
        scope.set_tag("job", job.as_str());
    });

    let notifier = Arc::new(EmailService::new().context("Failed to configure email service")?);
    let jobs = MaintenanceJobs::new(Stores::postgres(pool), notifier);

    let count = jobs
        .run(job)
        .await
        .with_context(|| format!("Maintenance job {} failed", job.as_str()))?;
    info!("Maintenance job {} finished ({} rows)", job.as_str(), count);
    Ok(())
}
