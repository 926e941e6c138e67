use anyhow::{Context, Result};
use diesel_migrations::MigrationHarness;
use tracing::info;

use videohub::MIGRATIONS;
use videohub::web::PgPool;

/// Apply pending embedded migrations, returning how many ran
pub async fn run_migrations(pool: PgPool) -> Result<usize> {
    tokio::task::spawn_blocking(move || {
        let mut conn = pool.get().context("Failed to get connection for migrations")?;
        let applied = conn
            .run_pending_migrations(MIGRATIONS)
            .map_err(|e| anyhow::anyhow!("Failed to run database migrations: {}", e))?;
        for version in &applied {
            info!("Applied migration {}", version);
        }
        Ok::<usize, anyhow::Error>(applied.len())
    })
    .await?
}

pub async fn handle_migrate(pool: PgPool) -> Result<()> {
    info!("Running database migrations...");
    let applied = run_migrations(pool).await?;
    info!("Database migrations completed ({} applied)", applied);
    Ok(())
}
