use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use diesel::PgConnection;
use diesel::r2d2::{ConnectionManager, Pool};
use std::env;
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use videohub::maintenance::MaintenanceJob;
use videohub::web::PgPool;

mod commands;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[derive(Parser)]
#[command(name = "videohub", version, about = "VideoHub billing service")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the web server, notification workers and maintenance scheduler
    Serve {
        #[arg(long, default_value = "0.0.0.0")]
        interface: String,
        #[arg(long, default_value_t = 8000)]
        port: u16,
        /// Skip the periodic maintenance jobs (run them from cron instead)
        #[arg(long)]
        no_scheduler: bool,
    },
    /// Run one maintenance job and exit
    Maintenance {
        #[arg(value_enum)]
        job: MaintenanceJob,
    },
    /// Apply pending database migrations
    Migrate,
    /// Refund a payment intent through Stripe
    Refund {
        payment_intent_id: String,
        /// Partial refund amount in cents; the full amount when omitted
        #[arg(long)]
        amount_cents: Option<i64>,
    },
}

fn init_sentry() -> Option<sentry::ClientInitGuard> {
    let dsn = env::var("SENTRY_DSN").ok().filter(|dsn| !dsn.is_empty())?;
    let environment = env::var("VIDEOHUB_ENV").unwrap_or_else(|_| "development".to_string());

    Some(sentry::init((
        dsn,
        sentry::ClientOptions {
            release: sentry::release_name!(),
            environment: Some(environment.into()),
            ..Default::default()
        },
    )))
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(sentry_tracing::layer())
        .init();
}

fn create_pool() -> Result<PgPool> {
    let database_url = env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let max_size: u32 = env::var("DATABASE_POOL_SIZE")
        .unwrap_or_else(|_| "10".to_string())
        .parse()
        .context("DATABASE_POOL_SIZE must be a valid number")?;

    let manager = ConnectionManager::<PgConnection>::new(database_url);
    let pool = Pool::builder()
        .max_size(max_size)
        .build(manager)
        .context("Failed to create database connection pool")?;
    info!("Connected to PostgreSQL (pool size {})", max_size);
    Ok(pool)
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Sentry must be initialized before the runtime starts
    let _sentry_guard = init_sentry();
    init_tracing();

    let cli = Cli::parse();
    let pool = create_pool()?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?
        .block_on(run(cli, pool))
}

async fn run(cli: Cli, pool: PgPool) -> Result<()> {
    match cli.command {
        Commands::Serve {
            interface,
            port,
            no_scheduler,
        } => commands::handle_serve(interface, port, no_scheduler, pool).await,
        Commands::Maintenance { job } => commands::handle_maintenance(pool, job).await,
        Commands::Migrate => commands::handle_migrate(pool).await,
        Commands::Refund {
            payment_intent_id,
            amount_cents,
        } => commands::handle_refund(pool, payment_intent_id, amount_cents).await,
    }
}
