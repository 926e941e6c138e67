//! VideoHub billing core
//!
//! Turns Stripe webhook deliveries into payment records and subscription
//! entitlements, gates the daily watch quota for non-subscribers, and runs
//! the periodic maintenance sweeps that keep billing state tidy.

pub mod actions;
pub mod auth;
pub mod checkout;
pub mod email;
pub mod maintenance;
pub mod memory_store;
pub mod metrics;
pub mod notifications;
pub mod payments;
pub mod payments_repo;
pub mod quota;
pub mod reconciliation;
pub mod schema;
pub mod store;
pub mod stripe_client;
pub mod stripe_customers;
pub mod stripe_customers_repo;
pub mod stripe_events;
pub mod stripe_webhooks;
pub mod stripe_webhooks_repo;
pub mod subscriptions;
pub mod subscriptions_repo;
pub mod users;
pub mod users_repo;
pub mod watch_limits;
pub mod watch_limits_repo;
pub mod web;
pub mod webhook_signature;

use diesel_migrations::{EmbeddedMigrations, embed_migrations};

pub use reconciliation::{ReconciliationEngine, WebhookError, WebhookOutcome};
pub use store::Stores;
pub use web::{AppState, PgPool};

// Embed migrations into the binary
pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");
