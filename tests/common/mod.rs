//! Common test utilities
//!
//! `fixtures` builds in-memory services, signed webhook payloads and fake
//! collaborators. `TestDatabase` creates an isolated PostgreSQL database per
//! test from the `videohub_test_template` template database; tests using it
//! are `#[ignore]`d and need `TEST_DATABASE_URL` (default
//! `postgresql://localhost/videohub_test`).
#![allow(dead_code)]

pub mod fixtures;

use anyhow::{Context, Result};
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool};
use diesel_migrations::MigrationHarness;
use std::sync::Once;
use std::thread;
use std::time::Duration;

use videohub::MIGRATIONS;
use videohub::web::PgPool;

const TEMPLATE_NAME: &str = "videohub_test_template";

// Ensure migrations only run once per test session
static MIGRATIONS_RUN: Once = Once::new();

fn base_url() -> String {
    dotenvy::dotenv().ok();
    std::env::var("TEST_DATABASE_URL")
        .unwrap_or_else(|_| "postgresql://localhost/videohub_test".to_string())
}

fn admin_url(base_url: &str) -> String {
    base_url.replace("/videohub_test", "/postgres")
}

/// Ensures the template database exists and has the latest migrations applied
fn ensure_template_migrated() {
    MIGRATIONS_RUN.call_once(|| {
        let base_url = base_url();
        let admin_url = admin_url(&base_url);
        let template_url = base_url.replace("/videohub_test", &format!("/{}", TEMPLATE_NAME));

        if let Ok(mut admin_conn) = PgConnection::establish(&admin_url) {
            let exists: Result<bool, _> = diesel::sql_query(format!(
                "SELECT EXISTS(SELECT 1 FROM pg_database WHERE datname = '{}')",
                TEMPLATE_NAME
            ))
            .get_result::<TemplateExists>(&mut admin_conn)
            .map(|r| r.exists);

            if exists != Ok(true) {
                let _ = diesel::sql_query(format!("CREATE DATABASE {}", TEMPLATE_NAME))
                    .execute(&mut admin_conn);
            }

            // Unmark as template temporarily to allow connections for migrations
            let _ = diesel::sql_query(format!(
                "UPDATE pg_database SET datistemplate = FALSE, datallowconn = TRUE \
                 WHERE datname = '{}'",
                TEMPLATE_NAME
            ))
            .execute(&mut admin_conn);
        }

        if let Ok(mut template_conn) = PgConnection::establish(&template_url) {
            match template_conn.run_pending_migrations(MIGRATIONS) {
                Ok(applied) => {
                    if !applied.is_empty() {
                        eprintln!("Applied {} migration(s) to test template", applied.len());
                    }
                }
                Err(e) => {
                    eprintln!("Warning: Failed to run migrations on template: {}", e);
                }
            }
            drop(template_conn);
        }

        // Give PostgreSQL time to release the template connection
        thread::sleep(Duration::from_millis(50));

        if let Ok(mut admin_conn) = PgConnection::establish(&admin_url) {
            let _ = diesel::sql_query(format!(
                "UPDATE pg_database SET datistemplate = TRUE, datallowconn = FALSE \
                 WHERE datname = '{}'",
                TEMPLATE_NAME
            ))
            .execute(&mut admin_conn);
        }
    });
}

#[derive(QueryableByName)]
struct TemplateExists {
    #[diesel(sql_type = diesel::sql_types::Bool)]
    exists: bool,
}

/// An isolated database cloned from the template, dropped with the value.
///
/// Requires PostgreSQL 13+ for `DROP DATABASE ... WITH (FORCE)`.
pub struct TestDatabase {
    db_name: String,
    pool: PgPool,
    admin_url: String,
}

impl TestDatabase {
    pub async fn new() -> Result<Self> {
        ensure_template_migrated();

        let base_url = base_url();
        let admin_url = admin_url(&base_url);
        let db_name = format!("videohub_test_{}", uuid::Uuid::new_v4().simple());

        Self::create_database(&admin_url, &db_name)
            .await
            .context("Failed to create test database from template")?;

        let test_db_url = base_url.replace("/videohub_test", &format!("/{}", db_name));
        let manager = ConnectionManager::<PgConnection>::new(&test_db_url);
        let pool = Pool::builder()
            .max_size(10)
            .build(manager)
            .with_context(|| format!("Failed to create connection pool for {}", db_name))?;

        Ok(TestDatabase {
            db_name,
            pool,
            admin_url,
        })
    }

    pub fn pool(&self) -> PgPool {
        self.pool.clone()
    }

    pub fn name(&self) -> &str {
        &self.db_name
    }

    async fn create_database(admin_url: &str, db_name: &str) -> Result<()> {
        let admin_url = admin_url.to_string();
        let db_name = db_name.to_string();

        tokio::task::spawn_blocking(move || {
            let mut conn = PgConnection::establish(&admin_url).context(
                "Failed to connect to PostgreSQL for database creation. Is PostgreSQL running?",
            )?;

            // Cloning fails while anything is connected to the template
            diesel::sql_query(format!(
                "SELECT pg_terminate_backend(pid) FROM pg_stat_activity \
                 WHERE datname = '{}' AND pid <> pg_backend_pid()",
                TEMPLATE_NAME
            ))
            .execute(&mut conn)
            .context("Failed to terminate connections to template database")?;

            // db_name is a generated uuid, safe to interpolate
            diesel::sql_query(format!(
                "CREATE DATABASE \"{}\" TEMPLATE {}",
                db_name, TEMPLATE_NAME
            ))
            .execute(&mut conn)
            .with_context(|| format!("Failed to create database '{}' from template", db_name))?;

            Ok::<(), anyhow::Error>(())
        })
        .await
        .context("Database creation task panicked")?
    }
}

impl Drop for TestDatabase {
    fn drop(&mut self) {
        let Ok(mut conn) = PgConnection::establish(&self.admin_url) else {
            eprintln!(
                "Warning: Failed to drop test database '{}'. \
                 You may need to manually clean up: DROP DATABASE {};",
                self.db_name, self.db_name
            );
            return;
        };
        let _ = diesel::sql_query(format!(
            "DROP DATABASE IF EXISTS \"{}\" WITH (FORCE)",
            self.db_name
        ))
        .execute(&mut conn);
    }
}
