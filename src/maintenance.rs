//! Periodic sweeps over billing state.
//!
//! Each job is callable on its own (for the CLI and tests) and runs on its
//! own interval under [`MaintenanceScheduler`].

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, warn};

use crate::notifications::Notifier;
use crate::payments::STALE_PENDING_HOURS;
use crate::store::Stores;
use crate::watch_limits::{WATCH_LIMIT_RETENTION_DAYS, quota_date};

/// Reminders go to subscriptions ending between 3 and 4 days from now
const REMINDER_LEAD_DAYS: i64 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum MaintenanceJob {
    ExpireSubscriptions,
    PurgePendingPayments,
    PurgeQuotaRows,
    SendExpiryReminders,
}

impl MaintenanceJob {
    pub fn as_str(self) -> &'static str {
        match self {
            MaintenanceJob::ExpireSubscriptions => "expire_subscriptions",
            MaintenanceJob::PurgePendingPayments => "purge_pending_payments",
            MaintenanceJob::PurgeQuotaRows => "purge_quota_rows",
            MaintenanceJob::SendExpiryReminders => "send_expiry_reminders",
        }
    }
}

#[derive(Clone)]
pub struct MaintenanceJobs {
    stores: Stores,
    notifier: Arc<dyn Notifier>,
}

impl MaintenanceJobs {
    pub fn new(stores: Stores, notifier: Arc<dyn Notifier>) -> Self {
        Self { stores, notifier }
    }

    /// Run one job now, returning how many rows or recipients it touched
    pub async fn run(&self, job: MaintenanceJob) -> Result<usize> {
        self.run_at(job, Utc::now()).await
    }

    pub async fn run_at(&self, job: MaintenanceJob, now: DateTime<Utc>) -> Result<usize> {
        let start = std::time::Instant::now();
        let result = match job {
            MaintenanceJob::ExpireSubscriptions => self.expire_subscriptions_at(now).await,
            MaintenanceJob::PurgePendingPayments => self.purge_stale_pending_payments_at(now).await,
            MaintenanceJob::PurgeQuotaRows => {
                self.purge_old_quota_rows_at(WATCH_LIMIT_RETENTION_DAYS, now)
                    .await
            }
            MaintenanceJob::SendExpiryReminders => self.send_expiry_reminders_at(now).await,
        };

        metrics::histogram!("maintenance.duration_ms", "job" => job.as_str())
            .record(start.elapsed().as_millis() as f64);
        match &result {
            Ok(count) => {
                metrics::counter!("maintenance.rows", "job" => job.as_str())
                    .increment(*count as u64);
            }
            Err(_) => metrics::counter!("maintenance.failed", "job" => job.as_str()).increment(1),
        }
        result
    }

    /// Deactivate active subscriptions whose end date has passed
    pub async fn expire_subscriptions_at(&self, now: DateTime<Utc>) -> Result<usize> {
        let count = self
            .stores
            .subscriptions
            .deactivate_expired(now)
            .await
            .context("deactivating expired subscriptions")?;
        info!("Deactivated {} expired subscriptions", count);
        Ok(count)
    }

    /// Delete pending payments older than 24 hours
    pub async fn purge_stale_pending_payments_at(&self, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = now - Duration::hours(STALE_PENDING_HOURS);
        let count = self
            .stores
            .payments
            .delete_stale_pending(cutoff)
            .await
            .context("purging stale pending payments")?;
        info!("Cleaned up {} old pending payments", count);
        Ok(count)
    }

    /// Delete quota rows dated before `today - retention_days`
    pub async fn purge_old_quota_rows_at(
        &self,
        retention_days: i64,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let cutoff = quota_date(now) - Duration::days(retention_days);
        let count = self
            .stores
            .watch_limits
            .delete_before(cutoff)
            .await
            .context("purging old watch limit rows")?;
        info!("Deleted {} watch limit rows dated before {}", count, cutoff);
        Ok(count)
    }

    /// Remind users whose subscription ends in `[now + 3d, now + 4d)`.
    ///
    /// Returns the number of reminders sent. A failure for one recipient is
    /// logged and does not stop the others.
    pub async fn send_expiry_reminders_at(&self, now: DateTime<Utc>) -> Result<usize> {
        let from = now + Duration::days(REMINDER_LEAD_DAYS);
        let to = from + Duration::days(1);
        let expiring = self
            .stores
            .subscriptions
            .active_ending_between(from, to)
            .await
            .context("loading expiring subscriptions")?;

        let mut sent = 0;
        for subscription in &expiring {
            let user = match self.stores.users.get_user(subscription.user_id).await {
                Ok(Some(user)) => user,
                Ok(None) => {
                    debug!(user_id = %subscription.user_id, "Skipping reminder for unknown user");
                    continue;
                }
                Err(e) => {
                    warn!(user_id = %subscription.user_id, error = %e, "Failed to load user for reminder");
                    continue;
                }
            };

            match self.notifier.send_expiry_reminder(&user, subscription).await {
                Ok(()) => sent += 1,
                Err(e) => {
                    warn!(user_id = %user.id, error = %e, "Failed to send expiry reminder");
                }
            }
        }

        info!("Sent {} subscription expiry reminders", sent);
        Ok(sent)
    }
}

/// Interval per job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaintenanceSchedule {
    pub expire_subscriptions: std::time::Duration,
    pub purge_pending_payments: std::time::Duration,
    pub purge_quota_rows: std::time::Duration,
    pub send_expiry_reminders: std::time::Duration,
}

const HOURLY: std::time::Duration = std::time::Duration::from_secs(60 * 60);
const DAILY: std::time::Duration = std::time::Duration::from_secs(24 * 60 * 60);

impl Default for MaintenanceSchedule {
    fn default() -> Self {
        Self {
            expire_subscriptions: HOURLY,
            purge_pending_payments: HOURLY,
            purge_quota_rows: DAILY,
            send_expiry_reminders: DAILY,
        }
    }
}

fn interval_from_env(name: &str, default: std::time::Duration) -> Result<std::time::Duration> {
    match std::env::var(name) {
        Ok(value) => {
            let secs: u64 = value
                .parse()
                .with_context(|| format!("{} must be a number of seconds", name))?;
            anyhow::ensure!(secs > 0, "{} must be greater than zero", name);
            Ok(std::time::Duration::from_secs(secs))
        }
        Err(_) => Ok(default),
    }
}

impl MaintenanceSchedule {
    /// Defaults overridden by `MAINTENANCE_*_INTERVAL_SECS`
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            expire_subscriptions: interval_from_env(
                "MAINTENANCE_EXPIRE_INTERVAL_SECS",
                defaults.expire_subscriptions,
            )?,
            purge_pending_payments: interval_from_env(
                "MAINTENANCE_PENDING_PURGE_INTERVAL_SECS",
                defaults.purge_pending_payments,
            )?,
            purge_quota_rows: interval_from_env(
                "MAINTENANCE_QUOTA_PURGE_INTERVAL_SECS",
                defaults.purge_quota_rows,
            )?,
            send_expiry_reminders: interval_from_env(
                "MAINTENANCE_REMINDER_INTERVAL_SECS",
                defaults.send_expiry_reminders,
            )?,
        })
    }

    fn interval_for(&self, job: MaintenanceJob) -> std::time::Duration {
        match job {
            MaintenanceJob::ExpireSubscriptions => self.expire_subscriptions,
            MaintenanceJob::PurgePendingPayments => self.purge_pending_payments,
            MaintenanceJob::PurgeQuotaRows => self.purge_quota_rows,
            MaintenanceJob::SendExpiryReminders => self.send_expiry_reminders,
        }
    }
}

pub struct MaintenanceScheduler {
    jobs: MaintenanceJobs,
    schedule: MaintenanceSchedule,
}

impl MaintenanceScheduler {
    pub fn new(jobs: MaintenanceJobs, schedule: MaintenanceSchedule) -> Self {
        Self { jobs, schedule }
    }

    /// Spawn one loop per job. The first run happens immediately.
    pub fn spawn(self) -> Vec<JoinHandle<()>> {
        [
            MaintenanceJob::ExpireSubscriptions,
            MaintenanceJob::PurgePendingPayments,
            MaintenanceJob::PurgeQuotaRows,
            MaintenanceJob::SendExpiryReminders,
        ]
        .into_iter()
        .map(|job| {
            let jobs = self.jobs.clone();
            let period = self.schedule.interval_for(job);

            tokio::spawn(
                async move {
                    let mut interval = tokio::time::interval(period);
                    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                    loop {
                        interval.tick().await;
                        if let Err(e) = jobs.run(job).await {
                            error!("Maintenance job {} failed: {:#}", job.as_str(), e);
                        }
                    }
                }
                .instrument(tracing::info_span!("maintenance", job = job.as_str())),
            )
        })
        .collect()
    }
}
