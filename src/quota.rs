use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::store::Stores;
use crate::watch_limits::{quota_date, remaining_seconds};

pub const LOGIN_REQUIRED_MESSAGE: &str = "Please login to watch movies";
pub const LIMIT_REACHED_MESSAGE: &str = "Daily watch limit reached. Subscribe to watch unlimited!";

/// Largest watch time a single progress report can add (one day)
pub const MAX_WATCH_REPORT_SECONDS: i32 = 24 * 60 * 60;

/// What a user may still watch today
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchAllowance {
    pub watched_seconds: i32,
    /// `None` means unlimited
    pub remaining_seconds: Option<i32>,
    pub unlimited: bool,
}

impl WatchAllowance {
    fn unlimited() -> Self {
        Self {
            watched_seconds: 0,
            remaining_seconds: None,
            unlimited: true,
        }
    }

    fn metered(watched_seconds: i32) -> Self {
        Self {
            watched_seconds,
            remaining_seconds: Some(remaining_seconds(watched_seconds)),
            unlimited: false,
        }
    }

    pub fn can_watch(&self) -> bool {
        self.unlimited || self.remaining_seconds.is_some_and(|remaining| remaining > 0)
    }
}

/// Whether playback may start, with a message for the viewer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WatchDecision {
    pub allowed: bool,
    pub reason: String,
}

fn remaining_message(remaining_seconds: i32) -> String {
    format!("You have {} minutes remaining today", remaining_seconds / 60)
}

/// Daily watch-time accounting for viewers without a subscription
#[derive(Clone)]
pub struct QuotaLedger {
    stores: Stores,
}

impl QuotaLedger {
    pub fn new(stores: Stores) -> Self {
        Self { stores }
    }

    async fn has_subscription(&self, user_id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let subscription = self.stores.subscriptions.get_by_user(user_id).await?;
        Ok(subscription.is_some_and(|s| s.grants_access_at(now)))
    }

    pub async fn check_and_gate(&self, user_id: Uuid) -> Result<WatchAllowance> {
        self.check_and_gate_at(user_id, Utc::now()).await
    }

    /// Subscribers are unlimited; everyone else gets today's row, created
    /// on first access
    pub async fn check_and_gate_at(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<WatchAllowance> {
        if self.has_subscription(user_id, now).await? {
            return Ok(WatchAllowance::unlimited());
        }

        let today = self
            .stores
            .watch_limits
            .get_or_create(user_id, quota_date(now))
            .await?;
        Ok(WatchAllowance::metered(today.watched_seconds))
    }

    pub async fn can_watch(&self, user_id: Option<Uuid>) -> Result<WatchDecision> {
        self.can_watch_at(user_id, Utc::now()).await
    }

    pub async fn can_watch_at(
        &self,
        user_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<WatchDecision> {
        let Some(user_id) = user_id else {
            return Ok(WatchDecision {
                allowed: false,
                reason: LOGIN_REQUIRED_MESSAGE.to_string(),
            });
        };

        let allowance = self.check_and_gate_at(user_id, now).await?;
        Ok(decision_for(&allowance))
    }

    pub async fn record_watch_time(&self, user_id: Uuid, seconds: i32) -> Result<()> {
        self.record_watch_time_at(user_id, seconds, Utc::now())
            .await
    }

    /// Add watched seconds to today's counter. The total may go past the
    /// daily ceiling; only the gate enforces it. A single report counts for
    /// at most [`MAX_WATCH_REPORT_SECONDS`].
    pub async fn record_watch_time_at(
        &self,
        user_id: Uuid,
        seconds: i32,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if seconds <= 0 {
            debug!(%user_id, seconds, "Ignoring non-positive watch time");
            return Ok(());
        }
        if self.has_subscription(user_id, now).await? {
            return Ok(());
        }
        if seconds > MAX_WATCH_REPORT_SECONDS {
            warn!(%user_id, seconds, "Watch time report exceeds a day, capping");
        }
        let seconds = seconds.min(MAX_WATCH_REPORT_SECONDS);

        let row = self
            .stores
            .watch_limits
            .add_watch_time(user_id, quota_date(now), seconds)
            .await?;
        debug!(%user_id, watched_seconds = row.watched_seconds, "Recorded watch time");
        metrics::counter!("watch.seconds_recorded").increment(seconds as u64);
        Ok(())
    }
}

/// Viewer-facing decision for an authenticated user's allowance
pub fn decision_for(allowance: &WatchAllowance) -> WatchDecision {
    match allowance.remaining_seconds {
        None => WatchDecision {
            allowed: true,
            reason: String::new(),
        },
        Some(remaining) if remaining > 0 => WatchDecision {
            allowed: true,
            reason: remaining_message(remaining),
        },
        Some(_) => WatchDecision {
            allowed: false,
            reason: LIMIT_REACHED_MESSAGE.to_string(),
        },
    }
}
