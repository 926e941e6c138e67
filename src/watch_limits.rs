use chrono::{DateTime, NaiveDate, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Free viewing time per user per calendar day (one hour)
pub const DAILY_WATCH_LIMIT_SECONDS: i32 = 3600;

/// Quota rows older than this many days are purged
pub const WATCH_LIMIT_RETENTION_DAYS: i64 = 30;

/// Watch time consumed by one user on one (UTC) calendar day
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyWatchLimit {
    pub id: Uuid,
    pub user_id: Uuid,
    pub date: NaiveDate,
    pub watched_seconds: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Diesel model for the daily_watch_limits table
#[derive(Debug, Clone, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::daily_watch_limits)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct DailyWatchLimitModel {
    pub id: Uuid,
    pub user_id: Uuid,
    pub date: NaiveDate,
    pub watched_seconds: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Insert model for new quota rows
#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::daily_watch_limits)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct NewDailyWatchLimit {
    pub user_id: Uuid,
    pub date: NaiveDate,
    pub watched_seconds: i32,
}

impl From<DailyWatchLimitModel> for DailyWatchLimit {
    fn from(model: DailyWatchLimitModel) -> Self {
        Self {
            id: model.id,
            user_id: model.user_id,
            date: model.date,
            watched_seconds: model.watched_seconds,
            created_at: model.created_at,
            updated_at: model.updated_at,
        }
    }
}

/// Free seconds left after `watched_seconds`, floored at zero. A day's
/// total may exceed the ceiling because increments are not clamped to it.
pub fn remaining_seconds(watched_seconds: i32) -> i32 {
    DAILY_WATCH_LIMIT_SECONDS
        .saturating_sub(watched_seconds)
        .max(0)
}

/// The calendar day a quota row is keyed by
pub fn quota_date(now: DateTime<Utc>) -> NaiveDate {
    now.date_naive()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remaining_seconds_at_boundary() {
        assert_eq!(remaining_seconds(0), 3600);
        assert_eq!(remaining_seconds(3599), 1);
        assert_eq!(remaining_seconds(3600), 0);
    }

    #[test]
    fn test_overage_floors_remaining_at_zero() {
        assert_eq!(remaining_seconds(5400), 0);
        assert_eq!(remaining_seconds(i32::MAX), 0);
    }

    #[test]
    fn test_quota_date_is_utc_day() {
        let late = DateTime::parse_from_rfc3339("2026-03-01T23:59:59-05:00")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(quota_date(late), NaiveDate::from_ymd_opt(2026, 3, 2).unwrap());
    }
}
