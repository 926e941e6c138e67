use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDate;
use diesel::prelude::*;
use uuid::Uuid;

use crate::schema::daily_watch_limits;
use crate::store::WatchLimitStore;
use crate::watch_limits::{DailyWatchLimit, DailyWatchLimitModel, NewDailyWatchLimit};
use crate::web::PgPool;

#[derive(Clone)]
pub struct WatchLimitsRepository {
    pool: PgPool,
}

impl WatchLimitsRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Fetch the user's row for `date`, inserting an empty one if missing
    pub async fn get_or_create(&self, user_id: Uuid, date: NaiveDate) -> Result<DailyWatchLimit> {
        let pool = self.pool.clone();
        let result = tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;

            diesel::insert_into(daily_watch_limits::table)
                .values(&NewDailyWatchLimit {
                    user_id,
                    date,
                    watched_seconds: 0,
                })
                .on_conflict((daily_watch_limits::user_id, daily_watch_limits::date))
                .do_nothing()
                .execute(&mut conn)?;

            let row: DailyWatchLimitModel = daily_watch_limits::table
                .filter(daily_watch_limits::user_id.eq(user_id))
                .filter(daily_watch_limits::date.eq(date))
                .select(DailyWatchLimitModel::as_select())
                .first(&mut conn)?;

            Ok::<DailyWatchLimitModel, anyhow::Error>(row)
        })
        .await??;

        Ok(result.into())
    }

    /// Atomically add seconds to the day's counter
    pub async fn add_watch_time(
        &self,
        user_id: Uuid,
        date: NaiveDate,
        seconds: i32,
    ) -> Result<DailyWatchLimit> {
        let pool = self.pool.clone();
        let result = tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;

            let row: DailyWatchLimitModel = diesel::insert_into(daily_watch_limits::table)
                .values(&NewDailyWatchLimit {
                    user_id,
                    date,
                    watched_seconds: seconds,
                })
                .on_conflict((daily_watch_limits::user_id, daily_watch_limits::date))
                .do_update()
                .set((
                    daily_watch_limits::watched_seconds
                        .eq(daily_watch_limits::watched_seconds + seconds),
                    daily_watch_limits::updated_at.eq(diesel::dsl::now),
                ))
                .returning(DailyWatchLimitModel::as_returning())
                .get_result(&mut conn)?;

            Ok::<DailyWatchLimitModel, anyhow::Error>(row)
        })
        .await??;

        Ok(result.into())
    }

    pub async fn delete_before(&self, date: NaiveDate) -> Result<usize> {
        let pool = self.pool.clone();
        let deleted = tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;

            let deleted = diesel::delete(
                daily_watch_limits::table.filter(daily_watch_limits::date.lt(date)),
            )
            .execute(&mut conn)?;

            Ok::<usize, anyhow::Error>(deleted)
        })
        .await??;

        Ok(deleted)
    }
}

#[async_trait]
impl WatchLimitStore for WatchLimitsRepository {
    async fn get_or_create(&self, user_id: Uuid, date: NaiveDate) -> Result<DailyWatchLimit> {
        self.get_or_create(user_id, date).await
    }

    async fn add_watch_time(
        &self,
        user_id: Uuid,
        date: NaiveDate,
        seconds: i32,
    ) -> Result<DailyWatchLimit> {
        self.add_watch_time(user_id, date, seconds).await
    }

    async fn delete_before(&self, date: NaiveDate) -> Result<usize> {
        self.delete_before(date).await
    }
}
