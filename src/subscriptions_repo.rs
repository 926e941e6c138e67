use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use uuid::Uuid;

use crate::schema::subscriptions;
use crate::store::SubscriptionStore;
use crate::subscriptions::{Subscription, SubscriptionModel};
use crate::web::PgPool;

#[derive(Clone)]
pub struct SubscriptionsRepository {
    pool: PgPool,
}

impl SubscriptionsRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get_by_user_id(&self, user_id: Uuid) -> Result<Option<Subscription>> {
        let pool = self.pool.clone();
        let result = tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;

            let subscription: Option<SubscriptionModel> = subscriptions::table
                .filter(subscriptions::user_id.eq(user_id))
                .select(SubscriptionModel::as_select())
                .first(&mut conn)
                .optional()?;

            Ok::<Option<SubscriptionModel>, anyhow::Error>(subscription)
        })
        .await??;

        Ok(result.map(|model| model.into()))
    }

    /// Flip `is_active` off for every subscription past its end date
    pub async fn deactivate_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let pool = self.pool.clone();
        let updated = tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;

            let updated = diesel::update(
                subscriptions::table
                    .filter(subscriptions::is_active.eq(true))
                    .filter(subscriptions::end_date.lt(now)),
            )
            .set((
                subscriptions::is_active.eq(false),
                subscriptions::updated_at.eq(now),
            ))
            .execute(&mut conn)?;

            Ok::<usize, anyhow::Error>(updated)
        })
        .await??;

        Ok(updated)
    }

    pub async fn active_ending_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Subscription>> {
        let pool = self.pool.clone();
        let result = tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;

            let rows: Vec<SubscriptionModel> = subscriptions::table
                .filter(subscriptions::is_active.eq(true))
                .filter(subscriptions::end_date.ge(from))
                .filter(subscriptions::end_date.lt(to))
                .order_by(subscriptions::end_date.asc())
                .select(SubscriptionModel::as_select())
                .load(&mut conn)?;

            Ok::<Vec<SubscriptionModel>, anyhow::Error>(rows)
        })
        .await??;

        Ok(result.into_iter().map(|model| model.into()).collect())
    }
}

#[async_trait]
impl SubscriptionStore for SubscriptionsRepository {
    async fn get_by_user(&self, user_id: Uuid) -> Result<Option<Subscription>> {
        self.get_by_user_id(user_id).await
    }

    async fn deactivate_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        self.deactivate_expired(now).await
    }

    async fn active_ending_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Subscription>> {
        self.active_ending_between(from, to).await
    }
}
