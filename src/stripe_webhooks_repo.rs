use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;

use crate::schema::stripe_webhook_events;
use crate::store::WebhookEventStore;
use crate::stripe_webhooks::{
    ClaimOutcome, NewStripeWebhookEvent, StripeWebhookEvent, StripeWebhookEventModel,
};
use crate::web::PgPool;

#[derive(Clone)]
pub struct StripeWebhooksRepository {
    pool: PgPool,
}

impl StripeWebhooksRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Record a webhook event, or take over a failed or abandoned delivery.
    ///
    /// The existing row is locked while deciding so two concurrent
    /// redeliveries cannot both claim it.
    pub async fn claim(
        &self,
        new_event: NewStripeWebhookEvent,
        now: DateTime<Utc>,
    ) -> Result<ClaimOutcome> {
        let pool = self.pool.clone();

        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;

            conn.transaction::<_, anyhow::Error, _>(|conn| {
                let inserted: Option<StripeWebhookEventModel> =
                    diesel::insert_into(stripe_webhook_events::table)
                        .values(&new_event)
                        .on_conflict(stripe_webhook_events::stripe_event_id)
                        .do_nothing()
                        .returning(StripeWebhookEventModel::as_returning())
                        .get_result(conn)
                        .optional()?;

                if let Some(inserted) = inserted {
                    return Ok(ClaimOutcome::Claimed(inserted.into()));
                }

                let existing: StripeWebhookEvent = stripe_webhook_events::table
                    .filter(stripe_webhook_events::stripe_event_id.eq(&new_event.stripe_event_id))
                    .select(StripeWebhookEventModel::as_select())
                    .for_update()
                    .first(conn)?
                    .into();

                if !existing.is_reclaimable_at(now) {
                    return Ok(ClaimOutcome::Duplicate);
                }

                let reclaimed: StripeWebhookEventModel = diesel::update(
                    stripe_webhook_events::table
                        .filter(stripe_webhook_events::id.eq(existing.id)),
                )
                .set((
                    stripe_webhook_events::processed.eq(false),
                    stripe_webhook_events::processing_error.eq(None::<String>),
                    stripe_webhook_events::attempts.eq(stripe_webhook_events::attempts + 1),
                    stripe_webhook_events::claimed_at.eq(now),
                    stripe_webhook_events::processed_at.eq(None::<DateTime<Utc>>),
                ))
                .returning(StripeWebhookEventModel::as_returning())
                .get_result(conn)?;

                Ok(ClaimOutcome::Claimed(reclaimed.into()))
            })
        })
        .await?
    }

    /// Mark an event as successfully processed
    pub async fn mark_processed(&self, stripe_event_id: &str, now: DateTime<Utc>) -> Result<()> {
        let pool = self.pool.clone();
        let stripe_event_id = stripe_event_id.to_string();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;

            diesel::update(stripe_webhook_events::table)
                .filter(stripe_webhook_events::stripe_event_id.eq(&stripe_event_id))
                .set((
                    stripe_webhook_events::processed.eq(true),
                    stripe_webhook_events::processing_error.eq(None::<String>),
                    stripe_webhook_events::processed_at.eq(Some(now)),
                ))
                .execute(&mut conn)?;

            Ok::<(), anyhow::Error>(())
        })
        .await??;

        Ok(())
    }

    /// Mark an event as handled with an error, leaving it open to redelivery
    pub async fn mark_failed(
        &self,
        stripe_event_id: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let pool = self.pool.clone();
        let stripe_event_id = stripe_event_id.to_string();
        let error = error.to_string();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;

            diesel::update(stripe_webhook_events::table)
                .filter(stripe_webhook_events::stripe_event_id.eq(&stripe_event_id))
                .set((
                    stripe_webhook_events::processed.eq(true),
                    stripe_webhook_events::processing_error.eq(Some(&error)),
                    stripe_webhook_events::processed_at.eq(Some(now)),
                ))
                .execute(&mut conn)?;

            Ok::<(), anyhow::Error>(())
        })
        .await??;

        Ok(())
    }

    pub async fn get_by_stripe_event_id(
        &self,
        stripe_event_id: &str,
    ) -> Result<Option<StripeWebhookEvent>> {
        let pool = self.pool.clone();
        let stripe_event_id = stripe_event_id.to_string();
        let result = tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;

            let event: Option<StripeWebhookEventModel> = stripe_webhook_events::table
                .filter(stripe_webhook_events::stripe_event_id.eq(&stripe_event_id))
                .select(StripeWebhookEventModel::as_select())
                .first(&mut conn)
                .optional()?;

            Ok::<Option<StripeWebhookEventModel>, anyhow::Error>(event)
        })
        .await??;

        Ok(result.map(|model| model.into()))
    }
}

#[async_trait]
impl WebhookEventStore for StripeWebhooksRepository {
    async fn claim(
        &self,
        new_event: NewStripeWebhookEvent,
        now: DateTime<Utc>,
    ) -> Result<ClaimOutcome> {
        self.claim(new_event, now).await
    }

    async fn mark_processed(&self, stripe_event_id: &str, now: DateTime<Utc>) -> Result<()> {
        self.mark_processed(stripe_event_id, now).await
    }

    async fn mark_failed(
        &self,
        stripe_event_id: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.mark_failed(stripe_event_id, error, now).await
    }

    async fn get_by_stripe_event_id(
        &self,
        stripe_event_id: &str,
    ) -> Result<Option<StripeWebhookEvent>> {
        self.get_by_stripe_event_id(stripe_event_id).await
    }
}
