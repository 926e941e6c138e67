use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use tracing::debug;
use uuid::Uuid;

use crate::payments::{
    CompletionOutcome, NewPayment, Payment, PaymentModel, PaymentStatus, StatusChange,
};
use crate::schema::{payments, subscriptions};
use crate::store::PaymentStore;
use crate::subscriptions::{NewSubscription, SubscriptionModel, next_window};
use crate::web::PgPool;

#[derive(Clone)]
pub struct PaymentsRepository {
    pool: PgPool,
}

impl PaymentsRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a payment by ID
    pub async fn get_by_id(&self, payment_id: Uuid) -> Result<Option<Payment>> {
        let pool = self.pool.clone();
        let result = tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;

            let payment: Option<PaymentModel> = payments::table
                .filter(payments::id.eq(payment_id))
                .select(PaymentModel::as_select())
                .first(&mut conn)
                .optional()?;

            Ok::<Option<PaymentModel>, anyhow::Error>(payment)
        })
        .await??;

        Ok(result.map(|model| model.into()))
    }

    /// Get payments for a specific user, newest first
    pub async fn get_by_user_id(&self, user_id: Uuid) -> Result<Vec<Payment>> {
        let pool = self.pool.clone();
        let result = tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;

            let rows: Vec<PaymentModel> = payments::table
                .filter(payments::user_id.eq(user_id))
                .order_by(payments::created_at.desc())
                .select(PaymentModel::as_select())
                .load(&mut conn)?;

            Ok::<Vec<PaymentModel>, anyhow::Error>(rows)
        })
        .await??;

        Ok(result.into_iter().map(|model| model.into()).collect())
    }

    /// Get a payment by Stripe payment intent ID
    pub async fn get_by_payment_intent_id(
        &self,
        payment_intent_id: &str,
    ) -> Result<Option<Payment>> {
        let pool = self.pool.clone();
        let payment_intent_id = payment_intent_id.to_string();
        let result = tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;

            let payment: Option<PaymentModel> = payments::table
                .filter(payments::stripe_payment_intent_id.eq(&payment_intent_id))
                .select(PaymentModel::as_select())
                .first(&mut conn)
                .optional()?;

            Ok::<Option<PaymentModel>, anyhow::Error>(payment)
        })
        .await??;

        Ok(result.map(|model| model.into()))
    }

    /// Insert a payment unless one already exists for its payment intent
    pub async fn insert_if_absent(&self, new_payment: NewPayment) -> Result<(Payment, bool)> {
        let pool = self.pool.clone();
        let result = tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;

            let inserted: Option<PaymentModel> = diesel::insert_into(payments::table)
                .values(&new_payment)
                .on_conflict(payments::stripe_payment_intent_id)
                .do_nothing()
                .returning(PaymentModel::as_returning())
                .get_result(&mut conn)
                .optional()?;

            if let Some(created) = inserted {
                return Ok::<(PaymentModel, bool), anyhow::Error>((created, true));
            }

            let existing: PaymentModel = payments::table
                .filter(payments::stripe_payment_intent_id.eq(&new_payment.stripe_payment_intent_id))
                .select(PaymentModel::as_select())
                .first(&mut conn)
                .context("payment vanished after insert conflict")?;

            Ok((existing, false))
        })
        .await??;

        Ok((result.0.into(), result.1))
    }

    /// Record the checkout session on the payment, promoting `pending` to
    /// `processing`
    pub async fn attach_checkout_session(
        &self,
        payment_intent_id: &str,
        checkout_session_id: &str,
    ) -> Result<StatusChange> {
        let pool = self.pool.clone();
        let payment_intent_id = payment_intent_id.to_string();
        let checkout_session_id = checkout_session_id.to_string();

        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;

            conn.transaction::<_, anyhow::Error, _>(|conn| {
                let Some(current) = lock_payment(conn, &payment_intent_id)? else {
                    return Ok(StatusChange::NotFound);
                };

                let status = if current.status == PaymentStatus::Pending {
                    PaymentStatus::Processing
                } else {
                    current.status
                };

                let updated: PaymentModel =
                    diesel::update(payments::table.filter(payments::id.eq(current.id)))
                        .set((
                            payments::stripe_checkout_session_id.eq(Some(&checkout_session_id)),
                            payments::status.eq(status),
                            payments::updated_at.eq(diesel::dsl::now),
                        ))
                        .returning(PaymentModel::as_returning())
                        .get_result(conn)?;

                if status != current.status {
                    Ok(StatusChange::Changed(updated.into()))
                } else {
                    Ok(StatusChange::Unchanged(updated.into()))
                }
            })
        })
        .await?
    }

    /// Transition to `succeeded` and apply the entitlement in one transaction.
    ///
    /// The payment row is locked for the whole transaction, so two deliveries
    /// racing on the same payment intent see each other's result.
    pub async fn complete_payment(
        &self,
        payment_intent_id: &str,
        now: DateTime<Utc>,
    ) -> Result<CompletionOutcome> {
        let pool = self.pool.clone();
        let payment_intent_id = payment_intent_id.to_string();

        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;

            conn.transaction::<_, anyhow::Error, _>(|conn| {
                let Some(current) = lock_payment(conn, &payment_intent_id)? else {
                    return Ok(CompletionOutcome::NotFound);
                };

                if current.status == PaymentStatus::Succeeded {
                    return Ok(CompletionOutcome::AlreadySucceeded(current.into()));
                }
                if !current.status.can_transition_to(PaymentStatus::Succeeded) {
                    return Ok(CompletionOutcome::Rejected(current.into()));
                }

                let payment: PaymentModel =
                    diesel::update(payments::table.filter(payments::id.eq(current.id)))
                        .set((
                            payments::status.eq(PaymentStatus::Succeeded),
                            payments::completed_at.eq(Some(now)),
                            payments::updated_at.eq(now),
                        ))
                        .returning(PaymentModel::as_returning())
                        .get_result(conn)?;

                let subscription =
                    apply_entitlement(conn, payment.user_id, payment.subscription_months, now)?;

                Ok(CompletionOutcome::Completed {
                    payment: payment.into(),
                    subscription: subscription.into(),
                })
            })
        })
        .await?
    }

    /// Move an open payment to `failed`; settled payments are left untouched
    pub async fn fail_payment(&self, payment_intent_id: &str) -> Result<StatusChange> {
        self.set_status_where(payment_intent_id, PaymentStatus::Failed, |status| {
            status.can_transition_to(PaymentStatus::Failed)
        })
        .await
    }

    /// Mark a payment refunded whatever its current status
    pub async fn refund_payment(&self, payment_intent_id: &str) -> Result<StatusChange> {
        self.set_status_where(payment_intent_id, PaymentStatus::Refunded, |status| {
            status != PaymentStatus::Refunded
        })
        .await
    }

    async fn set_status_where(
        &self,
        payment_intent_id: &str,
        next: PaymentStatus,
        allowed: fn(PaymentStatus) -> bool,
    ) -> Result<StatusChange> {
        let pool = self.pool.clone();
        let payment_intent_id = payment_intent_id.to_string();

        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;

            conn.transaction::<_, anyhow::Error, _>(|conn| {
                let Some(current) = lock_payment(conn, &payment_intent_id)? else {
                    return Ok(StatusChange::NotFound);
                };

                if !allowed(current.status) {
                    return Ok(StatusChange::Unchanged(current.into()));
                }

                let updated: PaymentModel =
                    diesel::update(payments::table.filter(payments::id.eq(current.id)))
                        .set((
                            payments::status.eq(next),
                            payments::updated_at.eq(diesel::dsl::now),
                        ))
                        .returning(PaymentModel::as_returning())
                        .get_result(conn)?;

                Ok(StatusChange::Changed(updated.into()))
            })
        })
        .await?
    }

    /// Delete pending payments created before the cutoff
    pub async fn delete_stale_pending(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let pool = self.pool.clone();
        let deleted = tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;

            let deleted = diesel::delete(
                payments::table
                    .filter(payments::status.eq(PaymentStatus::Pending))
                    .filter(payments::created_at.lt(cutoff)),
            )
            .execute(&mut conn)?;

            Ok::<usize, anyhow::Error>(deleted)
        })
        .await??;

        debug!("Deleted {} stale pending payments", deleted);
        Ok(deleted)
    }
}

fn lock_payment(conn: &mut PgConnection, payment_intent_id: &str) -> Result<Option<PaymentModel>> {
    let payment = payments::table
        .filter(payments::stripe_payment_intent_id.eq(payment_intent_id))
        .select(PaymentModel::as_select())
        .for_update()
        .first(conn)
        .optional()?;

    Ok(payment)
}

/// Create, extend or reset the user's subscription inside the caller's
/// transaction
fn apply_entitlement(
    conn: &mut PgConnection,
    user_id: Uuid,
    months: i32,
    now: DateTime<Utc>,
) -> Result<SubscriptionModel> {
    let existing: Option<SubscriptionModel> = subscriptions::table
        .filter(subscriptions::user_id.eq(user_id))
        .select(SubscriptionModel::as_select())
        .for_update()
        .first(conn)
        .optional()?;

    let current = match existing {
        Some(current) => current,
        None => {
            let (window, _) = next_window(None, months, now);
            let created: Option<SubscriptionModel> = diesel::insert_into(subscriptions::table)
                .values(&NewSubscription {
                    user_id,
                    start_date: window.start_date,
                    end_date: window.end_date,
                    is_active: true,
                })
                .on_conflict(subscriptions::user_id)
                .do_nothing()
                .returning(SubscriptionModel::as_returning())
                .get_result(conn)
                .optional()?;

            if let Some(created) = created {
                return Ok(created);
            }

            // A concurrent payment for the same user created the row first
            subscriptions::table
                .filter(subscriptions::user_id.eq(user_id))
                .select(SubscriptionModel::as_select())
                .for_update()
                .first(conn)?
        }
    };

    let (window, _) = next_window(Some(&current.clone().into()), months, now);
    let updated = diesel::update(subscriptions::table.filter(subscriptions::id.eq(current.id)))
        .set((
            subscriptions::start_date.eq(window.start_date),
            subscriptions::end_date.eq(window.end_date),
            subscriptions::is_active.eq(true),
            subscriptions::updated_at.eq(now),
        ))
        .returning(SubscriptionModel::as_returning())
        .get_result(conn)?;

    Ok(updated)
}

#[async_trait]
impl PaymentStore for PaymentsRepository {
    async fn get_by_payment_intent_id(&self, payment_intent_id: &str) -> Result<Option<Payment>> {
        self.get_by_payment_intent_id(payment_intent_id).await
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<Payment>> {
        self.get_by_id(id).await
    }

    async fn list_by_user(&self, user_id: Uuid) -> Result<Vec<Payment>> {
        self.get_by_user_id(user_id).await
    }

    async fn insert_if_absent(&self, new_payment: NewPayment) -> Result<(Payment, bool)> {
        self.insert_if_absent(new_payment).await
    }

    async fn attach_checkout_session(
        &self,
        payment_intent_id: &str,
        checkout_session_id: &str,
    ) -> Result<StatusChange> {
        self.attach_checkout_session(payment_intent_id, checkout_session_id)
            .await
    }

    async fn complete_payment(
        &self,
        payment_intent_id: &str,
        now: DateTime<Utc>,
    ) -> Result<CompletionOutcome> {
        self.complete_payment(payment_intent_id, now).await
    }

    async fn fail_payment(&self, payment_intent_id: &str) -> Result<StatusChange> {
        self.fail_payment(payment_intent_id).await
    }

    async fn refund_payment(&self, payment_intent_id: &str) -> Result<StatusChange> {
        self.refund_payment(payment_intent_id).await
    }

    async fn delete_stale_pending(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        self.delete_stale_pending(cutoff).await
    }
}
