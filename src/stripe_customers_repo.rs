use anyhow::{Context, Result};
use async_trait::async_trait;
use diesel::prelude::*;
use uuid::Uuid;

use crate::schema::stripe_customers;
use crate::store::CustomerStore;
use crate::stripe_customers::{NewStripeCustomer, StripeCustomer, StripeCustomerModel};
use crate::web::PgPool;

#[derive(Clone)]
pub struct StripeCustomersRepository {
    pool: PgPool,
}

impl StripeCustomersRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get by user ID
    pub async fn get_by_user_id(&self, user_id: Uuid) -> Result<Option<StripeCustomer>> {
        let pool = self.pool.clone();
        let result = tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;

            let customer: Option<StripeCustomerModel> = stripe_customers::table
                .filter(stripe_customers::user_id.eq(user_id))
                .select(StripeCustomerModel::as_select())
                .first(&mut conn)
                .optional()?;

            Ok::<Option<StripeCustomerModel>, anyhow::Error>(customer)
        })
        .await??;

        Ok(result.map(|model| model.into()))
    }

    /// Store the mapping. If a concurrent checkout already stored one for
    /// this user, that row wins and is returned.
    pub async fn create(&self, new_customer: NewStripeCustomer) -> Result<StripeCustomer> {
        let pool = self.pool.clone();
        let result = tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;

            let inserted: Option<StripeCustomerModel> =
                diesel::insert_into(stripe_customers::table)
                    .values(&new_customer)
                    .on_conflict(stripe_customers::user_id)
                    .do_nothing()
                    .returning(StripeCustomerModel::as_returning())
                    .get_result(&mut conn)
                    .optional()?;

            match inserted {
                Some(inserted) => Ok::<StripeCustomerModel, anyhow::Error>(inserted),
                None => stripe_customers::table
                    .filter(stripe_customers::user_id.eq(new_customer.user_id))
                    .select(StripeCustomerModel::as_select())
                    .first(&mut conn)
                    .context("stripe customer vanished after insert conflict"),
            }
        })
        .await??;

        Ok(result.into())
    }
}

#[async_trait]
impl CustomerStore for StripeCustomersRepository {
    async fn get_by_user_id(&self, user_id: Uuid) -> Result<Option<StripeCustomer>> {
        self.get_by_user_id(user_id).await
    }

    async fn create(&self, new_customer: NewStripeCustomer) -> Result<StripeCustomer> {
        self.create(new_customer).await
    }
}
