use anyhow::Result;
use async_trait::async_trait;
use diesel::prelude::*;
use uuid::Uuid;

use crate::schema::users;
use crate::store::UserDirectory;
use crate::users::{User, UserModel};
use crate::web::PgPool;

#[derive(Clone)]
pub struct UsersRepository {
    pool: PgPool,
}

impl UsersRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get an active user by ID
    pub async fn get_by_id(&self, user_id: Uuid) -> Result<Option<User>> {
        let pool = self.pool.clone();
        let result = tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;

            let user: Option<UserModel> = users::table
                .filter(users::id.eq(user_id))
                .filter(users::is_active.eq(true))
                .select(UserModel::as_select())
                .first(&mut conn)
                .optional()?;

            Ok::<Option<UserModel>, anyhow::Error>(user)
        })
        .await??;

        Ok(result.map(|model| model.into()))
    }
}

#[async_trait]
impl UserDirectory for UsersRepository {
    async fn get_user(&self, user_id: Uuid) -> Result<Option<User>> {
        self.get_by_id(user_id).await
    }
}
