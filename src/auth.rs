use anyhow::Result;
use axum::{
    RequestPartsExt,
    extract::FromRequestParts,
    http::{StatusCode, request::Parts},
    response::{IntoResponse, Response},
};
use axum_extra::{
    TypedHeader,
    headers::{Authorization, authorization::Bearer},
};
use chrono::{Duration, Utc};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::{users::User, web::AppState};

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String, // user ID
    pub email: String,
    pub exp: i64,
    pub iat: i64,
}

impl Claims {
    pub fn new(user: &User) -> Self {
        let now = Utc::now();
        let exp = now + Duration::days(7);

        Self {
            sub: user.id.to_string(),
            email: user.email.clone(),
            exp: exp.timestamp(),
            iat: now.timestamp(),
        }
    }

    pub fn user_id(&self) -> Result<Uuid> {
        self.sub
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid user ID: {}", e))
    }
}

/// Issues and verifies session tokens signed with `JWT_SECRET`
pub struct JwtService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl JwtService {
    pub fn new(secret: &str) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_ref()),
            decoding_key: DecodingKey::from_secret(secret.as_ref()),
        }
    }

    pub fn from_env() -> Result<Self> {
        Ok(Self::new(&get_jwt_secret()?))
    }

    pub fn generate_token(&self, user: &User) -> Result<String> {
        let claims = Claims::new(user);
        encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|e| anyhow::anyhow!("Failed to generate token: {}", e))
    }

    pub fn verify_token(&self, token: &str) -> Result<Claims> {
        decode::<Claims>(token, &self.decoding_key, &Validation::default())
            .map(|data| data.claims)
            .map_err(|e| anyhow::anyhow!("Failed to verify token: {}", e))
    }
}

async fn resolve_user(token: &str, state: &AppState) -> Result<User, AuthError> {
    let claims = state
        .jwt
        .verify_token(token)
        .map_err(|_| AuthError::InvalidToken)?;
    let user_id = claims.user_id().map_err(|_| AuthError::InvalidToken)?;

    state
        .stores
        .users
        .get_user(user_id)
        .await
        .map_err(|e| {
            warn!(%user_id, error = %e, "Failed to load authenticated user");
            AuthError::DatabaseError
        })?
        .ok_or(AuthError::UserNotFound)
}

/// An authenticated, active user
#[derive(Debug)]
pub struct AuthUser(pub User);

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AuthError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let TypedHeader(Authorization(bearer)) = parts
            .extract::<TypedHeader<Authorization<Bearer>>>()
            .await
            .map_err(|_| AuthError::MissingToken)?;

        Ok(AuthUser(resolve_user(bearer.token(), state).await?))
    }
}

/// The requesting user when a valid token is present. Anonymous requests
/// and stale tokens both yield `None`.
#[derive(Debug)]
pub struct MaybeAuthUser(pub Option<User>);

impl FromRequestParts<AppState> for MaybeAuthUser {
    type Rejection = AuthError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let Ok(TypedHeader(Authorization(bearer))) = parts
            .extract::<TypedHeader<Authorization<Bearer>>>()
            .await
        else {
            return Ok(MaybeAuthUser(None));
        };

        match resolve_user(bearer.token(), state).await {
            Ok(user) => Ok(MaybeAuthUser(Some(user))),
            Err(AuthError::DatabaseError) => Err(AuthError::DatabaseError),
            Err(_) => Ok(MaybeAuthUser(None)),
        }
    }
}

#[derive(Debug)]
pub enum AuthError {
    MissingToken,
    InvalidToken,
    DatabaseError,
    UserNotFound,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AuthError::MissingToken => (StatusCode::UNAUTHORIZED, "Missing authorization token"),
            AuthError::InvalidToken => (StatusCode::UNAUTHORIZED, "Invalid token"),
            AuthError::DatabaseError => (StatusCode::INTERNAL_SERVER_ERROR, "Database error"),
            AuthError::UserNotFound => (StatusCode::UNAUTHORIZED, "User not found"),
        };
        (status, error_message).into_response()
    }
}

pub fn get_jwt_secret() -> Result<String> {
    std::env::var("JWT_SECRET")
        .map_err(|_| anyhow::anyhow!("JWT_SECRET environment variable not set"))
}
