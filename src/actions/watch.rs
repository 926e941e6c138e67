use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::auth::{AuthUser, MaybeAuthUser};
use crate::quota::{WatchAllowance, decision_for};
use crate::web::AppState;

use super::{DataResponse, json_error};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchLimitView {
    pub watched_seconds: i32,
    pub remaining_seconds: Option<i32>,
    pub has_subscription: bool,
    pub can_watch: bool,
    pub message: String,
}

impl From<WatchAllowance> for WatchLimitView {
    fn from(allowance: WatchAllowance) -> Self {
        let decision = decision_for(&allowance);
        Self {
            watched_seconds: allowance.watched_seconds,
            remaining_seconds: allowance.remaining_seconds,
            has_subscription: allowance.unlimited,
            can_watch: decision.allowed,
            message: decision.reason,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchProgressRequest {
    /// Seconds watched since the last report
    pub watch_time: i32,
}

/// GET /watch/limit
/// Today's allowance for the current user
pub async fn get_watch_limit(auth_user: AuthUser, State(state): State<AppState>) -> Response {
    match state.quota.check_and_gate(auth_user.0.id).await {
        Ok(allowance) => Json(DataResponse {
            data: WatchLimitView::from(allowance),
        })
        .into_response(),
        Err(e) => {
            error!(user_id = %auth_user.0.id, error = %e, "Failed to load watch limit");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to load watch limit")
        }
    }
}

/// GET /watch/check
/// Whether playback may start; anonymous viewers are asked to log in
pub async fn check_can_watch(
    MaybeAuthUser(user): MaybeAuthUser,
    State(state): State<AppState>,
) -> Response {
    let user_id = user.map(|u| u.id);
    match state.quota.can_watch(user_id).await {
        Ok(decision) => Json(DataResponse { data: decision }).into_response(),
        Err(e) => {
            error!(?user_id, error = %e, "Failed to check watch allowance");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to check watch limit")
        }
    }
}

/// POST /watch/progress
/// Record watched seconds and return the updated allowance
pub async fn record_watch_progress(
    auth_user: AuthUser,
    State(state): State<AppState>,
    Json(request): Json<WatchProgressRequest>,
) -> Response {
    let user_id = auth_user.0.id;

    if let Err(e) = state
        .quota
        .record_watch_time(user_id, request.watch_time)
        .await
    {
        error!(%user_id, error = %e, "Failed to record watch time");
        return json_error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to record watch time");
    }

    match state.quota.check_and_gate(user_id).await {
        Ok(allowance) => Json(DataResponse {
            data: WatchLimitView::from(allowance),
        })
        .into_response(),
        Err(e) => {
            error!(%user_id, error = %e, "Failed to load watch limit");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to load watch limit")
        }
    }
}
