pub mod payments;
pub mod status;
pub mod watch;
pub mod webhooks;

pub use payments::*;
pub use status::*;
pub use watch::*;
pub use webhooks::*;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

/// Single-item response envelope
#[derive(Debug, Serialize)]
pub struct DataResponse<T> {
    pub data: T,
}

/// List response envelope
#[derive(Debug, Serialize)]
pub struct DataListResponse<T> {
    pub data: Vec<T>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub errors: String,
}

pub fn json_error(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(ErrorResponse {
            errors: message.to_string(),
        }),
    )
        .into_response()
}
