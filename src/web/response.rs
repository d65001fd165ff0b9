//! Uniform response envelope: `{status, message, data?}` with the HTTP
//! status mirroring the outcome.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Serialize;
use serde_json::json;

pub fn envelope_success<T: Serialize>(data: T) -> Response {
    (
        StatusCode::OK,
        Json(json!({
            "status": "success",
            "message": "",
            "data": data,
        })),
    )
        .into_response()
}

pub fn envelope_error(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(json!({
            "status": "error",
            "message": message,
        })),
    )
        .into_response()
}
