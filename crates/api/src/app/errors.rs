use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use drainq_infra::jobs::{JobStoreError, SubmitError};

pub fn store_error_to_response(err: JobStoreError) -> axum::response::Response {
    match err {
        JobStoreError::NotFound(id) => json_error(StatusCode::NOT_FOUND, "not_found", format!("job {id} not found")),
        JobStoreError::AlreadyExists(_) | JobStoreError::Conflict { .. } | JobStoreError::TerminalLocked(_) => {
            json_error(StatusCode::CONFLICT, "conflict", err.to_string())
        }
        JobStoreError::BatchTooLarge { .. } => {
            json_error(StatusCode::UNPROCESSABLE_ENTITY, "batch_too_large", err.to_string())
        }
        JobStoreError::Timeout { .. } => json_error(StatusCode::GATEWAY_TIMEOUT, "store_timeout", err.to_string()),
        JobStoreError::Storage(msg) => {
            tracing::error!(error = %msg, "job store failure");
            json_error(StatusCode::SERVICE_UNAVAILABLE, "store_error", msg)
        }
    }
}

pub fn submit_error_to_response(err: SubmitError) -> axum::response::Response {
    match err {
        SubmitError::Invalid(msg) => bad_request("validation_error", msg),
        SubmitError::Store(e) => store_error_to_response(e),
    }
}

pub fn bad_request(code: &'static str, message: impl Into<String>) -> axum::response::Response {
    json_error(StatusCode::BAD_REQUEST, code, message)
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
