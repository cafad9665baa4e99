//! Operator endpoints.

use std::sync::Arc;

use axum::{
    extract::Extension, http::StatusCode, response::IntoResponse, routing::post, Json, Router,
};

use crate::app::{errors, services::AppServices};

pub fn router() -> Router {
    Router::new().route("/retention", post(run_retention))
}

/// POST /admin/retention
///
/// Delete terminal jobs older than the retention window.
pub async fn run_retention(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    match services.queue.retention().await {
        Ok(report) => (StatusCode::OK, Json(report)).into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}
