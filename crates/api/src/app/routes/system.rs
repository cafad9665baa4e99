use std::sync::Arc;

use axum::{extract::Extension, http::StatusCode, response::IntoResponse, Json};
use serde_json::json;

use crate::app::services::AppServices;

pub async fn health() -> StatusCode {
    StatusCode::OK
}

/// Effective queue tunables, for operators checking a deployment.
pub async fn config(Extension(services): Extension<Arc<AppServices>>) -> impl IntoResponse {
    let config = services.queue.config();
    Json(json!({
        "max_attempts": config.max_attempts,
        "liveness_window_secs": config.liveness_window.as_secs(),
        "invocation_budget_secs": config.invocation_budget.as_secs(),
        "extract_deadline_secs": config.extract_deadline.as_secs(),
        "store_timeout_secs": config.store_timeout.as_secs(),
        "concurrency": config.concurrency,
        "max_concurrency": config.max_concurrency,
        "batch_limit": config.batch_limit,
        "retention_days": config.retention.as_secs() / 86_400,
        "max_chain_depth": config.max_chain_depth,
    }))
}
