//! Dispatch endpoints: trigger, drain and status.
//!
//! Each returns a description of the dispatch it started or ran. Job failures never
//! show up here; they are recorded on the job as `dead` with `outcome.error`.

use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};

use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/trigger", post(trigger))
        .route("/drain", post(drain))
        .route("/status/:owner", get(status))
}

/// POST /trigger
///
/// Reclaim stuck jobs and hand the drain to a fresh request. Never extracts inline.
pub async fn trigger(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<dto::TriggerRequest>,
) -> axum::response::Response {
    let owner = match dto::parse_owner(&body.owner) {
        Ok(owner) => owner,
        Err(resp) => return resp,
    };
    let job_id = match body.job_id.as_deref().map(dto::parse_job_id).transpose() {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    let ack = services.queue.trigger(&owner, job_id).await;
    let status = if ack.accepted {
        StatusCode::ACCEPTED
    } else {
        StatusCode::UNPROCESSABLE_ENTITY
    };
    (status, Json(ack)).into_response()
}

/// POST /drain
///
/// Run one budgeted invocation for the owner and answer with its report. This is the
/// continuation target: each continuation arrives as its own request.
pub async fn drain(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<dto::DrainRequest>,
) -> axum::response::Response {
    let owner = match dto::parse_owner(&body.owner) {
        Ok(owner) => owner,
        Err(resp) => return resp,
    };

    // Own task: the invocation runs to the end even if the caller stops waiting.
    let queue = services.queue.clone();
    let invocation = tokio::spawn(async move { queue.drain(&owner, body.chain_depth).await });

    match invocation.await {
        Ok(Ok(report)) => (StatusCode::OK, Json(report)).into_response(),
        Ok(Err(e)) => errors::store_error_to_response(e),
        Err(e) => errors::json_error(StatusCode::INTERNAL_SERVER_ERROR, "drain_failed", e.to_string()),
    }
}

/// GET /status/:owner
pub async fn status(
    Extension(services): Extension<Arc<AppServices>>,
    Path(owner): Path<String>,
) -> axum::response::Response {
    let owner = match dto::parse_owner(&owner) {
        Ok(owner) => owner,
        Err(resp) => return resp,
    };

    match services.queue.status(&owner).await {
        Ok(status) => (StatusCode::OK, Json(status)).into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}
