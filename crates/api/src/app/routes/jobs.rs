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
        .route("/", post(submit_job))
        .route("/:job_id", get(get_job))
}

/// POST /jobs
///
/// Queue a job. Nothing runs until the owner is triggered.
pub async fn submit_job(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<dto::SubmitJobRequest>,
) -> axum::response::Response {
    let owner = match dto::parse_owner(&body.owner) {
        Ok(owner) => owner,
        Err(resp) => return resp,
    };
    let fields = match dto::parse_fields(body.fields.as_deref()) {
        Ok(fields) => fields,
        Err(resp) => return resp,
    };

    match services.queue.submit(owner, body.text, fields).await {
        Ok(job) => (StatusCode::CREATED, Json(dto::SubmitJobResponse { job_id: job.id })).into_response(),
        Err(e) => errors::submit_error_to_response(e),
    }
}

/// GET /jobs/:job_id
pub async fn get_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(job_id): Path<String>,
) -> axum::response::Response {
    let job_id = match dto::parse_job_id(&job_id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.queue.job(job_id).await {
        Ok(Some(job)) => (StatusCode::OK, Json(job)).into_response(),
        Ok(None) => errors::json_error(StatusCode::NOT_FOUND, "not_found", format!("job {job_id} not found")),
        Err(e) => errors::store_error_to_response(e),
    }
}
