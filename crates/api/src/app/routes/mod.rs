use axum::{routing::get, Router};

pub mod admin;
pub mod jobs;
pub mod queue;
pub mod system;

/// Router for all queue endpoints.
pub fn router() -> Router {
    Router::new()
        .route("/config", get(system::config))
        .nest("/jobs", jobs::router())
        .nest("/admin", admin::router())
        .merge(queue::router())
}
