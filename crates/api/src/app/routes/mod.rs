use axum::{
    routing::{get, post},
    Router,
};

pub mod queue;
pub mod system;
pub mod upload;

/// Router for every endpoint.
pub fn router() -> Router {
    Router::new()
        .route("/", get(system::banner))
        .route("/health", get(system::health))
        .route("/stats", get(queue::stats))
        .route("/upload", post(upload::upload))
        .route("/queue", get(queue::list_jobs))
        .route("/queue/:id", get(queue::get_job))
        .route("/queue/:id/resubmit", post(queue::resubmit_job))
}
