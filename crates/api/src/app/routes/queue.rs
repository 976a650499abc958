use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use tracing::warn;

use assetbridge_core::{DomainError, JobId};

use crate::app::services::{self, AppServices};
use crate::app::{dto, errors};

fn parse_id(raw: &str) -> Result<JobId, axum::response::Response> {
    raw.parse::<JobId>().map_err(errors::domain_error_to_response)
}

/// GET /queue
pub async fn list_jobs(Extension(services): Extension<Arc<AppServices>>) -> impl IntoResponse {
    let jobs = services.queue.list();
    Json(dto::QueueListResponse {
        count: jobs.len(),
        jobs,
    })
}

/// GET /queue/:id
pub async fn get_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match services.queue.get(id).ok_or_else(DomainError::not_found) {
        Ok(record) => (StatusCode::OK, Json(record)).into_response(),
        Err(e) => errors::domain_error_to_response(e),
    }
}

/// POST /queue/:id/resubmit
///
/// Queue the stored document of a failed or unexecutable job as a new job.
pub async fn resubmit_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let Some(record) = services.queue.get(id) else {
        return errors::json_error(StatusCode::NOT_FOUND, "not_found", format!("job {id} not found"));
    };
    let Some(path) = record.metadata.filepath.clone() else {
        return errors::json_error(StatusCode::CONFLICT, "document_unavailable", "job has no stored document");
    };
    let content = match tokio::fs::read(&path).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(job_id = %id, path = %path.display(), error = %e, "stored document unreadable");
            return errors::json_error(StatusCode::CONFLICT, "document_unavailable", e.to_string());
        }
    };

    let payload = services::payload_for(&record.metadata, content);
    match services.queue.resubmit(id, payload) {
        Ok(job_id) => (
            StatusCode::ACCEPTED,
            Json(dto::EnqueuedResponse {
                status: "queued",
                job_id,
                local_path: path.display().to_string(),
            }),
        )
            .into_response(),
        Err(e) => errors::queue_error_to_response(e),
    }
}

/// GET /stats
pub async fn stats(Extension(services): Extension<Arc<AppServices>>) -> impl IntoResponse {
    Json(services.queue.stats())
}
