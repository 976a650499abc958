use std::sync::Arc;

use axum::{
    extract::{Extension, Query},
    http::{header, HeaderMap, HeaderName, StatusCode},
    response::IntoResponse,
    Json,
};
use tracing::{info, warn};

use assetbridge_infra::jobs::JobMetadata;
use assetbridge_infra::notify::{DedupScope, NotificationEvent};

use crate::app::services::{self, AppServices};
use crate::app::{dto, errors};

const DOCUMENT_PATH_HEADER: &str = "x-document-path";
const SECRET_HEADERS: [&str; 2] = ["x-bridge-secret", "x-experience-secret"];

/// POST /upload
///
/// Stores the document locally (downloaded from `baseAssetId` when given),
/// then either echoes it back (`?dry=true`) or queues it for submission.
pub async fn upload(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<dto::UploadQuery>,
    headers: HeaderMap,
    Json(body): Json<dto::UploadRequest>,
) -> axum::response::Response {
    let notifications = &services.notifications;

    let presented = SECRET_HEADERS
        .iter()
        .find_map(|h| headers.get(*h))
        .and_then(|v| v.to_str().ok());
    if !services.accepts_secret(presented) {
        warn!("upload rejected: invalid experience secret");
        notifications
            .emit(NotificationEvent::new("request_rejected").field("reason", "invalid_experience_secret"))
            .await;
        return errors::json_error(StatusCode::UNAUTHORIZED, "unauthorized", "invalid experience secret");
    }

    if let Err(e) = body.validate() {
        return errors::domain_error_to_response(e);
    }
    let name = body.name.trim().to_string();
    let asset_type = services.asset_type_for(body.asset_type.as_deref());

    notifications
        .emit(
            NotificationEvent::new("request_received")
                .field("name", &name)
                .field("assetType", &asset_type)
                .field("baseAssetId", &body.base_asset_id),
        )
        .await;

    let content = match &body.base_asset_id {
        Some(base) => match services.api.download_asset(base).await {
            Ok(bytes) => {
                info!(base_asset_id = %base, size = bytes.len(), "base asset downloaded");
                notifications
                    .emit(
                        NotificationEvent::new("base_asset_downloaded")
                            .field("baseAssetId", base)
                            .field("size", bytes.len()),
                    )
                    .await;
                String::from_utf8_lossy(&bytes).into_owned()
            }
            Err(e) => {
                warn!(base_asset_id = %base, error = %e, "base asset download failed");
                notifications
                    .emit(
                        NotificationEvent::new("base_asset_failed")
                            .field("baseAssetId", base)
                            .field("error", e.to_string()),
                    )
                    .await;
                return errors::json_error(
                    StatusCode::BAD_GATEWAY,
                    "base_asset_unavailable",
                    format!("failed to download base asset {base}: {e}"),
                );
            }
        },
        None => body.content,
    };
    let downloaded_name = body
        .base_asset_id
        .as_ref()
        .and_then(|_| services::document_name(&content));

    let path = match services
        .save_document(&name, downloaded_name.as_deref(), &content)
        .await
    {
        Ok(p) => p,
        Err(e) => {
            warn!(name = %name, error = %e, "failed to store uploaded document");
            return errors::json_error(StatusCode::INTERNAL_SERVER_ERROR, "storage_error", e.to_string());
        }
    };
    let local_path = path.display().to_string();
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    if let Some(base) = &body.base_asset_id {
        notifications
            .emit_file_once(
                NotificationEvent::new("base_asset_saved_file")
                    .field("baseAssetId", base)
                    .field("name", &name),
                Some(&path),
                DedupScope::default(),
            )
            .await;
    }

    if query.is_dry_run() {
        info!(name = %name, path = %local_path, "dry run; document not queued");
        notifications
            .emit(
                NotificationEvent::new("dry_run")
                    .field("name", &name)
                    .field("localPath", &local_path),
            )
            .await;
        notifications
            .emit_file_once(
                NotificationEvent::new("dry_run_file")
                    .field("name", &name)
                    .field("localPath", &local_path),
                Some(&path),
                DedupScope::default(),
            )
            .await;
        return (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, "application/xml".to_string()),
                (HeaderName::from_static(DOCUMENT_PATH_HEADER), local_path),
            ],
            content,
        )
            .into_response();
    }

    let metadata = JobMetadata {
        name: name.clone(),
        filename: Some(file_name.clone()),
        filepath: Some(path.clone()),
        asset_type: Some(asset_type.clone()),
        base_asset_id: body.base_asset_id.clone(),
        previous_name: downloaded_name.or(body.previous_name),
    };
    let payload = services::payload_for(&metadata, content.into_bytes());

    let job_id = match services.queue.enqueue(payload, metadata) {
        Ok(id) => id,
        Err(e) => return errors::queue_error_to_response(e),
    };

    notifications
        .emit(
            NotificationEvent::new("job_enqueued")
                .field("jobId", job_id)
                .field("name", &name)
                .field("fileName", &file_name)
                .field("localPath", &local_path)
                .field("assetType", &asset_type),
        )
        .await;
    notifications
        .emit_file_once(
            NotificationEvent::new("job_enqueued_file")
                .field("jobId", job_id)
                .field("name", &name)
                .field("fileName", &file_name),
            Some(&path),
            DedupScope::job(job_id),
        )
        .await;

    (
        StatusCode::ACCEPTED,
        Json(dto::EnqueuedResponse {
            status: "queued",
            job_id,
            local_path,
        }),
    )
        .into_response()
}
