use serde::{Deserialize, Serialize};

use assetbridge_core::{AssetId, DomainError, DomainResult, JobId};
use assetbridge_infra::jobs::JobSummary;

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadRequest {
    #[serde(default)]
    pub name: String,
    /// Serialized document (XML). Ignored when a base asset is given.
    #[serde(default)]
    pub content: String,
    pub asset_type: Option<String>,
    pub base_asset_id: Option<AssetId>,
    pub previous_name: Option<String>,
}

impl UploadRequest {
    /// A name is required, and content unless a base asset supplies it.
    pub fn validate(&self) -> DomainResult<()> {
        if self.name.trim().is_empty() {
            return Err(DomainError::validation("name is required"));
        }
        if self.base_asset_id.is_none() && self.content.trim().is_empty() {
            return Err(DomainError::validation("content is required"));
        }
        Ok(())
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct UploadQuery {
    pub dry: Option<String>,
}

impl UploadQuery {
    pub fn is_dry_run(&self) -> bool {
        self.dry.as_deref().is_some_and(|v| v.eq_ignore_ascii_case("true"))
    }
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueuedResponse {
    pub status: &'static str,
    pub job_id: JobId,
    pub local_path: String,
}

#[derive(Debug, Serialize)]
pub struct QueueListResponse {
    pub count: usize,
    pub jobs: Vec<JobSummary>,
}
