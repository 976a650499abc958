//! Outcome summary reported once per finished job.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use assetbridge_core::{AssetId, JobId};

use super::types::{ChainedActionOutcome, JobRecord};

/// How far a job got.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Published,
    CreatedUnpublished,
    CreationFailed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutcomeTimestamps {
    pub created_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

/// Before/after view of a job's asset.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutcomeSummary {
    pub job_id: JobId,
    pub previous_asset_id: Option<AssetId>,
    pub previous_name: String,
    /// Prices of prior assets are not tracked.
    pub previous_price: Option<Value>,
    pub new_asset_id: Option<AssetId>,
    pub new_name: String,
    pub new_price: Option<Value>,
    pub status: OutcomeStatus,
    pub timestamps: OutcomeTimestamps,
}

impl OutcomeSummary {
    pub fn from_record(record: &JobRecord) -> Self {
        let meta = &record.metadata;
        let previous_name = meta
            .previous_name
            .clone()
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| meta.name.clone());
        let new_name = if previous_name.trim().is_empty() {
            "Model [New]".to_string()
        } else {
            format!("{previous_name} [New]")
        };

        let (new_price, published_at) = match &record.chained_action {
            Some(ChainedActionOutcome::Completed {
                response, completed_at, ..
            }) => (response.get("price").filter(|p| !p.is_null()).cloned(), Some(*completed_at)),
            _ => (None, None),
        };

        let status = if published_at.is_some() {
            OutcomeStatus::Published
        } else if record.external_id.is_some() {
            OutcomeStatus::CreatedUnpublished
        } else {
            OutcomeStatus::CreationFailed
        };

        Self {
            job_id: record.id,
            previous_asset_id: meta.base_asset_id.clone(),
            previous_name,
            previous_price: None,
            new_asset_id: record.external_id.clone(),
            new_name,
            new_price,
            status,
            timestamps: OutcomeTimestamps {
                created_at: record.created_at,
                completed_at: published_at.unwrap_or_else(Utc::now),
            },
        }
    }
}
