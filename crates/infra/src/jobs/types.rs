//! Core job types.
//!
//! A job is split in two: the durable [`JobRecord`] (what gets persisted and
//! reported) and the ephemeral [`JobPayload`] (file bytes + form fields) that
//! only lives in process memory.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use assetbridge_core::{AssetId, JobId};

/// Job lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for the worker
    Queued,
    /// Currently being submitted/polled
    Processing,
    /// Completed successfully
    Done,
    /// Gave up (retries exhausted, operation failed or timed out)
    Failed,
    /// Recovered after a restart without its payload; can never run
    Unexecutable,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed | JobStatus::Unexecutable)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
            JobStatus::Unexecutable => "unexecutable",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Caller-supplied descriptive fields. Opaque to the queue, persisted verbatim.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobMetadata {
    /// Display name of the asset.
    pub name: String,
    /// File name of the uploaded document.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    /// Local copy of the document (attached to notifications).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filepath: Option<PathBuf>,
    /// Asset-type classifier forwarded to the assets API.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset_type: Option<String>,
    /// Existing asset this job derives from, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_asset_id: Option<AssetId>,
    /// Display name of the base asset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_name: Option<String>,
}

impl JobMetadata {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// The live work package: one file plus form fields.
///
/// Never serialized; dropped on restart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobPayload {
    pub file_name: String,
    pub content_type: String,
    pub content: Vec<u8>,
    pub fields: BTreeMap<String, String>,
}

impl JobPayload {
    pub fn new(file_name: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        Self {
            file_name: file_name.into(),
            content_type: "application/xml".to_string(),
            content: content.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }
}

/// Outcome of the optional chained (publish) action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ChainedActionOutcome {
    /// The asset was not eligible; no call was made.
    #[serde(rename_all = "camelCase")]
    Skipped {
        reason: String,
        allow_list: Vec<AssetId>,
    },
    /// The call succeeded.
    #[serde(rename_all = "camelCase")]
    Completed {
        url: String,
        response: Value,
        started_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
    },
    /// The call was attempted and failed (non-fatal for the job).
    #[serde(rename_all = "camelCase")]
    Failed {
        url: String,
        error: String,
        started_at: DateTime<Utc>,
    },
}

impl ChainedActionOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, ChainedActionOutcome::Completed { .. })
    }
}

/// Successful result of a submission, as reported by the external client.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmissionOutcome {
    /// Terminal response (operation status for async submissions).
    pub response: Value,
    pub operation_id: Option<String>,
    pub external_id: Option<AssetId>,
    pub chained_action: Option<ChainedActionOutcome>,
    pub publish_error: Option<String>,
}

/// Illegal lifecycle transition.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("job {id}: cannot move from {from} to {to}")]
pub struct InvalidTransition {
    pub id: JobId,
    pub from: JobStatus,
    pub to: JobStatus,
}

/// Durable job record: everything about a job except its payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub id: JobId,
    pub status: JobStatus,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub metadata: JobMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<AssetId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chained_action: Option<ChainedActionOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publish_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    /// Create a new queued record.
    pub fn new(id: JobId, metadata: JobMetadata) -> Self {
        Self {
            id,
            status: JobStatus::Queued,
            attempts: 0,
            created_at: Utc::now(),
            metadata,
            response: None,
            error: None,
            error_detail: None,
            operation_id: None,
            external_id: None,
            chained_action: None,
            publish_error: None,
            completed_at: None,
        }
    }

    fn transition(&mut self, allowed_from: &[JobStatus], to: JobStatus) -> Result<(), InvalidTransition> {
        if !allowed_from.contains(&self.status) {
            return Err(InvalidTransition {
                id: self.id,
                from: self.status,
                to,
            });
        }
        self.status = to;
        if to.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Mark job as picked up by the worker.
    pub fn mark_processing(&mut self) -> Result<(), InvalidTransition> {
        self.transition(&[JobStatus::Queued], JobStatus::Processing)
    }

    /// Mark job as completed with the submission outcome.
    pub fn mark_done(&mut self, outcome: SubmissionOutcome) -> Result<(), InvalidTransition> {
        self.transition(&[JobStatus::Processing], JobStatus::Done)?;
        self.response = Some(outcome.response);
        self.operation_id = outcome.operation_id;
        self.external_id = outcome.external_id;
        self.chained_action = outcome.chained_action;
        self.publish_error = outcome.publish_error;
        Ok(())
    }

    /// Mark job as permanently failed.
    pub fn mark_failed(
        &mut self,
        error: impl Into<String>,
        detail: Option<Value>,
    ) -> Result<(), InvalidTransition> {
        self.transition(&[JobStatus::Processing], JobStatus::Failed)?;
        self.error = Some(error.into());
        self.error_detail = detail;
        Ok(())
    }

    /// Mark a record whose payload is gone (recovered after restart).
    pub fn mark_unexecutable(&mut self, reason: impl Into<String>) -> Result<(), InvalidTransition> {
        self.transition(&[JobStatus::Queued, JobStatus::Processing], JobStatus::Unexecutable)?;
        self.error = Some(reason.into());
        Ok(())
    }

    /// Redacted list view.
    pub fn summary(&self) -> JobSummary {
        JobSummary {
            id: self.id,
            attempts: self.attempts,
            status: self.status,
            created_at: self.created_at,
            metadata: self.metadata.clone(),
        }
    }
}

/// List view of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSummary {
    pub id: JobId,
    pub attempts: u32,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub metadata: JobMetadata,
}

/// Job counts per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub queued: usize,
    pub processing: usize,
    pub done: usize,
    pub failed: usize,
    pub unexecutable: usize,
}

impl JobStats {
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a JobRecord>) -> Self {
        let mut stats = Self::default();
        for record in records {
            match record.status {
                JobStatus::Queued => stats.queued += 1,
                JobStatus::Processing => stats.processing += 1,
                JobStatus::Done => stats.done += 1,
                JobStatus::Failed => stats.failed += 1,
                JobStatus::Unexecutable => stats.unexecutable += 1,
            }
        }
        stats
    }
}
