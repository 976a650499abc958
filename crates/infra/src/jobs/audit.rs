//! Per-job audit files under the output directory.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::warn;

use assetbridge_core::JobId;

/// Writes `success/job-<id>-response.json` and `errors/job-<id>-error.json`.
#[derive(Debug, Clone)]
pub struct AuditLog {
    root: Option<PathBuf>,
}

impl AuditLog {
    pub fn new(out_dir: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(out_dir.into()),
        }
    }

    /// Audit log that writes nothing.
    pub fn disabled() -> Self {
        Self { root: None }
    }

    pub fn success_path(&self, id: JobId) -> Option<PathBuf> {
        self.root
            .as_ref()
            .map(|root| root.join("success").join(format!("job-{id}-response.json")))
    }

    pub fn error_path(&self, id: JobId) -> Option<PathBuf> {
        self.root
            .as_ref()
            .map(|root| root.join("errors").join(format!("job-{id}-error.json")))
    }

    pub fn record_success(&self, id: JobId, body: &impl Serialize) {
        if let Some(path) = self.success_path(id) {
            write_json(&path, body);
        }
    }

    pub fn record_error(&self, id: JobId, body: &impl Serialize) {
        if let Some(path) = self.error_path(id) {
            write_json(&path, body);
        }
    }
}

fn write_json(path: &Path, body: &impl Serialize) {
    let result = serde_json::to_vec_pretty(body)
        .map_err(std::io::Error::other)
        .and_then(|bytes| {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(path, bytes)
        });
    if let Err(e) = result {
        warn!(path = %path.display(), error = %e, "failed to write audit file");
    }
}
