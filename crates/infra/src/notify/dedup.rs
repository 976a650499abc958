//! Notification deduplication.
//!
//! Remembers which (kind, scope) pairs already produced a side-effecting
//! notification so retries and restarts never send them twice. State is
//! persisted after every mutation; a crash between "decided to send" and
//! "sent" loses the notification rather than duplicating it.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use assetbridge_core::{AssetId, JobId};

/// What is being deduplicated.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DedupKind {
    /// A file attachment (the job's document), keyed by job or asset.
    File,
    /// A named event, keyed by job.
    Event(String),
}

impl DedupKind {
    pub fn event(name: impl Into<String>) -> Self {
        Self::Event(name.into())
    }
}

/// Identifiers a notification is scoped to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DedupScope {
    pub job: Option<JobId>,
    pub asset: Option<AssetId>,
}

impl DedupScope {
    pub fn job(id: JobId) -> Self {
        Self {
            job: Some(id),
            asset: None,
        }
    }

    pub fn asset(id: AssetId) -> Self {
        Self {
            job: None,
            asset: Some(id),
        }
    }

    pub fn with_asset(mut self, asset: Option<AssetId>) -> Self {
        self.asset = asset;
        self
    }
}

/// Dedup persistence error.
#[derive(Debug, thiserror::Error)]
pub enum DedupError {
    #[error("failed to write dedup state to {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode dedup state: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct DedupState {
    sent_file_by_asset: BTreeSet<String>,
    sent_file_by_job: BTreeSet<String>,
    sent_event_by_job: BTreeSet<String>,
}

#[derive(Debug, Clone, Copy)]
enum KeySet {
    FileByAsset,
    FileByJob,
    EventByJob,
}

impl DedupState {
    fn set(&self, which: KeySet) -> &BTreeSet<String> {
        match which {
            KeySet::FileByAsset => &self.sent_file_by_asset,
            KeySet::FileByJob => &self.sent_file_by_job,
            KeySet::EventByJob => &self.sent_event_by_job,
        }
    }

    fn set_mut(&mut self, which: KeySet) -> &mut BTreeSet<String> {
        match which {
            KeySet::FileByAsset => &mut self.sent_file_by_asset,
            KeySet::FileByJob => &mut self.sent_file_by_job,
            KeySet::EventByJob => &mut self.sent_event_by_job,
        }
    }
}

/// Tracks already-sent notifications.
#[derive(Debug, Default)]
pub struct NotificationDeduplicator {
    state: DedupState,
    path: Option<PathBuf>,
}

impl NotificationDeduplicator {
    /// Memory-only deduplicator (tests, or when no state file is wanted).
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Load state from `path`; a missing or corrupt file starts empty.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let state = match fs::read_to_string(&path) {
            Ok(raw) if raw.trim().is_empty() => DedupState::default(),
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "dedup state is corrupt; starting empty");
                DedupState::default()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => DedupState::default(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to read dedup state");
                DedupState::default()
            }
        };
        Self {
            state,
            path: Some(path),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn keys(kind: &DedupKind, scope: &DedupScope) -> Vec<(KeySet, String)> {
        let mut keys = Vec::new();
        match kind {
            DedupKind::File => {
                if let Some(job) = scope.job {
                    keys.push((KeySet::FileByJob, format!("job:{job}")));
                }
                if let Some(asset) = &scope.asset {
                    keys.push((KeySet::FileByAsset, format!("asset:{asset}")));
                }
            }
            DedupKind::Event(name) => {
                if let Some(job) = scope.job {
                    keys.push((KeySet::EventByJob, format!("event:{name}:job:{job}")));
                }
            }
        }
        keys
    }

    /// Whether any key for (kind, scope) is already recorded.
    pub fn is_recorded(&self, kind: &DedupKind, scope: &DedupScope) -> bool {
        Self::keys(kind, scope)
            .iter()
            .any(|(set, key)| self.state.set(*set).contains(key))
    }

    /// Decide whether to send, recording the keys when the answer is yes.
    ///
    /// A scope with no usable identifier cannot be deduplicated and is always
    /// allowed through.
    pub fn should_send(&mut self, kind: &DedupKind, scope: &DedupScope) -> bool {
        let keys = Self::keys(kind, scope);
        if keys.is_empty() {
            return true;
        }
        if keys.iter().any(|(set, key)| self.state.set(*set).contains(key)) {
            return false;
        }
        for (set, key) in keys {
            self.state.set_mut(set).insert(key);
        }
        if let Err(e) = self.persist() {
            warn!(error = %e, "failed to persist dedup state");
        }
        true
    }

    fn persist(&self) -> Result<(), DedupError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let io = |source| DedupError::Io {
            path: path.clone(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io)?;
        }
        let body = serde_json::to_vec_pretty(&self.state)?;
        fs::write(path, body).map_err(io)
    }
}
