//! Job list persistence.
//!
//! The store is deliberately dumb: it loads and saves the whole list. All
//! lifecycle rules live in the queue.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use super::types::JobRecord;

/// Job store abstraction.
pub trait JobStore: Send + Sync {
    /// Load all persisted records in insertion order.
    ///
    /// A missing or unreadable backing file yields an empty list.
    fn load(&self) -> Vec<JobRecord>;

    /// Replace the persisted list with `records`.
    fn save(&self, records: &[JobRecord]) -> Result<(), JobStoreError>;
}

/// Job store error.
#[derive(Debug, thiserror::Error)]
pub enum JobStoreError {
    #[error("failed to write job list to {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode job list: {0}")]
    Encode(#[from] serde_json::Error),
}

/// JSON file store. The whole list is rewritten on every save.
#[derive(Debug, Clone)]
pub struct JsonFileJobStore {
    path: PathBuf,
}

impl JsonFileJobStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> JobStoreError {
        JobStoreError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl JobStore for JsonFileJobStore {
    fn load(&self) -> Vec<JobRecord> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "failed to read persisted queue");
                return Vec::new();
            }
        };

        match serde_json::from_str::<Vec<JobRecord>>(&raw) {
            Ok(records) => {
                debug!(path = %self.path.display(), count = records.len(), "loaded persisted queue");
                records
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "persisted queue is corrupt; starting empty");
                Vec::new()
            }
        }
    }

    fn save(&self, records: &[JobRecord]) -> Result<(), JobStoreError> {
        let body = serde_json::to_vec_pretty(records)?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;
        }

        // Readers only ever see a complete list.
        let tmp = self.path.with_extension("json.tmp");
        {
            let mut file = fs::File::create(&tmp).map_err(|e| self.io_error(e))?;
            file.write_all(&body).map_err(|e| self.io_error(e))?;
            file.sync_all().map_err(|e| self.io_error(e))?;
        }
        fs::rename(&tmp, &self.path).map_err(|e| self.io_error(e))
    }
}

/// In-memory job store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    records: Mutex<Vec<JobRecord>>,
    saves: Mutex<usize>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Seed the store as if a previous process had saved `records`.
    pub fn with_records(records: Vec<JobRecord>) -> Self {
        Self {
            records: Mutex::new(records),
            saves: Mutex::new(0),
        }
    }

    /// Snapshot of the last saved list.
    pub fn snapshot(&self) -> Vec<JobRecord> {
        self.records.lock().unwrap().clone()
    }

    /// Number of `save` calls so far.
    pub fn save_count(&self) -> usize {
        *self.saves.lock().unwrap()
    }
}

impl JobStore for InMemoryJobStore {
    fn load(&self) -> Vec<JobRecord> {
        self.snapshot()
    }

    fn save(&self, records: &[JobRecord]) -> Result<(), JobStoreError> {
        *self.records.lock().unwrap() = records.to_vec();
        *self.saves.lock().unwrap() += 1;
        Ok(())
    }
}

impl<S: JobStore + ?Sized> JobStore for Arc<S> {
    fn load(&self) -> Vec<JobRecord> {
        (**self).load()
    }

    fn save(&self, records: &[JobRecord]) -> Result<(), JobStoreError> {
        (**self).save(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::types::{JobMetadata, JobStatus};
    use assetbridge_core::JobId;

    fn record(id: u64) -> JobRecord {
        JobRecord::new(JobId::new(id), JobMetadata::new(format!("job-{id}")))
    }

    #[test]
    fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileJobStore::new(dir.path().join("queue.json"));
        assert!(store.load().is_empty());
    }

    #[test]
    fn save_then_load_round_trips_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileJobStore::new(dir.path().join("nested/queue.json"));

        let mut second = record(2);
        second.mark_processing().unwrap();
        second.mark_failed("gave up", Some(serde_json::json!({"code": 500}))).unwrap();
        let records = vec![record(1), second, record(3)];

        store.save(&records).unwrap();
        let loaded = store.load();

        assert_eq!(loaded, records);
        assert_eq!(loaded[1].status, JobStatus::Failed);
        assert!(!dir.path().join("nested/queue.json.tmp").exists());
    }

    #[test]
    fn corrupt_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.json");
        fs::write(&path, "{ not json").unwrap();

        let store = JsonFileJobStore::new(&path);
        assert!(store.load().is_empty());

        // A subsequent save repairs the file.
        store.save(&[record(9)]).unwrap();
        assert_eq!(store.load().len(), 1);
    }

    #[test]
    fn save_overwrites_previous_contents() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileJobStore::new(dir.path().join("queue.json"));

        store.save(&[record(1), record(2)]).unwrap();
        store.save(&[record(1)]).unwrap();

        assert_eq!(store.load().len(), 1);
    }

    #[test]
    fn in_memory_store_counts_saves() {
        let store = InMemoryJobStore::new();
        store.save(&[record(1)]).unwrap();
        store.save(&[record(1), record(2)]).unwrap();
        assert_eq!(store.save_count(), 2);
        assert_eq!(store.load().len(), 2);
    }
}
