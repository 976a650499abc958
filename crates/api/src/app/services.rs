//! Service wiring shared by the handlers.

use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

use chrono::Utc;
use regex::Regex;

use assetbridge_infra::config::BridgeConfig;
use assetbridge_infra::external::{AssetApi, AssetSubmitter};
use assetbridge_infra::jobs::{AuditLog, JobMetadata, JobPayload, JobQueue, JsonFileJobStore};
use assetbridge_infra::notify::{NotificationDeduplicator, Notifications, Notifier};

/// Asset type sent when the caller does not name one.
pub const DEFAULT_ASSET_TYPE: &str = "13";

static DOCUMENT_NAME: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r#"(?i)<string\s+name="Name">([^<]+)</string>"#).ok());

/// Everything a handler needs.
pub struct AppServices {
    pub queue: JobQueue,
    pub notifications: Arc<Notifications>,
    /// Used to fetch base assets.
    pub api: Arc<dyn AssetApi>,
    /// Where uploaded documents are written.
    pub out_dir: PathBuf,
    /// Replaces the requested asset type when set.
    pub asset_type: Option<String>,
    /// Uploads must present this secret when set.
    pub experience_secret: Option<String>,
}

impl std::fmt::Debug for AppServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppServices")
            .field("queue", &self.queue)
            .field("out_dir", &self.out_dir)
            .field("asset_type", &self.asset_type)
            .field("experience_secret", &self.experience_secret.as_ref().map(|_| "<redacted>"))
            .finish_non_exhaustive()
    }
}

impl AppServices {
    pub fn new(
        queue: JobQueue,
        notifications: Arc<Notifications>,
        api: Arc<dyn AssetApi>,
        out_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            queue,
            notifications,
            api,
            out_dir: out_dir.into(),
            asset_type: None,
            experience_secret: None,
        }
    }

    /// Wire the file-backed queue and dedup state described by `config`.
    pub fn from_config(config: &BridgeConfig, api: Arc<dyn AssetApi>, notifier: Arc<dyn Notifier>) -> Self {
        let dedup = NotificationDeduplicator::open(config.dedup_state_path());
        let notifications = Arc::new(Notifications::new(notifier, dedup));
        let submitter = AssetSubmitter::new(
            api.clone(),
            notifications.clone(),
            config.retry.clone(),
            config.chained_action.clone(),
        );
        let store = Arc::new(JsonFileJobStore::new(&config.store_path));
        let queue = JobQueue::recover(store, submitter, notifications.clone(), AuditLog::new(&config.out_dir));
        Self {
            asset_type: config.asset_type.clone(),
            experience_secret: config.experience_secret.clone(),
            ..Self::new(queue, notifications, api, &config.out_dir)
        }
    }

    /// Whether a presented secret satisfies the configured one.
    pub fn accepts_secret(&self, presented: Option<&str>) -> bool {
        match &self.experience_secret {
            None => true,
            Some(expected) => presented == Some(expected.as_str()),
        }
    }

    /// Configured override, then the requested type, then the default.
    pub fn asset_type_for(&self, requested: Option<&str>) -> String {
        self.asset_type
            .as_deref()
            .or(requested.filter(|t| !t.trim().is_empty()))
            .unwrap_or(DEFAULT_ASSET_TYPE)
            .to_string()
    }

    /// Write an uploaded document under the output directory.
    pub async fn save_document(&self, name: &str, base_name: Option<&str>, content: &str) -> std::io::Result<PathBuf> {
        tokio::fs::create_dir_all(&self.out_dir).await?;
        let path = self
            .out_dir
            .join(document_file_name(name, base_name, Utc::now().timestamp_millis()));
        tokio::fs::write(&path, content).await?;
        Ok(path)
    }
}

/// Name recorded inside a serialized document, if any.
pub fn document_name(document: &str) -> Option<String> {
    let pattern = DOCUMENT_NAME.as_ref()?;
    let name = pattern.captures(document)?.get(1)?.as_str().trim();
    (!name.is_empty()).then(|| name.to_string())
}

fn file_safe(name: &str) -> String {
    name.trim()
        .chars()
        .map(|c| if c.is_whitespace() || c == '/' || c == '\\' { '_' } else { c })
        .collect()
}

/// `<millis>-<name>.rbxm`, or `<base>-<name>-<millis>.rbxm` for a document
/// derived from a named base asset. Whitespace and path separators are replaced.
pub fn document_file_name(name: &str, base_name: Option<&str>, millis: i64) -> String {
    match base_name {
        Some(base) => format!("{}-{}-{millis}.rbxm", file_safe(base), file_safe(name)),
        None => format!("{millis}-{}.rbxm", file_safe(name)),
    }
}

/// Build the submission payload for a stored document.
///
/// Form fields: `assetType`, and `name` set to the file name without extension.
pub fn payload_for(metadata: &JobMetadata, content: Vec<u8>) -> JobPayload {
    let file_name = metadata
        .filename
        .clone()
        .unwrap_or_else(|| document_file_name(&metadata.name, None, 0));
    let display_name = Path::new(&file_name)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| metadata.name.clone());
    let asset_type = metadata
        .asset_type
        .clone()
        .unwrap_or_else(|| DEFAULT_ASSET_TYPE.to_string());

    JobPayload::new(file_name, content)
        .with_field("assetType", asset_type)
        .with_field("name", display_name)
}
