//! Notification port.
//!
//! Every side-effecting notification (audit webhook events, file attachments)
//! goes through the [`Notifier`] trait. Business code talks to the
//! [`Notifications`] facade, which applies deduplication and swallows
//! delivery failures so they can never change a job's outcome.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

pub mod dedup;
pub mod webhook;

pub use dedup::{DedupError, DedupKind, DedupScope, NotificationDeduplicator};
pub use webhook::WebhookNotifier;

/// A structured event: a name plus ordered key/value fields.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotificationEvent {
    pub name: String,
    pub fields: Vec<(String, Value)>,
}

impl NotificationEvent {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
        }
    }

    /// Append a field; values that fail to serialize become `null`.
    pub fn field(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        let value = serde_json::to_value(value).unwrap_or(Value::Null);
        self.fields.push((key.into(), value));
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Fields as a JSON object (for logging).
    pub fn fields_json(&self) -> Value {
        Value::Object(self.fields.iter().cloned().collect())
    }
}

/// Notification delivery error.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("notification sink returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("notification transport error: {0}")]
    Transport(String),
    #[error("failed to read attachment {path}: {message}")]
    Attachment { path: PathBuf, message: String },
    #[error("notification sink unavailable")]
    Unavailable,
}

/// Notification sink.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver a structured event.
    async fn send(&self, event: &NotificationEvent) -> Result<(), NotifyError>;

    /// Deliver a structured event with a file attached.
    async fn send_file(&self, event: &NotificationEvent, path: &Path) -> Result<(), NotifyError>;
}

/// Fallback sink used when no webhook is configured: events go to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, event: &NotificationEvent) -> Result<(), NotifyError> {
        info!(event = %event.name, fields = %event.fields_json(), "notification");
        Ok(())
    }

    async fn send_file(&self, event: &NotificationEvent, path: &Path) -> Result<(), NotifyError> {
        info!(
            event = %event.name,
            fields = %event.fields_json(),
            file = %path.display(),
            "notification with attachment"
        );
        Ok(())
    }
}

/// A notification captured by [`RecordingNotifier`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedNotification {
    pub event: NotificationEvent,
    pub file: Option<PathBuf>,
}

/// In-memory sink for tests/dev. Can be switched to fail every delivery.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<RecordedNotification>>,
    unreachable: AtomicBool,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Make every subsequent delivery fail (notifications are still recorded).
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn all(&self) -> Vec<RecordedNotification> {
        self.sent.lock().unwrap().clone()
    }

    pub fn names(&self) -> Vec<String> {
        self.all().into_iter().map(|n| n.event.name).collect()
    }

    pub fn count(&self, name: &str) -> usize {
        self.all().iter().filter(|n| n.event.name == name).count()
    }

    pub fn find(&self, name: &str) -> Option<RecordedNotification> {
        self.all().into_iter().find(|n| n.event.name == name)
    }

    fn record(&self, event: &NotificationEvent, file: Option<&Path>) -> Result<(), NotifyError> {
        self.sent.lock().unwrap().push(RecordedNotification {
            event: event.clone(),
            file: file.map(Path::to_path_buf),
        });
        if self.unreachable.load(Ordering::SeqCst) {
            Err(NotifyError::Unavailable)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, event: &NotificationEvent) -> Result<(), NotifyError> {
        self.record(event, None)
    }

    async fn send_file(&self, event: &NotificationEvent, path: &Path) -> Result<(), NotifyError> {
        self.record(event, Some(path))
    }
}

/// Dedup-aware, failure-swallowing front of a [`Notifier`].
///
/// Delivery is attempted once; failures are logged at `warn` and dropped.
pub struct Notifications {
    notifier: Arc<dyn Notifier>,
    dedup: Mutex<NotificationDeduplicator>,
}

impl std::fmt::Debug for Notifications {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifications")
            .field("dedup", &self.dedup)
            .finish_non_exhaustive()
    }
}

impl Notifications {
    pub fn new(notifier: Arc<dyn Notifier>, dedup: NotificationDeduplicator) -> Self {
        Self {
            notifier,
            dedup: Mutex::new(dedup),
        }
    }

    /// Memory-only dedup; handy in tests.
    pub fn without_persistence(notifier: Arc<dyn Notifier>) -> Self {
        Self::new(notifier, NotificationDeduplicator::in_memory())
    }

    fn should_send(&self, kind: &DedupKind, scope: &DedupScope) -> bool {
        match self.dedup.lock() {
            Ok(mut dedup) => dedup.should_send(kind, scope),
            // A poisoned lock means a panic mid-update; prefer a missed send.
            Err(_) => false,
        }
    }

    /// Send without deduplication.
    pub async fn emit(&self, event: NotificationEvent) {
        if let Err(e) = self.notifier.send(&event).await {
            warn!(event = %event.name, error = %e, "failed to send notification");
        }
    }

    /// Send at most once per (event name, job) for the lifetime of the dedup state.
    pub async fn emit_once(&self, event: NotificationEvent, scope: DedupScope) {
        if !self.should_send(&DedupKind::event(event.name.clone()), &scope) {
            tracing::debug!(event = %event.name, "notification already sent; skipping");
            return;
        }
        self.emit(event).await;
    }

    /// Send with the document attached, at most once per job/asset.
    ///
    /// Without a file the event is sent plainly and not deduplicated.
    pub async fn emit_file_once(&self, event: NotificationEvent, file: Option<&Path>, scope: DedupScope) {
        let Some(path) = file else {
            self.emit(event).await;
            return;
        };
        if !self.should_send(&DedupKind::File, &scope) {
            tracing::debug!(event = %event.name, "attachment already sent; skipping");
            return;
        }
        if let Err(e) = self.notifier.send_file(&event, path).await {
            warn!(event = %event.name, file = %path.display(), error = %e, "failed to send notification file");
        }
    }
}
