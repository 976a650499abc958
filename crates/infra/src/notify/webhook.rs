//! Chat-webhook notification sink (embed-style JSON, multipart for files).

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::multipart::{Form, Part};
use serde_json::{json, Value};

use super::{NotificationEvent, Notifier, NotifyError};

const EMBED_COLOR: u32 = 3_066_993;
const FIELD_LIMIT: usize = 900;

/// Posts events to a webhook URL.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()?;
        Ok(Self::with_client(client, url))
    }

    pub fn with_client(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }

    async fn check(response: reqwest::Response) -> Result<(), NotifyError> {
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(NotifyError::Status {
            status: status.as_u16(),
            body: truncate(&body, FIELD_LIMIT),
        })
    }
}

/// Build the embed payload for an event.
pub fn embed_payload(event: &NotificationEvent) -> Value {
    let fields: Vec<Value> = event
        .fields
        .iter()
        .map(|(name, value)| {
            let text = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            let text = truncate(&text, FIELD_LIMIT);
            json!({
                "name": name,
                "value": if text.is_empty() { "(empty)".to_string() } else { text },
                "inline": false,
            })
        })
        .collect();

    json!({
        "embeds": [{
            "title": format!("Bridge Event: {}", event.name),
            "color": EMBED_COLOR,
            "fields": fields,
            "timestamp": Utc::now().to_rfc3339(),
        }]
    })
}

/// Cut `text` to `limit` characters, noting how much was dropped.
pub fn truncate(text: &str, limit: usize) -> String {
    let total = text.chars().count();
    if total <= limit {
        return text.to_string();
    }
    let head: String = text.chars().take(limit).collect();
    format!("{head}...({} more chars)", total - limit)
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn send(&self, event: &NotificationEvent) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(&self.url)
            .json(&embed_payload(event))
            .send()
            .await
            .map_err(|e| NotifyError::Transport(e.to_string()))?;
        Self::check(response).await
    }

    async fn send_file(&self, event: &NotificationEvent, path: &Path) -> Result<(), NotifyError> {
        let file_part = match tokio::fs::read(path).await {
            Ok(bytes) => {
                let file_name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "attachment".to_string());
                Part::bytes(bytes).file_name(file_name)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Part::bytes(Vec::new()).file_name("missing.txt")
            }
            Err(e) => {
                return Err(NotifyError::Attachment {
                    path: path.to_path_buf(),
                    message: e.to_string(),
                });
            }
        };

        let form = Form::new()
            .text("payload_json", embed_payload(event).to_string())
            .part("file", file_part);

        let response = self
            .client
            .post(&self.url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| NotifyError::Transport(e.to_string()))?;
        Self::check(response).await
    }
}
