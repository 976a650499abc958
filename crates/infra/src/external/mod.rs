//! External service clients/adapters.
//!
//! [`AssetApi`] is the raw transport to the assets service (one call per
//! method, no retries). [`AssetSubmitter`] layers the retry, polling and
//! chained-action rules on top of it.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::Url;
use serde_json::{json, Value};

use crate::config::AssetsApiConfig;
use crate::jobs::types::JobPayload;
use assetbridge_core::AssetId;

pub mod submitter;

pub use submitter::{AssetSubmitter, SubmissionError};

/// A single failed call to the assets service.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransportError {
    #[error("HTTP {status}")]
    Status { status: u16, body: Option<Value> },
    #[error("network error: {0}")]
    Network(String),
    #[error("invalid response body: {0}")]
    Decode(String),
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
}

impl TransportError {
    pub fn status(status: u16) -> Self {
        Self::Status { status, body: None }
    }

    /// Response body of a failed call, when the service sent one.
    pub fn detail(&self) -> Option<Value> {
        match self {
            TransportError::Status { body, .. } => body.clone(),
            _ => None,
        }
    }
}

/// Raw calls against the assets service.
#[async_trait]
pub trait AssetApi: Send + Sync {
    /// Submit a payload for asset creation.
    async fn create_asset(&self, payload: &JobPayload) -> Result<Value, TransportError>;

    /// Fetch the status of an asynchronous operation.
    async fn get_operation(&self, operation_id: &str) -> Result<Value, TransportError>;

    /// Chained action: POST `body` to `url`.
    async fn publish(&self, url: &str, body: &Value) -> Result<Value, TransportError>;

    /// Download the raw document of an existing asset.
    async fn download_asset(&self, asset_id: &AssetId) -> Result<Vec<u8>, TransportError>;
}

/// reqwest-backed [`AssetApi`].
#[derive(Debug, Clone)]
pub struct HttpAssetApi {
    client: reqwest::Client,
    config: AssetsApiConfig,
}

impl HttpAssetApi {
    pub fn new(config: AssetsApiConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self { client, config })
    }

    pub fn with_client(client: reqwest::Client, config: AssetsApiConfig) -> Self {
        Self { client, config }
    }

    fn authorize(&self, mut req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if let Some(token) = &self.config.bearer_token {
            req = req.bearer_auth(token);
        }
        if let Some(key) = &self.config.api_key {
            req = req.header("x-api-key", key);
        }
        req
    }

    async fn read(response: reqwest::Response) -> Result<Value, TransportError> {
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;
        let body = parse_body(&text);

        if status.is_success() {
            Ok(body)
        } else {
            Err(TransportError::Status {
                status: status.as_u16(),
                body: (!text.trim().is_empty()).then_some(body),
            })
        }
    }

    async fn execute(&self, req: reqwest::RequestBuilder) -> Result<Value, TransportError> {
        let response = self
            .authorize(req)
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;
        Self::read(response).await
    }

    fn operation_url(&self, operation_id: &str) -> Result<Url, TransportError> {
        let mut url = Url::parse(&self.config.operations_url)
            .map_err(|e| TransportError::InvalidUrl(format!("{}: {e}", self.config.operations_url)))?;
        url.path_segments_mut()
            .map_err(|()| TransportError::InvalidUrl(self.config.operations_url.clone()))?
            .pop_if_empty()
            .push(operation_id);
        Ok(url)
    }

    fn delivery_url(&self, asset_id: &AssetId) -> String {
        format!("{}{}", self.config.delivery_url, encode_query_value(asset_id.as_str()))
    }
}

/// Percent-encode `raw` as a single URL path segment.
pub(crate) fn encode_path_segment(raw: &str) -> String {
    let Ok(mut url) = Url::parse("http://localhost/") else {
        return raw.to_string();
    };
    if let Ok(mut segments) = url.path_segments_mut() {
        segments.clear().push(raw);
    }
    url.path().trim_start_matches('/').to_string()
}

/// Form-encode `raw` as a query value.
pub(crate) fn encode_query_value(raw: &str) -> String {
    let Ok(mut url) = Url::parse("http://localhost/") else {
        return raw.to_string();
    };
    url.query_pairs_mut().append_pair("v", raw);
    url.query()
        .and_then(|q| q.strip_prefix("v="))
        .unwrap_or(raw)
        .to_string()
}

/// JSON when possible, otherwise the raw text; empty bodies become `null`.
fn parse_body(text: &str) -> Value {
    if text.trim().is_empty() {
        return Value::Null;
    }
    serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
}

#[async_trait]
impl AssetApi for HttpAssetApi {
    async fn create_asset(&self, payload: &JobPayload) -> Result<Value, TransportError> {
        let file = Part::bytes(payload.content.clone())
            .file_name(payload.file_name.clone())
            .mime_str(&payload.content_type)
            .map_err(|e| TransportError::Decode(e.to_string()))?;

        let form = payload
            .fields
            .iter()
            .fold(Form::new().part("file", file), |form, (k, v)| {
                form.text(k.clone(), v.clone())
            });

        self.execute(self.client.post(&self.config.assets_url).multipart(form))
            .await
    }

    async fn get_operation(&self, operation_id: &str) -> Result<Value, TransportError> {
        let url = self.operation_url(operation_id)?;
        self.execute(self.client.get(url)).await
    }

    async fn publish(&self, url: &str, body: &Value) -> Result<Value, TransportError> {
        self.execute(self.client.post(url).json(body)).await
    }

    async fn download_asset(&self, asset_id: &AssetId) -> Result<Vec<u8>, TransportError> {
        let mut req = self.client.get(self.delivery_url(asset_id));
        if let Some(token) = &self.config.bearer_token {
            req = req.bearer_auth(token);
        }
        let response = req.send().await.map_err(|e| TransportError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(TransportError::Status {
                status: status.as_u16(),
                body: (!text.trim().is_empty()).then(|| parse_body(&text)),
            });
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;
        Ok(bytes.to_vec())
    }
}

/// Calls observed by [`ScriptedAssetApi`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApiCalls {
    /// Payload sizes of each submission.
    pub submissions: Vec<usize>,
    /// Operation ids of each poll.
    pub polls: Vec<String>,
    /// URLs of each chained-action call.
    pub publishes: Vec<String>,
    /// Asset ids of each base-asset download.
    pub downloads: Vec<AssetId>,
}

/// In-memory [`AssetApi`] for tests/dev, replaying scripted responses.
///
/// When a script runs dry: submissions fail with a network error, polls
/// report "pending", publishes succeed with an empty object, and downloads
/// fail with a 404.
#[derive(Debug, Default)]
pub struct ScriptedAssetApi {
    submissions: Mutex<VecDeque<Result<Value, TransportError>>>,
    operations: Mutex<VecDeque<Result<Value, TransportError>>>,
    publishes: Mutex<VecDeque<Result<Value, TransportError>>>,
    downloads: Mutex<VecDeque<Result<Vec<u8>, TransportError>>>,
    calls: Mutex<ApiCalls>,
}

impl ScriptedAssetApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_submission(&self, result: Result<Value, TransportError>) -> &Self {
        self.submissions.lock().unwrap().push_back(result);
        self
    }

    pub fn push_operation(&self, result: Result<Value, TransportError>) -> &Self {
        self.operations.lock().unwrap().push_back(result);
        self
    }

    pub fn push_publish(&self, result: Result<Value, TransportError>) -> &Self {
        self.publishes.lock().unwrap().push_back(result);
        self
    }

    pub fn push_download(&self, result: Result<Vec<u8>, TransportError>) -> &Self {
        self.downloads.lock().unwrap().push_back(result);
        self
    }

    pub fn calls(&self) -> ApiCalls {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl AssetApi for ScriptedAssetApi {
    async fn create_asset(&self, payload: &JobPayload) -> Result<Value, TransportError> {
        self.calls.lock().unwrap().submissions.push(payload.content.len());
        self.submissions
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(TransportError::Network("no scripted submission".to_string())))
    }

    async fn get_operation(&self, operation_id: &str) -> Result<Value, TransportError> {
        self.calls.lock().unwrap().polls.push(operation_id.to_string());
        self.operations
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(json!({ "done": false })))
    }

    async fn publish(&self, url: &str, _body: &Value) -> Result<Value, TransportError> {
        self.calls.lock().unwrap().publishes.push(url.to_string());
        self.publishes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(json!({})))
    }

    async fn download_asset(&self, asset_id: &AssetId) -> Result<Vec<u8>, TransportError> {
        self.calls.lock().unwrap().downloads.push(asset_id.clone());
        self.downloads
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(TransportError::status(404)))
    }
}
