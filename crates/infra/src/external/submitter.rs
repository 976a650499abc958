//! Submission with retry, operation polling and the chained publish action.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use assetbridge_core::{AssetId, JobId};

use super::{encode_path_segment, AssetApi, TransportError};
use crate::config::{ChainedActionConfig, RetryConfig};
use crate::jobs::types::{ChainedActionOutcome, JobPayload, SubmissionOutcome};
use crate::notify::{NotificationEvent, Notifications};

/// Terminal submission failure. Every variant fails the job.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SubmissionError {
    /// Every allowed attempt failed.
    #[error("submission failed after {attempts} attempt(s): {last_error}")]
    Exhausted {
        attempts: u32,
        last_error: String,
        detail: Option<Value>,
    },
    /// The service reported the operation as failed.
    #[error("operation {operation_id} reported failed")]
    OperationFailed { operation_id: String, detail: Value },
    /// The poll budget ran out.
    #[error("operation {operation_id} did not complete after {polls} poll(s)")]
    OperationTimedOut { operation_id: String, polls: u32 },
}

impl SubmissionError {
    /// Structured detail recorded as the job's `errorDetail`.
    pub fn detail(&self) -> Option<Value> {
        match self {
            SubmissionError::Exhausted { detail, .. } => detail.clone(),
            SubmissionError::OperationFailed { detail, .. } => Some(detail.clone()),
            SubmissionError::OperationTimedOut { .. } => None,
        }
    }
}

/// Drives one job's payload through the assets service.
pub struct AssetSubmitter {
    api: Arc<dyn AssetApi>,
    notifications: Arc<Notifications>,
    retry: RetryConfig,
    chained: ChainedActionConfig,
}

impl std::fmt::Debug for AssetSubmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssetSubmitter")
            .field("retry", &self.retry)
            .field("chained", &self.chained)
            .finish_non_exhaustive()
    }
}

impl AssetSubmitter {
    pub fn new(
        api: Arc<dyn AssetApi>,
        notifications: Arc<Notifications>,
        retry: RetryConfig,
        chained: ChainedActionConfig,
    ) -> Self {
        Self {
            api,
            notifications,
            retry,
            chained,
        }
    }

    /// Submit `payload`, counting attempts into `attempts`.
    ///
    /// `on_attempt` sees the new count before each attempt is sent.
    /// Transport failures are retried after a fixed delay until the ceiling
    /// is reached. An asynchronous answer is polled to completion; operation
    /// failure and poll timeout are not retried.
    pub async fn submit<F>(
        &self,
        job_id: JobId,
        attempts: &mut u32,
        payload: &JobPayload,
        mut on_attempt: F,
    ) -> Result<SubmissionOutcome, SubmissionError>
    where
        F: FnMut(u32) + Send,
    {
        let mut last_error: Option<TransportError> = None;

        while *attempts < self.retry.max_retries {
            *attempts += 1;
            on_attempt(*attempts);
            match self.api.create_asset(payload).await {
                Ok(response) => {
                    debug!(job_id = %job_id, attempt = *attempts, "submission accepted");
                    return self.resolve(job_id, response).await;
                }
                Err(e) => {
                    warn!(job_id = %job_id, attempt = *attempts, error = %e, "submission attempt failed");
                    last_error = Some(e);
                    if *attempts >= self.retry.max_retries {
                        break;
                    }
                    tokio::time::sleep(self.retry.retry_delay).await;
                }
            }
        }

        Err(SubmissionError::Exhausted {
            attempts: *attempts,
            last_error: last_error
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_else(|| "retry ceiling already reached".to_string()),
            detail: last_error.and_then(|e| e.detail()),
        })
    }

    async fn resolve(&self, job_id: JobId, response: Value) -> Result<SubmissionOutcome, SubmissionError> {
        match operation_id(&response) {
            Some(operation_id) => self.poll(job_id, operation_id).await,
            // The publish step only follows a polled operation.
            None => {
                let external_id = asset_id(&response);
                info!(job_id = %job_id, asset_id = ?external_id, "asset created synchronously");
                Ok(SubmissionOutcome {
                    response,
                    operation_id: None,
                    external_id,
                    chained_action: None,
                    publish_error: None,
                })
            }
        }
    }

    async fn poll(&self, job_id: JobId, operation_id: String) -> Result<SubmissionOutcome, SubmissionError> {
        info!(job_id = %job_id, operation_id = %operation_id, "polling operation");
        let max_polls = self.retry.max_polls;

        for poll in 1..=max_polls {
            match self.api.get_operation(&operation_id).await {
                Ok(data) => {
                    self.notifications
                        .emit(
                            NotificationEvent::new("operation_update")
                                .field("jobId", job_id)
                                .field("operationId", &operation_id)
                                .field("data", &data),
                        )
                        .await;

                    if let Some(external_id) = asset_id(&data) {
                        info!(job_id = %job_id, asset_id = %external_id, polls = poll, "operation completed");
                        let (chained_action, publish_error) = self.chained_action(job_id, &external_id).await;
                        return Ok(SubmissionOutcome {
                            response: data,
                            operation_id: Some(operation_id),
                            external_id: Some(external_id),
                            chained_action,
                            publish_error,
                        });
                    }
                    if reports_failure(&data) {
                        warn!(job_id = %job_id, operation_id = %operation_id, "operation reported failed");
                        return Err(SubmissionError::OperationFailed {
                            operation_id,
                            detail: data,
                        });
                    }
                }
                Err(e) => {
                    warn!(job_id = %job_id, operation_id = %operation_id, poll, error = %e, "operation poll failed");
                }
            }

            if poll < max_polls {
                tokio::time::sleep(self.retry.poll_interval).await;
            }
        }

        Err(SubmissionError::OperationTimedOut {
            operation_id,
            polls: max_polls,
        })
    }

    /// Run the publish step if it is enabled and the asset is eligible.
    async fn chained_action(
        &self,
        job_id: JobId,
        asset: &AssetId,
    ) -> (Option<ChainedActionOutcome>, Option<String>) {
        let template = match &self.chained.url_template {
            Some(template) if self.chained.is_active() => template,
            _ => return (None, None),
        };

        if !self.chained.allows(asset) {
            self.notifications
                .emit(
                    NotificationEvent::new("publish_skipped_not_allowed")
                        .field("jobId", job_id)
                        .field("assetId", asset)
                        .field("allowList", &self.chained.allow_list),
                )
                .await;
            return (
                Some(ChainedActionOutcome::Skipped {
                    reason: "not_in_allowlist".to_string(),
                    allow_list: self.chained.allow_list.clone(),
                }),
                None,
            );
        }

        let url = template.replace("{assetId}", &encode_path_segment(asset.as_str()));
        self.notifications
            .emit(
                NotificationEvent::new("publish_started")
                    .field("jobId", job_id)
                    .field("assetId", asset)
                    .field("publishUrl", &url),
            )
            .await;

        let started_at = Utc::now();
        let body = json!({ "assetId": asset, "makePublic": true });

        match self.api.publish(&url, &body).await {
            Ok(response) => {
                let completed_at = Utc::now();
                info!(job_id = %job_id, asset_id = %asset, "asset published");
                self.notifications
                    .emit(
                        NotificationEvent::new("publish_succeeded")
                            .field("jobId", job_id)
                            .field("assetId", asset)
                            .field("publishResponse", &response),
                    )
                    .await;
                (
                    Some(ChainedActionOutcome::Completed {
                        url,
                        response,
                        started_at,
                        completed_at,
                    }),
                    None,
                )
            }
            Err(e) => {
                let error = e.to_string();
                warn!(job_id = %job_id, asset_id = %asset, error = %error, "publish failed");
                self.notifications
                    .emit(
                        NotificationEvent::new("publish_failed")
                            .field("jobId", job_id)
                            .field("assetId", asset)
                            .field("error", &error),
                    )
                    .await;
                (
                    Some(ChainedActionOutcome::Failed {
                        url,
                        error: error.clone(),
                        started_at,
                    }),
                    Some(error),
                )
            }
        }
    }
}

fn string_field(value: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|k| value.get(*k))
        .find_map(|v| match v {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
}

/// Operation handle of an asynchronous submission.
pub fn operation_id(response: &Value) -> Option<String> {
    string_field(response, &["operationId", "operation_id"])
}

/// Asset id of a terminal response (top level, or inside `response`).
pub fn asset_id(response: &Value) -> Option<AssetId> {
    const KEYS: [&str; 2] = ["assetId", "asset_id"];
    let top = KEYS.iter().filter_map(|k| response.get(*k)).find_map(AssetId::from_json);
    top.or_else(|| {
        let nested = response.get("response")?;
        KEYS.iter().filter_map(|k| nested.get(*k)).find_map(AssetId::from_json)
    })
}

fn reports_failure(response: &Value) -> bool {
    response
        .get("status")
        .and_then(Value::as_str)
        .is_some_and(|s| s.eq_ignore_ascii_case("failed"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::ScriptedAssetApi;
    use crate::notify::RecordingNotifier;
    use std::time::Duration;

    struct Harness {
        api: Arc<ScriptedAssetApi>,
        recorder: Arc<RecordingNotifier>,
        submitter: AssetSubmitter,
    }

    fn harness(max_retries: u32, max_polls: u32, chained: ChainedActionConfig) -> Harness {
        let api = Arc::new(ScriptedAssetApi::new());
        let recorder = RecordingNotifier::arc();
        let notifications = Arc::new(Notifications::without_persistence(recorder.clone()));
        let retry = RetryConfig {
            retry_delay: Duration::from_millis(5000),
            max_retries,
            poll_interval: Duration::from_millis(3000),
            max_polls,
        };
        let submitter = AssetSubmitter::new(api.clone(), notifications, retry, chained);
        Harness {
            api,
            recorder,
            submitter,
        }
    }

    fn publishing(allow: &[&str]) -> ChainedActionConfig {
        ChainedActionConfig {
            enabled: true,
            url_template: Some("https://publish.test/assets/{assetId}/publish".to_string()),
            allow_list: allow.iter().map(|s| AssetId::from(*s)).collect(),
        }
    }

    fn payload() -> JobPayload {
        JobPayload::new("chair.rbxm", vec![0u8; 10])
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_failures_until_success() {
        let h = harness(3, 5, ChainedActionConfig::default());
        h.api
            .push_submission(Err(TransportError::status(503)))
            .push_submission(Err(TransportError::Network("reset".into())))
            .push_submission(Ok(json!({ "assetId": 42 })));

        let mut attempts = 0;
        let outcome = h.submitter.submit(JobId::new(1), &mut attempts, &payload(), |_| {}).await.unwrap();

        assert_eq!(attempts, 3);
        assert_eq!(outcome.external_id, Some(AssetId::from("42")));
        assert_eq!(outcome.operation_id, None);
        assert_eq!(h.api.calls().submissions, vec![10, 10, 10]);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_after_max_retries() {
        let h = harness(3, 5, ChainedActionConfig::default());
        for _ in 0..3 {
            h.api.push_submission(Err(TransportError::Status {
                status: 400,
                body: Some(json!({ "message": "invalid asset" })),
            }));
        }

        let mut attempts = 0;
        let err = h.submitter.submit(JobId::new(1), &mut attempts, &payload(), |_| {}).await.unwrap_err();

        assert_eq!(attempts, 3);
        assert!(matches!(err, SubmissionError::Exhausted { attempts: 3, .. }));
        assert_eq!(err.detail(), Some(json!({ "message": "invalid asset" })));
        assert_eq!(h.api.calls().submissions.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn polls_until_asset_is_ready() {
        let h = harness(3, 10, ChainedActionConfig::default());
        h.api.push_submission(Ok(json!({ "operationId": "op-1" })));
        h.api
            .push_operation(Ok(json!({ "done": false })))
            .push_operation(Err(TransportError::status(502)))
            .push_operation(Ok(json!({ "done": true, "response": { "assetId": "77" } })));

        let mut attempts = 0;
        let outcome = h.submitter.submit(JobId::new(4), &mut attempts, &payload(), |_| {}).await.unwrap();

        assert_eq!(attempts, 1);
        assert_eq!(outcome.operation_id.as_deref(), Some("op-1"));
        assert_eq!(outcome.external_id, Some(AssetId::from("77")));
        assert_eq!(h.api.calls().polls.len(), 3);
        // Failed polls are not reported; successful ones are, without dedup.
        assert_eq!(h.recorder.count("operation_update"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn operation_failure_stops_polling() {
        let h = harness(3, 40, ChainedActionConfig::default());
        h.api.push_submission(Ok(json!({ "operationId": "op-1" })));
        h.api
            .push_operation(Ok(json!({ "done": false })))
            .push_operation(Ok(json!({ "done": false })))
            .push_operation(Ok(json!({ "status": "failed" })));

        let mut attempts = 0;
        let err = h.submitter.submit(JobId::new(2), &mut attempts, &payload(), |_| {}).await.unwrap_err();

        assert!(matches!(err, SubmissionError::OperationFailed { ref operation_id, .. } if operation_id == "op-1"));
        assert!(err.to_string().contains("reported failed"));
        assert_eq!(h.api.calls().polls.len(), 3);
        // Not resubmitted.
        assert_eq!(attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn poll_budget_exhaustion_times_out() {
        let h = harness(3, 4, ChainedActionConfig::default());
        h.api.push_submission(Ok(json!({ "operation_id": "op-9" })));

        let mut attempts = 0;
        let err = h.submitter.submit(JobId::new(3), &mut attempts, &payload(), |_| {}).await.unwrap_err();

        assert_eq!(
            err,
            SubmissionError::OperationTimedOut {
                operation_id: "op-9".to_string(),
                polls: 4
            }
        );
        assert_eq!(h.api.calls().polls.len(), 4);
        assert_eq!(attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn chained_action_runs_for_allowed_asset() {
        let h = harness(3, 5, publishing(&["42"]));
        h.api.push_submission(Ok(json!({ "operationId": "op-1" })));
        h.api.push_operation(Ok(json!({ "assetId": 42 })));
        h.api.push_publish(Ok(json!({ "price": 25 })));

        let mut attempts = 0;
        let outcome = h.submitter.submit(JobId::new(1), &mut attempts, &payload(), |_| {}).await.unwrap();

        assert_eq!(h.api.calls().publishes, vec!["https://publish.test/assets/42/publish".to_string()]);
        match outcome.chained_action {
            Some(ChainedActionOutcome::Completed { response, .. }) => assert_eq!(response["price"], 25),
            other => panic!("expected completed chained action, got {other:?}"),
        }
        assert_eq!(h.recorder.count("publish_started"), 1);
        assert_eq!(h.recorder.count("publish_succeeded"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn chained_action_skipped_outside_allow_list() {
        let h = harness(3, 5, publishing(&["99"]));
        h.api.push_submission(Ok(json!({ "operationId": "op-1" })));
        h.api.push_operation(Ok(json!({ "assetId": 42 })));

        let mut attempts = 0;
        let outcome = h.submitter.submit(JobId::new(1), &mut attempts, &payload(), |_| {}).await.unwrap();

        assert!(h.api.calls().publishes.is_empty());
        assert!(matches!(
            outcome.chained_action,
            Some(ChainedActionOutcome::Skipped { ref reason, .. }) if reason == "not_in_allowlist"
        ));
        assert_eq!(h.recorder.count("publish_skipped_not_allowed"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn chained_action_failure_is_not_fatal() {
        let h = harness(3, 5, publishing(&[]));
        h.api.push_submission(Ok(json!({ "operationId": "op-1" })));
        h.api.push_operation(Ok(json!({ "assetId": "a b" })));
        h.api.push_publish(Err(TransportError::status(403)));

        let mut attempts = 0;
        let outcome = h.submitter.submit(JobId::new(1), &mut attempts, &payload(), |_| {}).await.unwrap();

        assert_eq!(outcome.external_id, Some(AssetId::from("a b")));
        assert_eq!(outcome.publish_error.as_deref(), Some("HTTP 403"));
        assert_eq!(h.api.calls().publishes, vec!["https://publish.test/assets/a%20b/publish".to_string()]);
        assert_eq!(h.recorder.count("publish_failed"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_chained_action_makes_no_call() {
        let mut chained = publishing(&[]);
        chained.enabled = false;
        let h = harness(3, 5, chained);
        h.api.push_submission(Ok(json!({ "operationId": "op-1" })));
        h.api.push_operation(Ok(json!({ "assetId": 1 })));

        let mut attempts = 0;
        let outcome = h.submitter.submit(JobId::new(1), &mut attempts, &payload(), |_| {}).await.unwrap();

        assert!(outcome.chained_action.is_none());
        assert!(h.api.calls().publishes.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn synchronous_asset_id_skips_chained_action() {
        let h = harness(3, 5, publishing(&[]));
        h.api.push_submission(Ok(json!({ "assetId": 42 })));

        let mut attempts = 0;
        let outcome = h.submitter.submit(JobId::new(1), &mut attempts, &payload(), |_| {}).await.unwrap();

        assert_eq!(outcome.external_id, Some(AssetId::from("42")));
        assert!(outcome.chained_action.is_none());
        assert!(outcome.publish_error.is_none());
        assert!(h.api.calls().publishes.is_empty());
        assert_eq!(h.recorder.count("publish_started"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn attempt_callback_sees_each_attempt() {
        let h = harness(3, 5, ChainedActionConfig::default());
        h.api
            .push_submission(Err(TransportError::status(503)))
            .push_submission(Ok(json!({ "assetId": 7 })));

        let mut seen = Vec::new();
        let mut attempts = 0;
        h.submitter
            .submit(JobId::new(1), &mut attempts, &payload(), |n| seen.push(n))
            .await
            .unwrap();

        assert_eq!(seen, vec![1, 2]);
    }

    #[test]
    fn reads_operation_and_asset_ids() {
        assert_eq!(operation_id(&json!({"operationId": "x"})).as_deref(), Some("x"));
        assert_eq!(operation_id(&json!({"operation_id": "y"})).as_deref(), Some("y"));
        assert_eq!(operation_id(&json!({"assetId": 1})), None);
        assert_eq!(asset_id(&json!({"asset_id": 5})), Some(AssetId::from("5")));
        assert_eq!(asset_id(&json!({"status": "pending"})), None);
        assert!(reports_failure(&json!({"status": "FAILED"})));
        assert!(!reports_failure(&json!({"status": "running"})));
    }
}
