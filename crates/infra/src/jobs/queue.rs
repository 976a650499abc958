//! The job queue and its single worker.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::json;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use assetbridge_core::JobId;

use super::audit::AuditLog;
use super::store::{JobStore, JobStoreError};
use super::summary::OutcomeSummary;
use super::types::{JobMetadata, JobPayload, JobRecord, JobStats, JobStatus, JobSummary};
use crate::external::{AssetSubmitter, SubmissionError};
use crate::notify::{DedupScope, NotificationEvent, Notifications};

const UNEXECUTABLE_REASON: &str = "payload lost on restart; resubmit to run again";

/// Queue operation error.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("failed to persist queue: {0}")]
    Persist(#[from] JobStoreError),
    #[error("job {0} not found")]
    NotFound(JobId),
    #[error("job {id} is {status} and cannot be resubmitted")]
    NotResubmittable { id: JobId, status: JobStatus },
}

struct QueueState {
    /// Ordered by id.
    records: Vec<JobRecord>,
    /// Live payloads of records that have not started yet.
    payloads: HashMap<JobId, JobPayload>,
    next_id: JobId,
}

impl QueueState {
    fn find_mut(&mut self, id: JobId) -> Option<&mut JobRecord> {
        self.records.iter_mut().find(|r| r.id == id)
    }
}

struct Inner {
    state: Mutex<QueueState>,
    store: Arc<dyn JobStore>,
    submitter: AssetSubmitter,
    notifications: Arc<Notifications>,
    audit: AuditLog,
    wake: Notify,
    processing: AtomicBool,
    stopping: AtomicBool,
}

/// Durable FIFO queue processed by at most one worker at a time.
///
/// Records are persisted through the [`JobStore`] after every change;
/// payloads live only in memory.
#[derive(Clone)]
pub struct JobQueue {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue")
            .field("stats", &self.stats())
            .field("processing", &self.is_processing())
            .finish()
    }
}

enum Claim {
    Ready(JobRecord, JobPayload),
    Orphaned(JobId),
}

/// Releases the processing flag, even if the worker panics.
struct ProcessingGuard<'a>(&'a AtomicBool);

impl Drop for ProcessingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl JobQueue {
    /// Load persisted records and prepare the queue.
    ///
    /// Records left `queued` or `processing` by a previous process have no
    /// payload any more; they are marked `unexecutable` and persisted.
    pub fn recover(
        store: Arc<dyn JobStore>,
        submitter: AssetSubmitter,
        notifications: Arc<Notifications>,
        audit: AuditLog,
    ) -> Self {
        let mut records = store.load();
        records.sort_by_key(|r| r.id);

        let mut stale = 0usize;
        for record in records.iter_mut().filter(|r| !r.status.is_terminal()) {
            if record.mark_unexecutable(UNEXECUTABLE_REASON).is_ok() {
                stale += 1;
            }
        }
        if stale > 0 {
            warn!(count = stale, "recovered jobs without payload marked unexecutable");
            if let Err(e) = store.save(&records) {
                error!(error = %e, "failed to persist recovered queue");
            }
        }

        let next_id = records
            .iter()
            .map(|r| r.id)
            .max()
            .map(|id| id.next())
            .unwrap_or(JobId::FIRST);
        info!(jobs = records.len(), next_id = %next_id, "job queue ready");

        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(QueueState {
                    records,
                    payloads: HashMap::new(),
                    next_id,
                }),
                store,
                submitter,
                notifications,
                audit,
                wake: Notify::new(),
                processing: AtomicBool::new(false),
                stopping: AtomicBool::new(false),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        // Every mutation leaves the state consistent before any call that
        // could panic, so a poisoned lock is still usable.
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn persist(&self, state: &QueueState) {
        if let Err(e) = self.inner.store.save(&state.records) {
            error!(error = %e, "failed to persist queue");
        }
    }

    /// Append a new job and wake the worker.
    ///
    /// On a persistence failure the record is withdrawn; its id is not reused.
    pub fn enqueue(&self, payload: JobPayload, metadata: JobMetadata) -> Result<JobId, QueueError> {
        let id = {
            let mut state = self.state();
            let id = state.next_id;
            state.next_id = id.next();
            state.records.push(JobRecord::new(id, metadata));

            if let Err(e) = self.inner.store.save(&state.records) {
                state.records.pop();
                warn!(job_id = %id, error = %e, "enqueue rejected: queue not persisted");
                return Err(e.into());
            }
            state.payloads.insert(id, payload);
            id
        };

        info!(job_id = %id, "job enqueued");
        self.inner.wake.notify_one();
        Ok(id)
    }

    /// Redacted view of every job, in insertion order.
    pub fn list(&self) -> Vec<JobSummary> {
        self.state().records.iter().map(JobRecord::summary).collect()
    }

    pub fn get(&self, id: JobId) -> Option<JobRecord> {
        self.state().records.iter().find(|r| r.id == id).cloned()
    }

    pub fn stats(&self) -> JobStats {
        JobStats::from_records(self.state().records.iter())
    }

    pub fn is_processing(&self) -> bool {
        self.inner.processing.load(Ordering::SeqCst)
    }

    /// Enqueue a fresh payload for a job that can no longer run on its own.
    pub fn resubmit(&self, id: JobId, payload: JobPayload) -> Result<JobId, QueueError> {
        let metadata = {
            let state = self.state();
            let record = state
                .records
                .iter()
                .find(|r| r.id == id)
                .ok_or(QueueError::NotFound(id))?;
            if !matches!(record.status, JobStatus::Unexecutable | JobStatus::Failed) {
                return Err(QueueError::NotResubmittable {
                    id,
                    status: record.status,
                });
            }
            record.metadata.clone()
        };

        let new_id = self.enqueue(payload, metadata)?;
        info!(job_id = %new_id, resubmitted_from = %id, "job resubmitted");
        Ok(new_id)
    }

    /// Process queued jobs until none remain. Returns the number processed.
    ///
    /// If another drain is already running this returns 0 immediately.
    pub async fn run_until_idle(&self) -> usize {
        if self
            .inner
            .processing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("worker already processing; drain request ignored");
            return 0;
        }
        let _guard = ProcessingGuard(&self.inner.processing);

        let mut processed = 0;
        while !self.inner.stopping.load(Ordering::SeqCst) {
            match self.claim_next() {
                Some(Claim::Ready(record, payload)) => {
                    self.process(record, payload).await;
                    processed += 1;
                }
                Some(Claim::Orphaned(id)) => {
                    warn!(job_id = %id, "queued job has no payload; marked unexecutable");
                }
                None => break,
            }
        }
        processed
    }

    fn claim_next(&self) -> Option<Claim> {
        let mut state = self.state();
        let id = state
            .records
            .iter()
            .find(|r| r.status == JobStatus::Queued)
            .map(|r| r.id)?;
        let payload = state.payloads.remove(&id);

        let record = state.find_mut(id)?;
        let claim = match payload {
            Some(payload) => {
                record.mark_processing().ok()?;
                Claim::Ready(record.clone(), payload)
            }
            None => {
                record.mark_unexecutable(UNEXECUTABLE_REASON).ok()?;
                Claim::Orphaned(id)
            }
        };
        self.persist(&state);
        Some(claim)
    }

    async fn process(&self, record: JobRecord, payload: JobPayload) {
        let id = record.id;
        info!(job_id = %id, name = %record.metadata.name, "processing job");

        let mut attempts = record.attempts;
        let result = self
            .inner
            .submitter
            .submit(id, &mut attempts, &payload, |n| self.record_attempt(id, n))
            .await;
        drop(payload);

        let finished = {
            let mut state = self.state();
            let Some(current) = state.find_mut(id) else {
                error!(job_id = %id, "processed job vanished from the queue");
                return;
            };
            current.attempts = attempts;
            let transition = match &result {
                Ok(outcome) => current.mark_done(outcome.clone()),
                Err(e) => current.mark_failed(e.to_string(), e.detail()),
            };
            if let Err(e) = transition {
                error!(job_id = %id, error = %e, "job outcome not recorded");
            }
            let finished = current.clone();
            self.persist(&state);
            finished
        };

        match result {
            Ok(_) => self.report_success(&finished).await,
            Err(e) => self.report_failure(&finished, &e).await,
        }
    }

    /// Publish the attempt count of a running job.
    fn record_attempt(&self, id: JobId, attempts: u32) {
        let mut state = self.state();
        match state.find_mut(id) {
            Some(record) => record.attempts = attempts,
            None => return,
        }
        self.persist(&state);
    }

    async fn report_success(&self, record: &JobRecord) {
        info!(
            job_id = %record.id,
            asset_id = ?record.external_id,
            attempts = record.attempts,
            "job succeeded"
        );
        let notifications = &self.inner.notifications;
        let response = record.response.clone().unwrap_or_else(|| json!({}));
        self.inner.audit.record_success(record.id, &response);

        let scope = DedupScope::job(record.id);
        notifications
            .emit_once(
                NotificationEvent::new("job_succeeded")
                    .field("jobId", record.id)
                    .field("metadata", &record.metadata)
                    .field("response", &response),
                scope.clone(),
            )
            .await;
        notifications
            .emit_file_once(
                NotificationEvent::new("job_succeeded_file")
                    .field("jobId", record.id)
                    .field("response", &response),
                record.metadata.filepath.as_deref(),
                scope.clone().with_asset(record.external_id.clone()),
            )
            .await;
        notifications
            .emit_once(
                NotificationEvent::new("asset_summary").field("summary", OutcomeSummary::from_record(record)),
                scope,
            )
            .await;
    }

    async fn report_failure(&self, record: &JobRecord, err: &SubmissionError) {
        warn!(job_id = %record.id, attempts = record.attempts, error = %err, "job failed permanently");
        let notifications = &self.inner.notifications;
        let body = err.detail().unwrap_or_else(|| json!({ "message": err.to_string() }));
        self.inner.audit.record_error(record.id, &body);

        let scope = DedupScope::job(record.id);
        notifications
            .emit_once(
                NotificationEvent::new("asset_summary").field("summary", OutcomeSummary::from_record(record)),
                scope.clone(),
            )
            .await;
        notifications
            .emit_once(
                NotificationEvent::new("job_failed")
                    .field("jobId", record.id)
                    .field("metadata", &record.metadata)
                    .field("error", &record.error)
                    .field("errorDetail", &record.error_detail),
                scope.clone(),
            )
            .await;
        notifications
            .emit_file_once(
                NotificationEvent::new("job_failed_file")
                    .field("jobId", record.id)
                    .field("error", &record.error),
                record.metadata.filepath.as_deref(),
                scope,
            )
            .await;
    }

    /// Start the background worker.
    ///
    /// The worker drains the queue whenever a job is enqueued and stops
    /// between jobs once [`WorkerHandle::shutdown`] is called.
    pub fn spawn(&self) -> WorkerHandle {
        let queue = self.clone();
        let join = tokio::spawn(async move {
            info!("job worker started");
            loop {
                queue.run_until_idle().await;
                if queue.inner.stopping.load(Ordering::SeqCst) {
                    break;
                }
                queue.inner.wake.notified().await;
            }
            info!("job worker stopped");
        });
        WorkerHandle {
            queue: self.clone(),
            join: Some(join),
        }
    }
}

/// Handle to the running worker.
#[derive(Debug)]
pub struct WorkerHandle {
    queue: JobQueue,
    join: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Stop after the current job (if any) and wait for the worker to exit.
    pub async fn shutdown(mut self) {
        self.queue.inner.stopping.store(true, Ordering::SeqCst);
        self.queue.inner.wake.notify_one();
        if let Some(join) = self.join.take() {
            if let Err(e) = join.await {
                error!(error = %e, "job worker terminated abnormally");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ChainedActionConfig, RetryConfig};
    use crate::external::{ScriptedAssetApi, TransportError};
    use crate::jobs::store::InMemoryJobStore;
    use crate::notify::RecordingNotifier;
    use assetbridge_core::AssetId;
    use proptest::prelude::*;
    use std::time::Duration;

    struct Harness {
        api: Arc<ScriptedAssetApi>,
        recorder: Arc<RecordingNotifier>,
        store: Arc<InMemoryJobStore>,
        queue: JobQueue,
    }

    fn retry() -> RetryConfig {
        RetryConfig {
            retry_delay: Duration::from_millis(5000),
            max_retries: 3,
            poll_interval: Duration::from_millis(3000),
            max_polls: 40,
        }
    }

    fn queue_over(store: Arc<dyn JobStore>, api: Arc<ScriptedAssetApi>, chained: ChainedActionConfig) -> (JobQueue, Arc<RecordingNotifier>) {
        let recorder = RecordingNotifier::arc();
        let notifications = Arc::new(Notifications::without_persistence(recorder.clone()));
        let submitter = AssetSubmitter::new(api, notifications.clone(), retry(), chained);
        let queue = JobQueue::recover(store, submitter, notifications, AuditLog::disabled());
        (queue, recorder)
    }

    fn harness_with(store: Arc<InMemoryJobStore>, chained: ChainedActionConfig) -> Harness {
        let api = Arc::new(ScriptedAssetApi::new());
        let (queue, recorder) = queue_over(store.clone(), api.clone(), chained);
        Harness {
            api,
            recorder,
            store,
            queue,
        }
    }

    fn harness() -> Harness {
        harness_with(InMemoryJobStore::arc(), ChainedActionConfig::default())
    }

    fn payload() -> JobPayload {
        JobPayload::new("chair.rbxm", vec![7u8; 10])
    }

    /// Store that fails every save after being armed.
    #[derive(Default)]
    struct FlakyStore {
        inner: InMemoryJobStore,
        failing: AtomicBool,
    }

    impl JobStore for FlakyStore {
        fn load(&self) -> Vec<JobRecord> {
            self.inner.load()
        }

        fn save(&self, records: &[JobRecord]) -> Result<(), JobStoreError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(JobStoreError::Io {
                    path: "queue.json".into(),
                    source: std::io::Error::other("disk full"),
                });
            }
            self.inner.save(records)
        }
    }

    /// Store that checks the single-flight rule on every save.
    #[derive(Default)]
    struct SingleFlightStore {
        inner: InMemoryJobStore,
    }

    impl JobStore for SingleFlightStore {
        fn load(&self) -> Vec<JobRecord> {
            self.inner.load()
        }

        fn save(&self, records: &[JobRecord]) -> Result<(), JobStoreError> {
            let processing = records.iter().filter(|r| r.status == JobStatus::Processing).count();
            assert!(processing <= 1, "{processing} jobs processing at once");
            self.inner.save(records)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retried_submission_completes() {
        let h = harness();
        h.api
            .push_submission(Err(TransportError::status(500)))
            .push_submission(Err(TransportError::status(500)))
            .push_submission(Ok(json!({ "assetId": 42 })));

        let id = h.queue.enqueue(payload(), JobMetadata::new("Chair")).unwrap();
        assert_eq!(id, JobId::FIRST);
        assert_eq!(h.queue.run_until_idle().await, 1);

        let job = h.queue.get(id).unwrap();
        assert_eq!(job.status, JobStatus::Done);
        assert_eq!(job.attempts, 3);
        assert_eq!(job.external_id, Some(AssetId::from("42")));
        assert_eq!(h.store.snapshot()[0].status, JobStatus::Done);
        assert_eq!(h.recorder.count("job_succeeded"), 1);
        assert_eq!(h.recorder.count("asset_summary"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_submission_fails_with_ceiling_attempts() {
        let h = harness();
        let id = h.queue.enqueue(payload(), JobMetadata::new("Chair")).unwrap();
        h.queue.run_until_idle().await;

        let job = h.queue.get(id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 3);
        assert!(job.error.is_some());
        assert_eq!(h.recorder.count("job_failed"), 1);
        let summary = h.recorder.find("asset_summary").unwrap();
        assert_eq!(summary.event.get("summary").unwrap()["status"], "creation_failed");
    }

    #[tokio::test(start_paused = true)]
    async fn failed_operation_fails_job_after_three_polls() {
        let h = harness();
        h.api.push_submission(Ok(json!({ "operationId": "op-1" })));
        h.api
            .push_operation(Ok(json!({ "done": false })))
            .push_operation(Ok(json!({ "done": false })))
            .push_operation(Ok(json!({ "status": "failed", "reason": "moderated" })));

        let id = h.queue.enqueue(payload(), JobMetadata::new("Chair")).unwrap();
        h.queue.run_until_idle().await;

        let job = h.queue.get(id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error.as_deref().unwrap().contains("op-1 reported failed"));
        assert_eq!(job.error_detail.as_ref().unwrap()["reason"], "moderated");
        assert_eq!(h.api.calls().polls.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn polled_asset_id_completes_job_and_publishes() {
        let chained = ChainedActionConfig {
            enabled: true,
            url_template: Some("https://publish.test/{assetId}".to_string()),
            allow_list: vec![AssetId::from("42")],
        };
        let h = harness_with(InMemoryJobStore::arc(), chained);
        h.api.push_submission(Ok(json!({ "operationId": "op-2" })));
        h.api.push_operation(Ok(json!({ "response": { "assetId": 42 } })));
        h.api.push_publish(Ok(json!({ "price": 10 })));

        let id = h.queue.enqueue(payload(), JobMetadata::new("Chair")).unwrap();
        h.queue.run_until_idle().await;

        let job = h.queue.get(id).unwrap();
        assert_eq!(job.status, JobStatus::Done);
        assert_eq!(job.operation_id.as_deref(), Some("op-2"));
        assert!(job.chained_action.as_ref().unwrap().is_completed());
        assert_eq!(h.api.calls().publishes, vec!["https://publish.test/42".to_string()]);
        let summary = h.recorder.find("asset_summary").unwrap();
        assert_eq!(summary.event.get("summary").unwrap()["status"], "published");
    }

    #[tokio::test(start_paused = true)]
    async fn skipped_chained_action_still_completes() {
        let chained = ChainedActionConfig {
            enabled: true,
            url_template: Some("https://publish.test/{assetId}".to_string()),
            allow_list: vec![AssetId::from("99")],
        };
        let h = harness_with(InMemoryJobStore::arc(), chained);
        h.api.push_submission(Ok(json!({ "operationId": "op-3" })));
        h.api.push_operation(Ok(json!({ "assetId": 42 })));

        let id = h.queue.enqueue(payload(), JobMetadata::new("Chair")).unwrap();
        h.queue.run_until_idle().await;

        let job = h.queue.get(id).unwrap();
        assert_eq!(job.status, JobStatus::Done);
        assert!(h.api.calls().publishes.is_empty());
        assert!(!job.chained_action.unwrap().is_completed());
    }

    #[tokio::test(start_paused = true)]
    async fn synchronous_completion_never_publishes() {
        let chained = ChainedActionConfig {
            enabled: true,
            url_template: Some("https://publish.test/{assetId}".to_string()),
            allow_list: Vec::new(),
        };
        let h = harness_with(InMemoryJobStore::arc(), chained);
        h.api.push_submission(Ok(json!({ "assetId": 42 })));

        let id = h.queue.enqueue(payload(), JobMetadata::new("Chair")).unwrap();
        h.queue.run_until_idle().await;

        let job = h.queue.get(id).unwrap();
        assert_eq!(job.status, JobStatus::Done);
        assert!(job.chained_action.is_none());
        assert!(h.api.calls().publishes.is_empty());
        let summary = h.recorder.find("asset_summary").unwrap();
        assert_eq!(summary.event.get("summary").unwrap()["status"], "created_unpublished");
    }

    #[tokio::test(start_paused = true)]
    async fn attempts_are_visible_while_retrying() {
        let h = harness();
        h.api
            .push_submission(Err(TransportError::status(500)))
            .push_submission(Err(TransportError::status(500)))
            .push_submission(Ok(json!({ "assetId": 42 })));
        let id = h.queue.enqueue(payload(), JobMetadata::new("Chair")).unwrap();

        let queue = h.queue.clone();
        let drain = tokio::spawn(async move { queue.run_until_idle().await });
        // Second attempt fails at 5s; the third is not sent before 10s.
        tokio::time::sleep(Duration::from_millis(7000)).await;

        let job = h.queue.get(id).unwrap();
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.attempts, 2);
        assert_eq!(h.store.snapshot()[0].attempts, 2);

        assert_eq!(drain.await.unwrap(), 1);
        let job = h.queue.get(id).unwrap();
        assert_eq!(job.status, JobStatus::Done);
        assert_eq!(job.attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn jobs_run_in_fifo_order() {
        let h = harness();
        for asset in [1, 2, 3] {
            h.api.push_submission(Ok(json!({ "assetId": asset })));
        }
        let ids: Vec<JobId> = (0..3)
            .map(|i| h.queue.enqueue(payload(), JobMetadata::new(format!("job-{i}"))).unwrap())
            .collect();

        assert_eq!(h.queue.run_until_idle().await, 3);
        let assets: Vec<Option<AssetId>> = ids.iter().map(|id| h.queue.get(*id).unwrap().external_id).collect();
        assert_eq!(assets, vec![Some(AssetId::from("1")), Some(AssetId::from("2")), Some(AssetId::from("3"))]);
        assert_eq!(h.queue.stats().done, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_drains_are_single_flight() {
        let api = Arc::new(ScriptedAssetApi::new());
        let store: Arc<dyn JobStore> = Arc::new(SingleFlightStore::default());
        let (queue, _recorder) = queue_over(store, api.clone(), ChainedActionConfig::default());
        api.push_submission(Ok(json!({ "operationId": "op-1" })));
        api.push_operation(Ok(json!({ "done": false })))
            .push_operation(Ok(json!({ "assetId": 1 })));
        api.push_submission(Ok(json!({ "assetId": 2 })));

        queue.enqueue(payload(), JobMetadata::new("a")).unwrap();
        queue.enqueue(payload(), JobMetadata::new("b")).unwrap();

        let (first, second) = tokio::join!(queue.run_until_idle(), queue.run_until_idle());
        assert_eq!(first + second, 2);
        assert!(first == 0 || second == 0);
        assert!(!queue.is_processing());
        assert_eq!(queue.stats().done, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn spawned_worker_drains_and_shuts_down() {
        let h = harness();
        h.api.push_submission(Ok(json!({ "assetId": 5 })));
        let worker = h.queue.spawn();

        let id = h.queue.enqueue(payload(), JobMetadata::new("Chair")).unwrap();
        for _ in 0..50 {
            if h.queue.get(id).unwrap().status == JobStatus::Done {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(h.queue.get(id).unwrap().status, JobStatus::Done);
        worker.shutdown().await;
    }

    #[test]
    fn enqueue_persists_before_returning() {
        let h = harness();
        let id = h.queue.enqueue(payload(), JobMetadata::new("Chair")).unwrap();

        let persisted = h.store.snapshot();
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0].id, id);
        assert_eq!(persisted[0].status, JobStatus::Queued);
        assert_eq!(h.queue.list()[0].attempts, 0);
    }

    #[test]
    fn failed_persist_withdraws_record_but_consumes_id() {
        let store = Arc::new(FlakyStore::default());
        let api = Arc::new(ScriptedAssetApi::new());
        let (queue, _) = queue_over(store.clone(), api, ChainedActionConfig::default());

        store.failing.store(true, Ordering::SeqCst);
        let err = queue.enqueue(payload(), JobMetadata::new("a")).unwrap_err();
        assert!(matches!(err, QueueError::Persist(_)));
        assert!(queue.list().is_empty());

        store.failing.store(false, Ordering::SeqCst);
        assert_eq!(queue.enqueue(payload(), JobMetadata::new("b")).unwrap(), JobId::new(2));
    }

    #[tokio::test(start_paused = true)]
    async fn restart_marks_pending_jobs_unexecutable() {
        let store = InMemoryJobStore::arc();
        {
            let h = harness_with(store.clone(), ChainedActionConfig::default());
            h.api.push_submission(Ok(json!({ "assetId": 1 })));
            h.queue.enqueue(payload(), JobMetadata::new("done")).unwrap();
            h.queue.run_until_idle().await;
            h.queue.enqueue(payload(), JobMetadata::new("pending")).unwrap();
        }

        let h = harness_with(store.clone(), ChainedActionConfig::default());
        let pending = h.queue.get(JobId::new(2)).unwrap();
        assert_eq!(pending.status, JobStatus::Unexecutable);
        assert_eq!(h.queue.get(JobId::new(1)).unwrap().status, JobStatus::Done);
        assert_eq!(store.snapshot()[1].status, JobStatus::Unexecutable);
        assert_eq!(h.queue.run_until_idle().await, 0);

        h.api.push_submission(Ok(json!({ "assetId": 2 })));
        let new_id = h.queue.resubmit(JobId::new(2), payload()).unwrap();
        assert_eq!(new_id, JobId::new(3));
        assert_eq!(h.queue.get(new_id).unwrap().metadata.name, "pending");
        h.queue.run_until_idle().await;
        assert_eq!(h.queue.get(new_id).unwrap().status, JobStatus::Done);

        assert!(matches!(
            h.queue.resubmit(JobId::new(1), payload()),
            Err(QueueError::NotResubmittable { .. })
        ));
        assert!(matches!(
            h.queue.resubmit(JobId::new(40), payload()),
            Err(QueueError::NotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn notification_failures_do_not_change_outcome() {
        let h = harness();
        h.recorder.set_unreachable(true);
        h.api.push_submission(Ok(json!({ "assetId": 3 })));

        let id = h.queue.enqueue(payload(), JobMetadata::new("Chair")).unwrap();
        h.queue.run_until_idle().await;

        assert_eq!(h.queue.get(id).unwrap().status, JobStatus::Done);
    }

    proptest! {
        #[test]
        fn ids_increase_across_reloads(batches in proptest::collection::vec(0usize..5, 1..6)) {
            let store = InMemoryJobStore::arc();
            let mut seen: Vec<JobId> = Vec::new();

            for batch in batches {
                let h = harness_with(store.clone(), ChainedActionConfig::default());
                let expected_next = seen.last().map(|id| id.next()).unwrap_or(JobId::FIRST);
                for i in 0..batch {
                    let id = h.queue.enqueue(payload(), JobMetadata::new(format!("j{i}"))).unwrap();
                    if i == 0 {
                        prop_assert_eq!(id, expected_next);
                    }
                    if let Some(last) = seen.last() {
                        prop_assert!(id > *last);
                    }
                    seen.push(id);
                }
            }

            let reloaded = harness_with(store, ChainedActionConfig::default());
            prop_assert_eq!(reloaded.queue.list().len(), seen.len());
        }
    }
}
