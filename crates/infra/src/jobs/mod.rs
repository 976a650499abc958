//! Durable job queue with a single-flight worker.
//!
//! ## Design
//!
//! - Jobs are processed one at a time, oldest first
//! - Records are persisted after every change; payloads never are
//! - Submission retries and operation polling live in the external client
//! - Outcomes go to audit files and deduplicated notifications
//!
//! ## Components
//!
//! - `JobRecord`: durable lifecycle state of one job
//! - `JobStore`: persistence for the job list (JSON file or in-memory)
//! - `JobQueue`: enqueue/query API and the worker loop
//! - `AuditLog`: per-job response and error files
//! - `OutcomeSummary`: before/after view reported when a job finishes

pub mod audit;
pub mod queue;
pub mod store;
pub mod summary;
pub mod types;

pub use audit::AuditLog;
pub use queue::{JobQueue, QueueError, WorkerHandle};
pub use store::{InMemoryJobStore, JobStore, JobStoreError, JsonFileJobStore};
pub use summary::{OutcomeStatus, OutcomeSummary};
pub use types::{
    ChainedActionOutcome, JobMetadata, JobPayload, JobRecord, JobStats, JobStatus, JobSummary,
    SubmissionOutcome,
};
