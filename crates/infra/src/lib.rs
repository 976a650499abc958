//! Infrastructure layer: configuration, persistence, external services,
//! notifications and the job queue.

pub mod config;
pub mod external;
pub mod jobs;
pub mod notify;
