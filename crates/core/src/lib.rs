//! `assetbridge-core`: identifiers and error types shared by every layer.
//!
//! This crate is **pure** (no I/O, no async runtime).

pub mod error;
pub mod id;

pub use error::{DomainError, DomainResult};
pub use id::{AssetId, JobId};
