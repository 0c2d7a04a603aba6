//! Core domain models for Policy Sync
//!
//! This crate contains the shared data structures used across
//! the reconciliation pipeline: the manifest schema, PolicyDraft,
//! RemoteRecord, ApplyOutcome and the reconciliation plan.

pub mod error;
pub mod manifest;
pub mod models;

pub use error::{CoreError, ManifestError};
pub use manifest::{
    CachedManifestSource, FileManifestSource, ManifestDocument, ManifestSource,
};
pub use models::*;
