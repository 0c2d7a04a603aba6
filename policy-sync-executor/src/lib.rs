//! Reconciliation and apply engine
//!
//! Classifies the remote policies against the desired drafts and applies
//! the resulting plan with bounded parallelism.

pub mod classifier;
pub mod error;
pub mod executor;
pub mod reconciler;

pub use classifier::RemoteStateClassifier;
pub use error::{ApplyError, ApplyErrors, SyncError};
pub use executor::{ApplyEngine, ApplyReport, ApplyUnit, DEFAULT_MAX_WORKERS};
pub use reconciler::{ReconcilerConfig, ReconciliationEngine};
