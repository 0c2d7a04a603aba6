//! Executor error types

use policy_sync_compiler::ValidationErrors;
use policy_sync_core::{ApplyTotals, ManifestError, PolicyKind};
use policy_sync_remote::RemoteError;
use std::fmt;
use thiserror::Error;

/// Failure of a single apply unit
#[derive(Error, Debug, Clone)]
pub enum ApplyError {
    #[error("create {kind} '{name}': {source}")]
    Create {
        kind: PolicyKind,
        name: String,
        source: RemoteError,
    },

    #[error("update {kind} '{name}' ({id}): {source}")]
    Update {
        kind: PolicyKind,
        name: String,
        id: String,
        source: RemoteError,
    },

    #[error("assign owners of {kind} '{name}' ({id}): {source}")]
    AssignOwners {
        kind: PolicyKind,
        name: String,
        id: String,
        source: RemoteError,
    },

    #[error("delete policy {id}: {source}")]
    Delete { id: String, source: RemoteError },

    #[error("apply unit panicked: {0}")]
    Panicked(String),
}

/// Every unit failure of one apply run
#[derive(Error, Debug, Clone)]
pub struct ApplyErrors(pub Vec<ApplyError>);

impl fmt::Display for ApplyErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} unit(s) failed: ", self.0.len())?;
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}", err)?;
        }
        Ok(())
    }
}

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("load manifest: {0}")]
    Manifest(#[from] ManifestError),

    #[error("build policy drafts: {0}")]
    Validation(#[from] ValidationErrors),

    #[error("list existing policies: {0}")]
    Listing(#[source] RemoteError),

    #[error("apply policies: {errors}")]
    Apply {
        totals: ApplyTotals,
        errors: ApplyErrors,
    },
}

impl SyncError {
    /// Counters reached before the error; zero for phases that abort before
    /// any remote mutation.
    pub fn totals(&self) -> ApplyTotals {
        match self {
            SyncError::Apply { totals, .. } => *totals,
            _ => ApplyTotals::default(),
        }
    }
}
