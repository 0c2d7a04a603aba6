//! Compiler error types

use policy_sync_core::PolicyKind;
use policy_sync_remote::RemoteError;
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("filter {0} already exists")]
    DuplicateFilter(String),

    #[error("mask {0} already exists with different type")]
    MaskTypeConflict(String),

    #[error("mask {0} can not be applied on multiple tables")]
    CrossTableMask(String),
}

impl ValidationError {
    /// Kind of draft the conflict makes unusable
    pub fn kind(&self) -> PolicyKind {
        match self {
            ValidationError::DuplicateFilter(_) => PolicyKind::Filter,
            ValidationError::MaskTypeConflict(_) | ValidationError::CrossTableMask(_) => {
                PolicyKind::Mask
            }
        }
    }
}

/// Every conflict found while building drafts
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub struct ValidationErrors(pub Vec<ValidationError>);

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} validation error(s): ", self.0.len())?;
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}", err)?;
        }
        Ok(())
    }
}

#[derive(Error, Debug, Clone)]
#[error("user by email {email}: {source}")]
pub struct OwnerLookupFailure {
    pub email: String,
    pub source: RemoteError,
}

/// Every owner email that could not be resolved
#[derive(Error, Debug, Clone)]
pub struct OwnerResolutionError(pub Vec<OwnerLookupFailure>);

impl OwnerResolutionError {
    pub fn emails(&self) -> Vec<&str> {
        self.0.iter().map(|f| f.email.as_str()).collect()
    }
}

impl fmt::Display for OwnerResolutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let failures: Vec<String> = self.0.iter().map(ToString::to_string).collect();
        write!(f, "unresolved owners: {}", failures.join("; "))
    }
}
