//! Remote service error types

use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum RemoteError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Locked: {0}")]
    Locked(String),

    #[error("Rejected: {0}")]
    Rejected(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Internal error: {0}")]
    Internal(String),
}
