//! Error types for the core crate

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("Invalid manifest path {path}: {source}")]
    InvalidPath {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Reading manifest {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Parsing manifest {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Unknown policy kind: {0}")]
    UnknownPolicyKind(String),
}
