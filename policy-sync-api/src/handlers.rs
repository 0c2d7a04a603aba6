//! API request handlers

use axum::{extract::State, response::IntoResponse, Json};
use chrono::{DateTime, Utc};
use policy_sync_core::SyncReport;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

use crate::{ApiError, AppState};

#[derive(Debug, Deserialize)]
pub struct SyncRequest {
    pub manifest_path: PathBuf,
    /// Falls back to the configured prefix
    #[serde(default)]
    pub fullname_prefix: Option<String>,
}

/// Result object reported to the host
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncResponse {
    pub added_objects: u32,
    pub updated_objects: u32,
    pub deleted_objects: u32,
    pub failures: u32,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl From<SyncReport> for SyncResponse {
    fn from(report: SyncReport) -> Self {
        Self {
            added_objects: report.totals.created,
            updated_objects: report.totals.updated,
            deleted_objects: report.totals.deleted,
            failures: report.totals.failed,
            started_at: report.started_at,
            completed_at: report.completed_at,
        }
    }
}

/// Reconcile the remote policies with a manifest on disk
pub async fn sync(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SyncRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.manifest_path.as_os_str().is_empty() {
        return Err(ApiError::BadRequest("manifest_path must not be empty".to_string()));
    }

    let prefix = req
        .fullname_prefix
        .as_deref()
        .unwrap_or(&state.config.fullname_prefix);

    tracing::info!("Sync requested for manifest {:?}", req.manifest_path);

    let report = state.engine.run_file(&req.manifest_path, prefix).await?;

    Ok(Json(SyncResponse::from(report)))
}

/// Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "policy-sync"
    }))
}
