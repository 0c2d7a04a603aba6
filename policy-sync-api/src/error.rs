//! API error types and error handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use policy_sync_core::ApplyTotals;
use policy_sync_executor::SyncError;
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Invalid manifest: {message}")]
    Validation {
        message: String,
        details: Vec<String>,
    },

    #[error("Remote service error: {0}")]
    Upstream(String),

    #[error("Sync incomplete: {message}")]
    PartialApply {
        message: String,
        totals: ApplyTotals,
        details: Vec<String>,
    },
}

impl From<SyncError> for ApiError {
    fn from(err: SyncError) -> Self {
        match err {
            SyncError::Manifest(e) => ApiError::BadRequest(e.to_string()),
            SyncError::Validation(errors) => ApiError::Validation {
                message: errors.to_string(),
                details: errors.0.iter().map(ToString::to_string).collect(),
            },
            SyncError::Listing(e) => ApiError::Upstream(e.to_string()),
            SyncError::Apply { totals, errors } => ApiError::PartialApply {
                message: errors.to_string(),
                details: errors.0.iter().map(ToString::to_string).collect(),
                totals,
            },
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    details: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    added_objects: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    updated_objects: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    deleted_objects: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    failures: Option<u32>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let message = self.to_string();
        let (status, error_type, details, totals) = match self {
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request", Vec::new(), None),
            ApiError::Validation { details, .. } => {
                (StatusCode::UNPROCESSABLE_ENTITY, "validation_error", details, None)
            }
            ApiError::Upstream(_) => (StatusCode::BAD_GATEWAY, "upstream_error", Vec::new(), None),
            ApiError::PartialApply { totals, details, .. } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "apply_error",
                details,
                Some(totals),
            ),
        };

        let body = Json(ErrorResponse {
            error: error_type.to_string(),
            message,
            details,
            added_objects: totals.map(|t| t.created),
            updated_objects: totals.map(|t| t.updated),
            deleted_objects: totals.map(|t| t.deleted),
            failures: totals.map(|t| t.failed),
        });

        (status, body).into_response()
    }
}
