//! Error types for the delete-expunge service

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid resource: {0}")]
    InvalidResource(String),

    #[error("Resource not found: {resource_type}/{id}")]
    ResourceNotFound { resource_type: String, id: String },

    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("Not implemented: {0}")]
    NotImplemented(String),

    /// A resource in the delete set is still referenced from outside of it.
    #[error("DELETE with _expunge=true failed. Unable to delete {target} because {referrer} refers to it via the path {path}")]
    ReferentialConflict {
        target: String,
        referrer: String,
        path: String,
    },

    #[error("{0}")]
    ConfigurationDisabled(String),

    #[error("Batch {batch} failed: {message}")]
    BatchExecution { batch: usize, message: String },

    #[error("Job {job_id} has not finished (status: {status})")]
    JobNotFinished { job_id: Uuid, status: String },

    #[error("Timed out after {waited_ms}ms waiting for job {job_id}")]
    Timeout { job_id: Uuid, waited_ms: u64 },

    #[error("Job queue error: {0}")]
    JobQueue(String),
}

impl Error {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::Validation(_) | Error::InvalidResource(_) => StatusCode::BAD_REQUEST,
            Error::ResourceNotFound { .. } | Error::JobNotFound(_) => StatusCode::NOT_FOUND,
            Error::PreconditionFailed(_) => StatusCode::PRECONDITION_FAILED,
            Error::NotImplemented(_) => StatusCode::NOT_IMPLEMENTED,
            Error::ReferentialConflict { .. } | Error::JobNotFinished { .. } => {
                StatusCode::CONFLICT
            }
            Error::ConfigurationDisabled(_) => StatusCode::METHOD_NOT_ALLOWED,
            Error::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Error::Database(_)
            | Error::Internal(_)
            | Error::BatchExecution { .. }
            | Error::JobQueue(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// FHIR `OperationOutcome.issue.code` for this error.
    fn issue_code(&self) -> &'static str {
        match self {
            Error::Validation(_) | Error::InvalidResource(_) => "invalid",
            Error::ResourceNotFound { .. } | Error::JobNotFound(_) => "not-found",
            Error::PreconditionFailed(_) => "multiple-matches",
            Error::NotImplemented(_) | Error::ConfigurationDisabled(_) => "not-supported",
            Error::ReferentialConflict { .. } | Error::JobNotFinished { .. } => "conflict",
            Error::Timeout { .. } => "timeout",
            _ => "exception",
        }
    }

    /// Whether a failed batch may be attempted again.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Error::ReferentialConflict { .. }
                | Error::Validation(_)
                | Error::InvalidResource(_)
                | Error::ConfigurationDisabled(_)
        )
    }

    pub fn to_operation_outcome(&self) -> serde_json::Value {
        json!({
            "resourceType": "OperationOutcome",
            "issue": [{
                "severity": "error",
                "code": self.issue_code(),
                "diagnostics": self.to_string(),
            }]
        })
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        } else {
            tracing::debug!(error = %self, "Request rejected");
        }
        (status, Json(self.to_operation_outcome())).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn referential_conflict_message_names_target_referrer_and_path() {
        let err = Error::ReferentialConflict {
            target: "Organization/1".to_string(),
            referrer: "Patient/2".to_string(),
            path: "Patient.managingOrganization".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "DELETE with _expunge=true failed. Unable to delete Organization/1 because Patient/2 refers to it via the path Patient.managingOrganization"
        );
        assert_eq!(err.status_code(), StatusCode::CONFLICT);
        assert!(!err.is_retryable());
    }

    #[test]
    fn operation_outcome_carries_diagnostics() {
        let err = Error::ConfigurationDisabled("Delete expunge is not enabled on this server".into());
        let outcome = err.to_operation_outcome();
        assert_eq!(outcome["resourceType"], "OperationOutcome");
        assert_eq!(outcome["issue"][0]["code"], "not-supported");
        assert_eq!(
            outcome["issue"][0]["diagnostics"],
            "Delete expunge is not enabled on this server"
        );
        assert_eq!(err.status_code(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[test]
    fn storage_failures_are_retryable() {
        assert!(Error::Internal("disk full".into()).is_retryable());
        assert!(Error::BatchExecution {
            batch: 0,
            message: "boom".into()
        }
        .is_retryable());
    }
}
