use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

use crate::audit::AuditError;
use crate::cache::CacheError;
use crate::repository::RepositoryError;

/// Errors returned by the flag registry and the evaluation engine.
#[derive(Debug, Error)]
pub enum FlagError {
    #[error("Flag '{0}' not found")]
    NotFound(String),

    #[error("Flag key '{0}' already exists")]
    Conflict(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error(transparent)]
    Dependency(#[from] DependencyError),
}

/// Failure of one of the collaborators the service depends on.
#[derive(Debug, Error)]
pub enum DependencyError {
    #[error("repository error: {0}")]
    Repository(RepositoryError),

    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("audit store error: {0}")]
    Audit(#[from] AuditError),
}

pub type FlagResult<T> = Result<T, FlagError>;

impl From<RepositoryError> for FlagError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::Conflict(key) => FlagError::Conflict(key),
            other => FlagError::Dependency(DependencyError::Repository(other)),
        }
    }
}

impl From<CacheError> for FlagError {
    fn from(err: CacheError) -> Self {
        FlagError::Dependency(DependencyError::Cache(err))
    }
}

impl From<AuditError> for FlagError {
    fn from(err: AuditError) -> Self {
        FlagError::Dependency(DependencyError::Audit(err))
    }
}

impl FlagError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            FlagError::NotFound(_) => StatusCode::NOT_FOUND,
            FlagError::Conflict(_) => StatusCode::CONFLICT,
            FlagError::Validation(_) => StatusCode::BAD_REQUEST,
            FlagError::Dependency(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for FlagError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed on a dependency");
        }
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}
