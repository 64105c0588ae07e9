//! Error types for the Primus-SaFE controllers

use thiserror::Error;

/// Result type alias for controller operations
pub type Result<T> = std::result::Result<T, OperatorError>;

/// Errors that can occur while reconciling workloads, faults and exported resources
#[derive(Debug, Error)]
pub enum OperatorError {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    KubeApi(#[from] kube::Error),
    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),
    /// Reconciliation error
    #[error("Reconciliation error: {0}")]
    Reconciliation(String),
    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// Resource not found
    #[error("Resource not found: {0}")]
    NotFound(String),
    /// The request can never succeed as issued
    #[error("Bad request: {0}")]
    BadRequest(String),
    /// Internal inconsistency that retrying will not fix
    #[error("Internal error: {0}")]
    Internal(String),
    /// Invalid resource state
    #[error("Invalid state: {0}")]
    InvalidState(String),
    /// Optimistic-concurrency conflict
    #[error("Conflict: {0}")]
    Conflict(String),
    /// Relational store error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl OperatorError {
    /// HTTP status code of a Kubernetes API error response, if any.
    pub fn api_code(&self) -> Option<u16> {
        match self {
            OperatorError::KubeApi(kube::Error::Api(resp)) => Some(resp.code),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, OperatorError::NotFound(_)) || self.api_code() == Some(404)
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, OperatorError::Conflict(_)) || self.api_code() == Some(409)
    }

    /// A create rejected because the object is already there.
    pub fn is_already_exists(&self) -> bool {
        matches!(self, OperatorError::KubeApi(kube::Error::Api(resp)) if resp.reason == "AlreadyExists")
    }

    /// Errors that will never resolve by retrying. Callers that check this
    /// stop requeueing instead of burning backoff budget.
    pub fn is_non_retryable(&self) -> bool {
        match self {
            OperatorError::BadRequest(_)
            | OperatorError::Internal(_)
            | OperatorError::NotFound(_) => true,
            _ => matches!(self.api_code(), Some(403) | Some(404)),
        }
    }
}

/// Treats a Kubernetes 404 as success, passing every other outcome through.
pub fn ignore_not_found<T: Default>(result: Result<T>) -> Result<T> {
    match result {
        Err(e) if e.is_not_found() => Ok(T::default()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_error(code: u16) -> OperatorError {
        OperatorError::KubeApi(kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "test".to_string(),
            reason: "Test".to_string(),
            code,
        }))
    }

    #[test]
    fn test_error_display() {
        let err = OperatorError::Configuration("missing endpoint".to_string());
        assert!(err.to_string().contains("Configuration error"));
        assert!(api_error(500).to_string().contains("Kubernetes API error"));
    }

    #[test]
    fn test_non_retryable_classification() {
        assert!(OperatorError::BadRequest("x".into()).is_non_retryable());
        assert!(OperatorError::Internal("x".into()).is_non_retryable());
        assert!(OperatorError::NotFound("x".into()).is_non_retryable());
        assert!(api_error(403).is_non_retryable());
        assert!(api_error(404).is_non_retryable());

        assert!(!api_error(409).is_non_retryable());
        assert!(!api_error(500).is_non_retryable());
        assert!(!OperatorError::Conflict("x".into()).is_non_retryable());
        assert!(!OperatorError::Reconciliation("x".into()).is_non_retryable());
    }

    #[test]
    fn test_conflict_and_not_found() {
        assert!(api_error(409).is_conflict());
        assert!(api_error(404).is_not_found());
        assert!(!api_error(500).is_not_found());
    }

    #[test]
    fn test_already_exists_is_told_apart_from_conflict() {
        let exists = OperatorError::KubeApi(kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "jobs.batch \"train\" already exists".to_string(),
            reason: "AlreadyExists".to_string(),
            code: 409,
        }));
        assert!(exists.is_already_exists());
        assert!(!api_error(409).is_already_exists());
        assert!(!OperatorError::Conflict("x".into()).is_already_exists());
    }

    #[test]
    fn test_ignore_not_found() {
        let gone: Result<()> = Err(api_error(404));
        assert!(ignore_not_found(gone).is_ok());

        let broken: Result<()> = Err(api_error(500));
        assert!(ignore_not_found(broken).is_err());
    }
}
