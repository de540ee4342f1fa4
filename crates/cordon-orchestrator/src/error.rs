//! Error types for the orchestrator.

use std::time::Duration;

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// All errors the orchestrator can produce.
///
/// The variants split along how callers react to them: validation and
/// conflict errors are terminal and surface to the requester unchanged,
/// provider errors are candidates for retry, and cancellation aborts the
/// current phase without touching resources that already exist.
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// The request or configuration is malformed or incomplete.
    #[error("validation error: {0}")]
    Validation(String),

    /// A resource we expected to find does not exist.
    #[error("{0}")]
    NotFound(String),

    /// The cloud account is in a state the orchestrator refuses to touch.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The cloud provider rejected or failed a call. Retryable.
    #[error("provider error: {0}")]
    Provider(String),

    /// Cooperative cancellation was observed at a phase boundary.
    #[error("operation cancelled")]
    Cancelled,

    /// A bounded wait on resource state ran out of time.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Several independent sub-operations failed in one call.
    #[error("{} operation(s) failed: {}", .0.len(), format_aggregate(.0))]
    Aggregate(Vec<OrchestratorError>),

    /// Serialization of a request or result payload failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

fn format_aggregate(errors: &[OrchestratorError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl OrchestratorError {
    /// Create a validation error.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a not-found error.
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a conflict error.
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// Create a provider error from a plain message.
    pub fn provider(msg: impl Into<String>) -> Self {
        Self::Provider(msg.into())
    }

    /// Convert an EC2 SDK error, preserving the service error text.
    pub fn from_ec2<E>(err: E) -> Self
    where
        aws_sdk_ec2::Error: From<E>,
    {
        Self::Provider(aws_sdk_ec2::Error::from(err).to_string())
    }

    /// Convert an S3 SDK error, preserving the service error text.
    pub fn from_s3<E>(err: E) -> Self
    where
        aws_sdk_s3::Error: From<E>,
    {
        Self::Provider(aws_sdk_s3::Error::from(err).to_string())
    }

    /// Whether a retry policy may re-attempt the failed call.
    ///
    /// Only provider-side failures qualify. Validation, conflict and
    /// not-found errors describe stable states that retrying cannot fix,
    /// and cancellation must never be retried past.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Provider(_) | Self::Timeout(_))
    }

    /// Whether this error (or any member of an aggregate) is a cancellation.
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled => true,
            Self::Aggregate(errors) => errors.iter().any(|e| e.is_cancelled()),
            _ => false,
        }
    }
}
