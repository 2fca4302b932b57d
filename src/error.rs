//! Error types for the KIT operator
//!
//! Every failure a controller pass can produce is one variant of [`Error`].
//! The dispatcher never inspects messages: it asks [`Error::action`] what to
//! do next, so the retry policy lives in one place.

use std::time::Duration;
use thiserror::Error;

/// Unified error type for the operator
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("No controller registered for kind {kind}")]
    NoController { kind: String },

    // =========================================================================
    // Kubernetes / Object Store Errors
    // =========================================================================
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Resource not found: {kind}/{name}")]
    ResourceNotFound { kind: String, name: String },

    #[error("Resource already exists: {kind}/{name}")]
    ResourceExists { kind: String, name: String },

    #[error("Invalid object {kind}/{name}: {reason}")]
    InvalidObject {
        kind: String,
        name: String,
        reason: String,
    },

    // =========================================================================
    // Cloud Provider Errors
    // =========================================================================
    #[error("Cloud API error: {service} {operation}: {reason}")]
    CloudApi {
        service: String,
        operation: String,
        reason: String,
    },

    #[error("Cloud API throttled: {service} {operation}")]
    Throttled { service: String, operation: String },

    #[error("Cloud API call {operation} timed out after {timeout:?}")]
    Timeout { operation: String, timeout: Duration },

    #[error("Expected at most one {kind} named {name}, found {count}")]
    DuplicateResources {
        kind: String,
        name: String,
        count: usize,
    },

    // =========================================================================
    // Engine Errors
    // =========================================================================
    #[error("Operation cancelled: {operation}")]
    Cancelled { operation: String },

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

/// Action to take on error during reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Requeue with per-key exponential backoff
    RequeueWithBackoff,
    /// Don't requeue, wait for the object to change
    NoRequeue,
}

impl Error {
    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            // Uniqueness violations and malformed objects cannot be fixed by
            // retrying; they need an operator.
            Error::DuplicateResources { .. }
            | Error::InvalidObject { .. }
            | Error::Configuration(_)
            | Error::NoController { .. } => ErrorAction::NoRequeue,

            // Engine is shutting down
            Error::Cancelled { .. } => ErrorAction::NoRequeue,

            // All other errors - retry with backoff
            _ => ErrorAction::RequeueWithBackoff,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(self.action(), ErrorAction::NoRequeue)
    }

    /// Check if this error is transient
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Kube(_)
                | Error::CloudApi { .. }
                | Error::Throttled { .. }
                | Error::Timeout { .. }
        )
    }

    /// Check if this error reports a resource that already exists
    pub fn is_already_exists(&self) -> bool {
        match self {
            Error::ResourceExists { .. } => true,
            Error::Kube(kube::Error::Api(ae)) => ae.code == 409,
            _ => false,
        }
    }

    /// Check if this error reports a resource that does not exist
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::ResourceNotFound { .. } => true,
            Error::Kube(kube::Error::Api(ae)) => ae.code == 404,
            _ => false,
        }
    }

    /// Check if this error was caused by engine shutdown
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled { .. })
    }
}

/// Result type alias for the operator
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_actions() {
        let err = Error::DuplicateResources {
            kind: "AutoScalingGroup".into(),
            name: "cluster-asg".into(),
            count: 2,
        };
        assert_eq!(err.action(), ErrorAction::NoRequeue);

        let err = Error::Throttled {
            service: "autoscaling".into(),
            operation: "DescribeAutoScalingGroups".into(),
        };
        assert_eq!(err.action(), ErrorAction::RequeueWithBackoff);

        let err = Error::Cancelled {
            operation: "CreateAutoScalingGroup".into(),
        };
        assert_eq!(err.action(), ErrorAction::NoRequeue);
    }

    #[test]
    fn test_error_retryable() {
        let transient = Error::CloudApi {
            service: "ec2".into(),
            operation: "DescribeSubnets".into(),
            reason: "connection reset".into(),
        };
        assert!(transient.is_retryable());
        assert!(transient.is_transient());

        let config_err = Error::Configuration("invalid".into());
        assert!(!config_err.is_retryable());
        assert!(!config_err.is_transient());
    }

    #[test]
    fn test_error_kinds() {
        let exists = Error::ResourceExists {
            kind: "NatGateway".into(),
            name: "cluster-nat-gateway".into(),
        };
        assert!(exists.is_already_exists());
        assert!(!exists.is_not_found());

        let missing = Error::ResourceNotFound {
            kind: "NatGateway".into(),
            name: "cluster-nat-gateway".into(),
        };
        assert!(missing.is_not_found());
        assert!(!missing.is_already_exists());
    }
}
