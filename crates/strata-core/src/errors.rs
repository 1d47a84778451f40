//! Unified error system for the failover manager and reconfiguration agent
//!
//! Every fallible operation returns [`StrataError`]. Replies that cross the
//! node boundary carry the compact [`ErrorCodeValue`] instead of the full error
//! so a node can decide whether to retry without parsing messages.

use serde::{Deserialize, Serialize};

/// Compact error classification carried in protocol replies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCodeValue {
    /// The operation succeeded
    Success,
    /// The caller is behind the current version or instance
    StaleRequest,
    /// The operation did not finish in time
    Timeout,
    /// Persistence failed
    StoreFailure,
    /// The failover unit is not resident in the cache
    FailoverUnitNotFound,
    /// The failover unit already exists in the cache
    FailoverUnitAlreadyExists,
    /// The node is not known to the node cache
    NodeNotFound,
    /// The service is not known to the service cache
    ServiceNotFound,
    /// The node is running a version the cluster does not allow
    InvalidRolloutVersion,
    /// The component is not ready to serve requests
    NotReady,
    /// The operation was cancelled
    OperationCanceled,
    /// The request was malformed or violated a precondition
    InvalidArgument,
    /// An unexpected internal failure
    Internal,
}

impl ErrorCodeValue {
    /// Whether this code represents success
    pub fn is_success(self) -> bool {
        self == Self::Success
    }
}

/// Unified error type for all strata operations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum StrataError {
    /// The request refers to an older version instance than the one known
    #[error("Stale request: {message}")]
    StaleRequest {
        /// What was stale
        message: String,
    },

    /// The operation ran out of time
    #[error("Timeout: {message}")]
    Timeout {
        /// What timed out
        message: String,
    },

    /// A store write or read failed
    #[error("Store error: {message}")]
    Store {
        /// Error message describing the store failure
        message: String,
    },

    /// The failover unit is not resident
    #[error("Failover unit not found: {message}")]
    FailoverUnitNotFound {
        /// Identifier of the missing failover unit
        message: String,
    },

    /// The failover unit was inserted concurrently
    #[error("Failover unit already exists: {message}")]
    FailoverUnitAlreadyExists {
        /// Identifier of the existing failover unit
        message: String,
    },

    /// The node is not known
    #[error("Node not found: {message}")]
    NodeNotFound {
        /// Identifier of the missing node
        message: String,
    },

    /// The service is not known
    #[error("Service not found: {message}")]
    ServiceNotFound {
        /// Name of the missing service
        message: String,
    },

    /// The node version is not allowed in the cluster right now
    #[error("Invalid rollout version: {message}")]
    InvalidRolloutVersion {
        /// Expected and actual versions
        message: String,
    },

    /// The component has not finished loading
    #[error("Not ready: {message}")]
    NotReady {
        /// Which component is not ready
        message: String,
    },

    /// The operation was cancelled before it completed
    #[error("Operation canceled: {message}")]
    OperationCanceled {
        /// What was cancelled
        message: String,
    },

    /// Invalid input or configuration
    #[error("Invalid: {message}")]
    Invalid {
        /// Error message describing the invalid input
        message: String,
    },

    /// Internal system error
    #[error("Internal error: {message}")]
    Internal {
        /// Error message describing the internal error
        message: String,
    },
}

impl StrataError {
    /// Create a stale request error
    pub fn stale(message: impl Into<String>) -> Self {
        Self::StaleRequest {
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout {
            message: message.into(),
        }
    }

    /// Create a store error
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store {
            message: message.into(),
        }
    }

    /// Create a failover unit not found error
    pub fn failover_unit_not_found(message: impl Into<String>) -> Self {
        Self::FailoverUnitNotFound {
            message: message.into(),
        }
    }

    /// Create a failover unit already exists error
    pub fn failover_unit_already_exists(message: impl Into<String>) -> Self {
        Self::FailoverUnitAlreadyExists {
            message: message.into(),
        }
    }

    /// Create a node not found error
    pub fn node_not_found(message: impl Into<String>) -> Self {
        Self::NodeNotFound {
            message: message.into(),
        }
    }

    /// Create a service not found error
    pub fn service_not_found(message: impl Into<String>) -> Self {
        Self::ServiceNotFound {
            message: message.into(),
        }
    }

    /// Create an invalid rollout version error
    pub fn invalid_rollout_version(message: impl Into<String>) -> Self {
        Self::InvalidRolloutVersion {
            message: message.into(),
        }
    }

    /// Create a not ready error
    pub fn not_ready(message: impl Into<String>) -> Self {
        Self::NotReady {
            message: message.into(),
        }
    }

    /// Create an operation canceled error
    pub fn canceled(message: impl Into<String>) -> Self {
        Self::OperationCanceled {
            message: message.into(),
        }
    }

    /// Create an invalid input error
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Compact code for protocol replies
    pub fn code(&self) -> ErrorCodeValue {
        match self {
            Self::StaleRequest { .. } => ErrorCodeValue::StaleRequest,
            Self::Timeout { .. } => ErrorCodeValue::Timeout,
            Self::Store { .. } => ErrorCodeValue::StoreFailure,
            Self::FailoverUnitNotFound { .. } => ErrorCodeValue::FailoverUnitNotFound,
            Self::FailoverUnitAlreadyExists { .. } => ErrorCodeValue::FailoverUnitAlreadyExists,
            Self::NodeNotFound { .. } => ErrorCodeValue::NodeNotFound,
            Self::ServiceNotFound { .. } => ErrorCodeValue::ServiceNotFound,
            Self::InvalidRolloutVersion { .. } => ErrorCodeValue::InvalidRolloutVersion,
            Self::NotReady { .. } => ErrorCodeValue::NotReady,
            Self::OperationCanceled { .. } => ErrorCodeValue::OperationCanceled,
            Self::Invalid { .. } => ErrorCodeValue::InvalidArgument,
            Self::Internal { .. } => ErrorCodeValue::Internal,
        }
    }

    /// Whether retrying the same unit of work may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. }
                | Self::Store { .. }
                | Self::FailoverUnitNotFound { .. }
                | Self::NotReady { .. }
        )
    }

    /// Whether the caller was behind
    pub fn is_stale(&self) -> bool {
        matches!(self, Self::StaleRequest { .. })
    }
}

/// Standard Result type for strata operations
pub type Result<T> = std::result::Result<T, StrataError>;

impl From<serde_json::Error> for StrataError {
    fn from(err: serde_json::Error) -> Self {
        Self::invalid(format!("JSON: {err}"))
    }
}

impl From<toml::de::Error> for StrataError {
    fn from(err: toml::de::Error) -> Self {
        Self::invalid(format!("TOML: {err}"))
    }
}

impl From<std::io::Error> for StrataError {
    fn from(err: std::io::Error) -> Self {
        Self::internal(format!("I/O: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_are_retryable() {
        assert!(StrataError::timeout("replica up").is_transient());
        assert!(StrataError::store("commit").is_transient());
        assert!(!StrataError::stale("instance 3 < 5").is_transient());
        assert!(!StrataError::invalid("empty domain").is_transient());
    }

    #[test]
    fn codes_round_out_every_variant() {
        assert_eq!(StrataError::stale("x").code(), ErrorCodeValue::StaleRequest);
        assert_eq!(
            StrataError::failover_unit_already_exists("x").code(),
            ErrorCodeValue::FailoverUnitAlreadyExists
        );
        assert_eq!(
            StrataError::invalid_rollout_version("x").code(),
            ErrorCodeValue::InvalidRolloutVersion
        );
        assert!(!StrataError::internal("x").code().is_success());
    }

    #[test]
    fn display_includes_category() {
        let err = StrataError::store("disk full");
        assert_eq!(err.to_string(), "Store error: disk full");
    }
}
