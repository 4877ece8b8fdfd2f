//! Error types for amem-core.

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Result type alias using amem-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during memory service operations.
#[derive(Error, Debug)]
pub enum Error {
    /// A field-level precondition failed
    #[error("Validation failed for '{field}': {message}")]
    Validation { field: String, message: String },

    /// An ACL check denied the request
    #[error("Permission denied: agent '{agent_id}' may not {action} {resource}")]
    PermissionDenied {
        agent_id: String,
        action: String,
        resource: String,
    },

    /// The requested entity does not exist
    #[error("{kind} not found: {id}")]
    NotFound { kind: String, id: String },

    /// A write would collide with an existing entry
    #[error("Duplicate entry '{name}': {} similar entries found", similar.len())]
    DuplicateEntry { name: String, similar: Vec<String> },

    /// The composite rate limiter rejected the request
    #[error("Rate limited by {limiter}: retry after {retry_after_ms}ms")]
    RateLimited {
        limiter: String,
        retry_after_ms: u64,
    },

    /// A circuit breaker is open for a downstream service
    #[error("Circuit breaker open for '{service}', resets at {reset_time}")]
    CircuitBreakerOpen {
        service: String,
        reset_time: DateTime<Utc>,
    },

    /// Asynchronous work escaped a synchronous transaction
    #[error("Async work escaped synchronous transaction. Transaction ID: {txn_id}. Cause: {cause}. {remediation}")]
    TransactionAsyncEscape {
        txn_id: String,
        cause: String,
        remediation: String,
    },

    /// A transaction was opened inside another transaction
    #[error("Nested transaction detected inside {txn_id}")]
    NestedTransaction { txn_id: String },

    /// A pagination cursor was forged, expired, oversized, or corrupt.
    /// The message never echoes cursor payload contents.
    #[error("Invalid cursor: {0}")]
    CursorInvalid(String),

    /// Storage engine error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Retryable provider I/O failure (embedding/LLM backends)
    #[error("Provider error: {provider} - {message}")]
    Provider { provider: String, message: String },

    /// Operation timed out
    #[error("Operation timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a validation error.
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a permission-denied error.
    pub fn permission_denied(
        agent_id: impl Into<String>,
        action: impl Into<String>,
        resource: impl Into<String>,
    ) -> Self {
        Self::PermissionDenied {
            agent_id: agent_id.into(),
            action: action.into(),
            resource: resource.into(),
        }
    }

    /// Create a not-found error.
    pub fn not_found(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            id: id.into(),
        }
    }

    /// Create a provider error.
    pub fn provider(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Provider {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(duration_ms: u64) -> Self {
        Self::Timeout { duration_ms }
    }

    /// Whether this error represents a transient failure worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Provider { .. } | Self::Timeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_error_contains_txn_id() {
        let err = Error::TransactionAsyncEscape {
            txn_id: "txn-42".to_string(),
            cause: "embedding call inside transaction body".to_string(),
            remediation: "Move provider calls outside the transaction closure.".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("Transaction ID: txn-"));
        assert!(msg.contains("embedding call"));
    }

    #[test]
    fn test_cursor_error_has_no_payload() {
        let err = Error::CursorInvalid("signature mismatch".to_string());
        assert_eq!(err.to_string(), "Invalid cursor: signature mismatch");
    }

    #[test]
    fn test_transient_classification() {
        assert!(Error::provider("embeddings", "503").is_transient());
        assert!(Error::timeout(100).is_transient());
        assert!(!Error::not_found("guideline", "g1").is_transient());
    }
}
