//! Error taxonomy for broker operations
//!
//! Every error a client can observe carries a stable machine code, a human
//! message, and a structured details map. The transport boundary maps errors
//! to the JSON envelope and HTTP status; the core only raises them.

use crate::EntityKind;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;
use thiserror::Error;

// ============================================================================
// SOURCE POSITIONS (shared with the filter engine)
// ============================================================================

/// Position inside a filter expression, 1-indexed line and column plus the
/// 0-indexed byte offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourcePosition {
    pub line: usize,
    pub column: usize,
    pub offset: usize,
}

impl SourcePosition {
    pub fn new(line: usize, column: usize, offset: usize) -> Self {
        Self {
            line,
            column,
            offset,
        }
    }

    /// Start of input.
    pub fn start() -> Self {
        Self::new(1, 1, 0)
    }
}

impl fmt::Display for SourcePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}, column {}", self.line, self.column)
    }
}

// ============================================================================
// ERROR FAMILIES
// ============================================================================

/// Entity management errors.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EntityError {
    #[error("{entity_kind} '{name}' not found")]
    NotFound { entity_kind: EntityKind, name: String },

    #[error("{entity_kind} '{name}' already exists")]
    AlreadyExists { entity_kind: EntityKind, name: String },

    #[error("Invalid entity name '{name}': {reason}")]
    InvalidName { name: String, reason: String },
}

/// Message operation errors.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum MessageError {
    #[error("Message '{message_id}' not found")]
    NotFound { message_id: String },

    #[error("Message size {actual} exceeds limit of {max} bytes")]
    SizeExceeded { actual: u64, max: u64 },

    #[error("Message lock lost")]
    LockLost,
}

/// Session errors.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SessionError {
    #[error("Session '{session_id}' not found")]
    NotFound { session_id: String },

    #[error("Session lock lost for '{session_id}'")]
    LockLost { session_id: String },

    #[error("Session '{session_id}' is locked by another receiver")]
    AlreadyLocked { session_id: String },
}

/// Quota and rate-limit errors.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum QuotaError {
    #[error("Quota exceeded: {quota_type} ({current}/{max})")]
    Exceeded {
        quota_type: String,
        current: u64,
        max: u64,
        entity_name: Option<String>,
        /// Only set for `rate_limit` quota violations.
        retry_after_seconds: Option<f64>,
    },
}

impl QuotaError {
    /// A rate-limit rejection with the computed retry hint.
    pub fn rate_limit(entity_name: impl Into<String>, capacity: u64, retry_after: f64) -> Self {
        QuotaError::Exceeded {
            quota_type: "rate_limit".to_string(),
            current: 0,
            max: capacity,
            entity_name: Some(entity_name.into()),
            retry_after_seconds: Some(retry_after),
        }
    }
}

/// Operational errors: invalid operations, timeouts, connectivity, breakers.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum OperationalError {
    #[error("Invalid operation '{operation}': {reason}")]
    InvalidOperation { operation: String, reason: String },

    #[error("Operation '{operation}' timed out after {seconds}s")]
    Timeout { operation: String, seconds: f64 },

    #[error("Connection error: {reason}")]
    Connection { reason: String },

    #[error("Circuit breaker '{name}' is open after {failure_count} failures")]
    CircuitOpen { name: String, failure_count: u32 },
}

/// Filter engine errors. Defined here so the error envelope and the filter
/// crate share one taxonomy.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum FilterError {
    #[error("Syntax error at {position}: {message}")]
    Syntax {
        message: String,
        position: SourcePosition,
        suggestion: Option<String>,
    },

    #[error("Type error: {message} (expected {expected}, got {actual})")]
    Type {
        message: String,
        expected: String,
        actual: String,
        position: Option<SourcePosition>,
    },

    #[error("Unknown function '{name}'")]
    UnknownFunction {
        name: String,
        suggestion: Option<String>,
    },

    #[error("Invalid filter: {reason}")]
    Validation { reason: String },

    #[error("Filter complexity {complexity} exceeds limit {max}")]
    Resource { complexity: f64, max: f64 },

    #[error("Evaluation timed out after {elapsed_ms:.1}ms (limit {limit_ms:.0}ms)")]
    Timeout { elapsed_ms: f64, limit_ms: f64 },

    #[error("Evaluation failed: {message}")]
    Evaluation { message: String },
}

// ============================================================================
// MASTER ERROR TYPE
// ============================================================================

/// Master error type for all broker operations.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum BusError {
    #[error("{0}")]
    Entity(#[from] EntityError),

    #[error("{0}")]
    Message(#[from] MessageError),

    #[error("{0}")]
    Session(#[from] SessionError),

    #[error("{0}")]
    Quota(#[from] QuotaError),

    #[error("{0}")]
    Operation(#[from] OperationalError),

    #[error("{0}")]
    Filter(#[from] FilterError),
}

/// Result type alias for broker operations.
pub type BusResult<T> = Result<T, BusError>;

impl BusError {
    /// Stable machine-readable code surfaced in the error envelope.
    pub fn error_code(&self) -> &'static str {
        match self {
            BusError::Entity(EntityError::NotFound { .. }) => "EntityNotFound",
            BusError::Entity(EntityError::AlreadyExists { .. }) => "EntityAlreadyExists",
            BusError::Entity(EntityError::InvalidName { .. }) => "InvalidEntityName",
            BusError::Message(MessageError::NotFound { .. }) => "MessageNotFound",
            BusError::Message(MessageError::SizeExceeded { .. }) => "MessageSizeExceeded",
            BusError::Message(MessageError::LockLost) => "MessageLockLost",
            BusError::Session(SessionError::NotFound { .. }) => "SessionNotFound",
            BusError::Session(SessionError::LockLost { .. }) => "SessionLockLost",
            BusError::Session(SessionError::AlreadyLocked { .. }) => "SessionAlreadyLocked",
            BusError::Quota(QuotaError::Exceeded { .. }) => "QuotaExceeded",
            BusError::Operation(OperationalError::InvalidOperation { .. }) => "InvalidOperation",
            BusError::Operation(OperationalError::Timeout { .. }) => "OperationTimeout",
            BusError::Operation(OperationalError::Connection { .. }) => "ConnectionError",
            BusError::Operation(OperationalError::CircuitOpen { .. }) => "CircuitBreakerOpen",
            BusError::Filter(FilterError::Syntax { .. })
            | BusError::Filter(FilterError::Type { .. })
            | BusError::Filter(FilterError::UnknownFunction { .. })
            | BusError::Filter(FilterError::Validation { .. }) => "InvalidQueryParameterValue",
            BusError::Filter(FilterError::Resource { .. }) => "QueryComplexityExceeded",
            BusError::Filter(FilterError::Timeout { .. }) => "OperationTimeout",
            BusError::Filter(FilterError::Evaluation { .. }) => "EvaluationError",
        }
    }

    /// HTTP status the boundary maps this error to.
    pub fn http_status(&self) -> u16 {
        match self {
            BusError::Entity(EntityError::NotFound { .. }) => 404,
            BusError::Entity(EntityError::AlreadyExists { .. }) => 409,
            BusError::Entity(EntityError::InvalidName { .. }) => 400,
            BusError::Message(MessageError::NotFound { .. }) => 404,
            BusError::Message(MessageError::SizeExceeded { .. }) => 413,
            BusError::Message(MessageError::LockLost) => 410,
            BusError::Session(SessionError::NotFound { .. }) => 404,
            BusError::Session(SessionError::LockLost { .. }) => 410,
            BusError::Session(SessionError::AlreadyLocked { .. }) => 409,
            BusError::Quota(QuotaError::Exceeded { .. }) => 507,
            BusError::Operation(OperationalError::InvalidOperation { .. }) => 400,
            BusError::Operation(OperationalError::Timeout { .. }) => 504,
            BusError::Operation(OperationalError::Connection { .. }) => 503,
            BusError::Operation(OperationalError::CircuitOpen { .. }) => 503,
            BusError::Filter(FilterError::Timeout { .. }) => 504,
            BusError::Filter(_) => 400,
        }
    }

    /// Whether a retry wrapper should consider this error retryable.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BusError::Operation(OperationalError::Timeout { .. })
                | BusError::Operation(OperationalError::Connection { .. })
                | BusError::Filter(FilterError::Timeout { .. })
        )
    }

    /// Structured context for the envelope's `details` map.
    pub fn details(&self) -> Map<String, Value> {
        let mut details = Map::new();
        match self {
            BusError::Entity(EntityError::NotFound { entity_kind, name })
            | BusError::Entity(EntityError::AlreadyExists { entity_kind, name }) => {
                details.insert("entity_type".into(), json!(entity_kind.as_str()));
                details.insert("entity_name".into(), json!(name));
            }
            BusError::Entity(EntityError::InvalidName { name, reason }) => {
                details.insert("entity_name".into(), json!(name));
                details.insert("reason".into(), json!(reason));
            }
            BusError::Message(MessageError::NotFound { message_id }) => {
                details.insert("message_id".into(), json!(message_id));
            }
            BusError::Message(MessageError::SizeExceeded { actual, max }) => {
                details.insert("actual_size".into(), json!(actual));
                details.insert("max_size".into(), json!(max));
            }
            BusError::Message(MessageError::LockLost) => {}
            BusError::Session(SessionError::NotFound { session_id })
            | BusError::Session(SessionError::LockLost { session_id })
            | BusError::Session(SessionError::AlreadyLocked { session_id }) => {
                details.insert("session_id".into(), json!(session_id));
            }
            BusError::Quota(QuotaError::Exceeded {
                quota_type,
                current,
                max,
                entity_name,
                retry_after_seconds,
            }) => {
                details.insert("quota_type".into(), json!(quota_type));
                details.insert("current_value".into(), json!(current));
                details.insert("max_value".into(), json!(max));
                if let Some(name) = entity_name {
                    details.insert("entity_name".into(), json!(name));
                }
                if let Some(retry) = retry_after_seconds {
                    details.insert("retry_after_seconds".into(), json!(retry));
                }
            }
            BusError::Operation(OperationalError::InvalidOperation { operation, reason }) => {
                details.insert("operation".into(), json!(operation));
                details.insert("reason".into(), json!(reason));
            }
            BusError::Operation(OperationalError::Timeout { operation, seconds }) => {
                details.insert("operation".into(), json!(operation));
                details.insert("timeout_seconds".into(), json!(seconds));
            }
            BusError::Operation(OperationalError::Connection { reason }) => {
                details.insert("reason".into(), json!(reason));
            }
            BusError::Operation(OperationalError::CircuitOpen {
                name,
                failure_count,
            }) => {
                details.insert("breaker".into(), json!(name));
                details.insert("failure_count".into(), json!(failure_count));
            }
            BusError::Filter(FilterError::Syntax {
                position,
                suggestion,
                ..
            }) => {
                details.insert(
                    "position".into(),
                    json!({
                        "line": position.line,
                        "column": position.column,
                        "offset": position.offset,
                    }),
                );
                if let Some(suggestion) = suggestion {
                    details.insert("suggestion".into(), json!(suggestion));
                }
            }
            BusError::Filter(FilterError::Type {
                expected,
                actual,
                position,
                ..
            }) => {
                details.insert("expected".into(), json!(expected));
                details.insert("actual".into(), json!(actual));
                if let Some(position) = position {
                    details.insert(
                        "position".into(),
                        json!({
                            "line": position.line,
                            "column": position.column,
                            "offset": position.offset,
                        }),
                    );
                }
            }
            BusError::Filter(FilterError::UnknownFunction { name, suggestion }) => {
                details.insert("function".into(), json!(name));
                if let Some(suggestion) = suggestion {
                    details.insert("suggestion".into(), json!(suggestion));
                }
            }
            BusError::Filter(FilterError::Validation { reason }) => {
                details.insert("reason".into(), json!(reason));
            }
            BusError::Filter(FilterError::Resource { complexity, max }) => {
                details.insert("complexity".into(), json!(complexity));
                details.insert("max_complexity".into(), json!(max));
            }
            BusError::Filter(FilterError::Timeout {
                elapsed_ms,
                limit_ms,
            }) => {
                details.insert("elapsed_ms".into(), json!(elapsed_ms));
                details.insert("limit_ms".into(), json!(limit_ms));
            }
            BusError::Filter(FilterError::Evaluation { message }) => {
                details.insert("reason".into(), json!(message));
            }
        }
        details
    }

    /// Build the client-facing envelope, echoing the request correlation id
    /// when one is available.
    pub fn to_response(&self, correlation_id: Option<&str>) -> ErrorResponse {
        let mut details = self.details();
        if let Some(correlation_id) = correlation_id {
            details.insert("correlation_id".into(), json!(correlation_id));
        }
        ErrorResponse {
            error: ErrorInfo {
                code: self.error_code().to_string(),
                message: self.to_string(),
                details,
            },
        }
    }
}

// ============================================================================
// ERROR ENVELOPE
// ============================================================================

/// Error information in an API response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
    #[serde(default)]
    pub details: Map<String, Value>,
}

/// Standard `{"error": {...}}` envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorInfo,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_stable() {
        let err = BusError::from(EntityError::NotFound {
            entity_kind: EntityKind::Queue,
            name: "orders".to_string(),
        });
        assert_eq!(err.error_code(), "EntityNotFound");
        assert_eq!(err.http_status(), 404);

        let err = BusError::from(MessageError::LockLost);
        assert_eq!(err.error_code(), "MessageLockLost");
        assert_eq!(err.http_status(), 410);

        let err = BusError::from(QuotaError::rate_limit("orders", 200, 0.5));
        assert_eq!(err.error_code(), "QuotaExceeded");
        assert_eq!(err.http_status(), 507);
    }

    #[test]
    fn test_transient_marking() {
        let timeout = BusError::from(OperationalError::Timeout {
            operation: "send".to_string(),
            seconds: 30.0,
        });
        assert!(timeout.is_transient());

        let invalid = BusError::from(OperationalError::InvalidOperation {
            operation: "update_queue".to_string(),
            reason: "requires_session cannot change".to_string(),
        });
        assert!(!invalid.is_transient());
    }

    #[test]
    fn test_envelope_echoes_correlation_id() {
        let err = BusError::from(EntityError::NotFound {
            entity_kind: EntityKind::Topic,
            name: "events".to_string(),
        });
        let envelope = err.to_response(Some("abc-123"));
        assert_eq!(envelope.error.code, "EntityNotFound");
        assert_eq!(envelope.error.details["correlation_id"], json!("abc-123"));
        assert_eq!(envelope.error.details["entity_name"], json!("events"));
    }

    #[test]
    fn test_syntax_error_position_details() {
        let err = BusError::from(FilterError::Syntax {
            message: "Unexpected character: '='".to_string(),
            position: SourcePosition::new(1, 12, 11),
            suggestion: Some("Use 'eq' for equality".to_string()),
        });
        assert_eq!(err.error_code(), "InvalidQueryParameterValue");
        let details = err.details();
        assert_eq!(details["position"]["column"], json!(12));
    }
}
