// Copyright (C) 2025 The Direktiv Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for direktiv-core.
//!
//! [`CoreError`] covers storage and infrastructure failures. [`EngineError`]
//! is what state logic and the engine API return: the three workflow error
//! kinds (catchable, uncatchable, internal) plus wrapped core errors, which
//! the step handler treats as internal.

use std::fmt;

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Engine error codes.
pub mod codes {
    /// jq expression failed to compile or run.
    pub const JQ_BAD_COMMAND: &str = "direktiv.jq.badCommand";
    /// jq transform produced a non-object.
    pub const JQ_NOT_OBJECT: &str = "direktiv.jq.notObject";
    /// Validate state rejected its subject.
    pub const SCHEMA_FAILED: &str = "direktiv.schema.failed";
    /// Every branch of an `or` parallel state failed.
    pub const PARALLEL_ALL_FAILED: &str = "direktiv.parallel.allFailed";
    /// A second terminal error was recorded on the same instance.
    pub const MULTIPLE_ERRORS: &str = "direktiv.workflow.multipleErrors";
    /// Generated event context could not be evaluated.
    pub const EVENT_JQ: &str = "direktiv.event.jq";
    /// A sandbox request could not be delivered.
    pub const ACTION_DISPATCH: &str = "direktiv.action.dispatch";
    /// Per-namespace instance rate limit reached.
    pub const LIMITS_INSTANCES: &str = "direktiv.limits.instances";
    /// Too many children requested by one state.
    pub const LIMITS_PARALLEL: &str = "direktiv.limits.parallel";
    /// Subflow nesting too deep.
    pub const LIMITS_DEPTH: &str = "direktiv.limits.depth";
    /// Subflow target does not exist.
    pub const SUBFLOW_NOT_EXIST: &str = "direktiv.subflow.notExist";
    /// A referenced secret does not exist.
    pub const SECRETS_NOT_FOUND: &str = "direktiv.secrets.notFound";
    /// Cancelled through the API.
    pub const CANCELS_API: &str = "direktiv.cancels.api";
    /// Hard timeout.
    pub const CANCELS_TIMEOUT: &str = "direktiv.cancels.timeout";
    /// Soft timeout; catchable.
    pub const CANCELS_TIMEOUT_SOFT: &str = "direktiv.cancels.timeout.soft";
    /// Parent instance was cancelled.
    pub const CANCELS_PARENT: &str = "direktiv.cancels.parent";
    /// Node restart could not resume the instance.
    pub const CANCELS_KICKSTART: &str = "direktiv.cancels.kickstart";
    /// Internal failure.
    pub const INTERNAL: &str = "direktiv.internal.error";
}

/// Core errors that can occur during storage or coordination.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum CoreError {
    /// A record was not found.
    NotFound {
        /// Kind of record (namespace, workflow, instance, timer, ...).
        kind: &'static str,
        /// The identifier that was not found.
        id: String,
    },

    /// A record with the same unique key already exists.
    AlreadyExists {
        /// Kind of record.
        kind: &'static str,
        /// The conflicting identifier.
        id: String,
    },

    /// Optimistic concurrency check failed.
    AlreadyUpdated {
        /// Workflow id.
        workflow_id: String,
        /// Revision the caller expected.
        expected: i32,
        /// Revision found in storage.
        actual: i32,
    },

    /// Instance is in an invalid state for the requested operation.
    InvalidInstanceState {
        /// The instance ID.
        instance_id: String,
        /// The expected status.
        expected: String,
        /// The actual status.
        actual: String,
    },

    /// Input validation failed.
    ValidationError {
        /// The field that failed validation.
        field: String,
        /// The validation error message.
        message: String,
    },

    /// An advisory lock could not be acquired in time.
    LockTimeout {
        /// The lock key.
        key: i64,
    },

    /// Database operation failed.
    DatabaseError {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },
}

impl CoreError {
    /// Shorthand for [`CoreError::NotFound`].
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Shorthand for [`CoreError::ValidationError`].
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ValidationError {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Shorthand for [`CoreError::DatabaseError`].
    pub fn database(operation: impl Into<String>, details: impl fmt::Display) -> Self {
        Self::DatabaseError {
            operation: operation.into(),
            details: details.to_string(),
        }
    }

    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "NOT_FOUND",
            Self::AlreadyExists { .. } => "ALREADY_EXISTS",
            Self::AlreadyUpdated { .. } => "ALREADY_UPDATED",
            Self::InvalidInstanceState { .. } => "INVALID_INSTANCE_STATE",
            Self::ValidationError { .. } => "VALIDATION_ERROR",
            Self::LockTimeout { .. } => "LOCK_TIMEOUT",
            Self::DatabaseError { .. } => "DATABASE_ERROR",
        }
    }

    /// Returns true for not-found errors.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { kind, id } => write!(f, "{} '{}' not found", kind, id),
            Self::AlreadyExists { kind, id } => write!(f, "{} '{}' already exists", kind, id),
            Self::AlreadyUpdated {
                workflow_id,
                expected,
                actual,
            } => write!(
                f,
                "workflow '{}' already updated: expected revision {}, found {}",
                workflow_id, expected, actual
            ),
            Self::InvalidInstanceState {
                instance_id,
                expected,
                actual,
            } => write!(
                f,
                "Instance '{}' is in invalid state: expected '{}', got '{}'",
                instance_id, expected, actual
            ),
            Self::ValidationError { field, message } => {
                write!(f, "Validation error on '{}': {}", field, message)
            }
            Self::LockTimeout { key } => write!(f, "timed out waiting for lock {}", key),
            Self::DatabaseError { operation, details } => {
                write!(f, "Database error during {}: {}", operation, details)
            }
        }
    }
}

impl std::error::Error for CoreError {}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &err
            && db.is_unique_violation()
        {
            return CoreError::AlreadyExists {
                kind: "record",
                id: db.constraint().unwrap_or("unique").to_string(),
            };
        }
        CoreError::DatabaseError {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::DatabaseError {
            operation: "serialize".to_string(),
            details: err.to_string(),
        }
    }
}

/// Errors raised while running workflow steps or engine operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    /// May be handled by catchers and retry policies.
    #[error("{code}: {message}")]
    Catchable {
        /// Error code.
        code: String,
        /// Human readable message.
        message: String,
    },

    /// Fails the instance immediately.
    #[error("{code}: {message}")]
    Uncatchable {
        /// Error code.
        code: String,
        /// Human readable message.
        message: String,
    },

    /// Engine fault; the instance crashes.
    #[error("internal error: {0}")]
    Internal(String),

    /// Storage or coordination failure.
    #[error(transparent)]
    Core(#[from] CoreError),
}

impl EngineError {
    /// Build a catchable error.
    pub fn catchable(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Catchable {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Build an uncatchable error.
    pub fn uncatchable(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Uncatchable {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Build an internal error.
    pub fn internal(message: impl fmt::Display) -> Self {
        Self::Internal(message.to_string())
    }

    /// Error code recorded on the instance.
    pub fn code(&self) -> &str {
        match self {
            Self::Catchable { code, .. } | Self::Uncatchable { code, .. } => code,
            Self::Internal(_) | Self::Core(_) => codes::INTERNAL,
        }
    }

    /// Message recorded on the instance.
    pub fn message(&self) -> String {
        match self {
            Self::Catchable { message, .. } | Self::Uncatchable { message, .. } => message.clone(),
            Self::Internal(message) => message.clone(),
            Self::Core(e) => e.to_string(),
        }
    }
}

impl From<direktiv_workflows::jq::JqError> for EngineError {
    fn from(err: direktiv_workflows::jq::JqError) -> Self {
        let code = match err {
            direktiv_workflows::jq::JqError::NotObject { .. } => codes::JQ_NOT_OBJECT,
            _ => codes::JQ_BAD_COMMAND,
        };
        EngineError::catchable(code, err.to_string())
    }
}

impl From<crate::timers::TimerError> for EngineError {
    fn from(err: crate::timers::TimerError) -> Self {
        match err {
            crate::timers::TimerError::Core(e) => EngineError::Core(e),
            other => EngineError::internal(other),
        }
    }
}
