// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for stagehand-core.
//!
//! Every error knows the [`StatusUid`] it maps to when the state machine converts it
//! into a result, so a crash always ends up as an addressable result message.

use thiserror::Error;

use crate::status::StatusUid;

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core errors that can occur while running a stage execution.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum CoreError {
    /// No reusable stage execution row exists for the invocation.
    #[error(
        "Stage execution not initialized: stage '{stage_uid}', execution '{execution_uid}', index {index}"
    )]
    NotInitialized {
        /// Stage uid from the trigger body.
        stage_uid: String,
        /// Execution uid from the trigger body (empty when absent).
        execution_uid: String,
        /// Partition index from the trigger body.
        index: u64,
    },

    /// Domain error raised by stage logic, carrying the status it intends.
    #[error("{message}")]
    Worker {
        /// Intended result status.
        status: StatusUid,
        /// Machine-readable code.
        code: String,
        /// Human-readable message.
        message: String,
    },

    /// Input validation failed.
    #[error("Validation error for '{field}': {message}")]
    ValidationError {
        /// The field that failed validation.
        field: String,
        /// The validation error message.
        message: String,
    },

    /// A coordination invariant was broken (e.g. more children reported than spawned).
    #[error("Invariant violation: {message}")]
    InvariantViolation {
        /// Diagnostic message.
        message: String,
    },

    /// Persistence operation failed.
    #[error("Database error during '{operation}': {details}")]
    DatabaseError {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },

    /// Key-value state store operation failed.
    #[error("State store error during '{operation}' on '{key}': {details}")]
    StateStoreError {
        /// The operation that failed.
        operation: String,
        /// Key being accessed.
        key: String,
        /// Error details.
        details: String,
    },

    /// Sending a message to a queue failed.
    #[error("Failed to dispatch to '{topic}': {reason}")]
    DispatchFailed {
        /// Destination topic.
        topic: String,
        /// The reason for failure.
        reason: String,
    },

    /// Stream storage operation failed.
    #[error("Storage error on '{path}': {details}")]
    StorageError {
        /// Path being accessed.
        path: String,
        /// Error details.
        details: String,
    },

    /// Payload could not be serialized or deserialized.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The engine was assembled with missing or invalid collaborators.
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl CoreError {
    /// Domain error with an explicit status.
    pub fn worker(status: StatusUid, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Worker {
            status,
            code: code.into(),
            message: message.into(),
        }
    }

    /// Validation error for a field.
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ValidationError {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &str {
        match self {
            Self::NotInitialized { .. } => "NOT_INITIALIZED",
            Self::Worker { code, .. } => code,
            Self::ValidationError { .. } => "VALIDATION_ERROR",
            Self::InvariantViolation { .. } => "INVARIANT_VIOLATION",
            Self::DatabaseError { .. } => "DATABASE_ERROR",
            Self::StateStoreError { .. } => "STATE_STORE_ERROR",
            Self::DispatchFailed { .. } => "DISPATCH_FAILED",
            Self::StorageError { .. } => "STORAGE_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::Configuration(_) => "CONFIGURATION_ERROR",
        }
    }

    /// Status a result built from this error carries.
    ///
    /// Validation errors and invariant violations are FAILED, domain errors keep their own
    /// status, everything else is UNKNOWN.
    pub fn status_uid(&self) -> StatusUid {
        match self {
            Self::Worker { status, .. } => *status,
            Self::ValidationError { .. } | Self::InvariantViolation { .. } => StatusUid::Failed,
            _ => StatusUid::Unknown,
        }
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        CoreError::DatabaseError {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for CoreError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        CoreError::DatabaseError {
            operation: "migrate".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        CoreError::StorageError {
            path: String::new(),
            details: err.to_string(),
        }
    }
}
