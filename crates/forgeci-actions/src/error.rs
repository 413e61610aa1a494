// Copyright (C) 2025 The Forgeci Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for forgeci-actions.
//!
//! Provides a unified error type that maps to RPC error responses on the
//! runner wire and to HTTP statuses on the OIDC surface.

use forgeci_protocol::runner_proto::RpcError;
use std::fmt;

/// Result type using ActionsError
pub type Result<T> = std::result::Result<T, ActionsError>;

/// Actions errors that can occur during request processing.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum ActionsError {
    /// Runner was not found (or is out of scope for the caller).
    RunnerNotFound {
        /// The runner UUID that was not found.
        uuid: String,
    },

    /// Registration token is unknown, inactive, or its owning scope is gone.
    InvalidRegistration {
        /// Why the registration was refused.
        reason: String,
    },

    /// Task was not found or does not belong to the calling runner.
    TaskNotFound {
        /// The task id that was not found.
        task_id: i64,
    },

    /// Run was not found.
    RunNotFound {
        /// The run id that was not found.
        run_id: i64,
    },

    /// Job was not found.
    JobNotFound {
        /// The job id that was not found.
        job_id: i64,
    },

    /// The Authorization header is missing or not a Bearer token.
    BadAuthorization,

    /// A token failed verification or carries the wrong claims.
    InvalidToken {
        /// What was wrong with the token.
        reason: String,
    },

    /// The run id in the request does not match the token's run.
    RunMismatch {
        /// Run id from the URL.
        requested: i64,
        /// Run id from the token.
        actual: i64,
    },

    /// The task is not in the Running state.
    TaskNotRunning {
        /// The task id.
        task_id: i64,
    },

    /// Log rows were rejected because the log has been moved to storage.
    LogArchived {
        /// The task whose log is archived.
        task_id: i64,
    },

    /// Secret or variable name is reserved.
    ForbiddenName {
        /// The rejected name.
        name: String,
    },

    /// Workflow file could not be parsed or expanded.
    WorkflowError {
        /// Parse or expansion failure details.
        message: String,
    },

    /// Input validation failed.
    ValidationError {
        /// The field that failed validation.
        field: String,
        /// The validation error message.
        message: String,
    },

    /// Log storage operation failed.
    StorageError {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },

    /// Cryptographic operation failed (encryption, signing, key loading).
    CryptoError {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },

    /// Database operation failed.
    DatabaseError {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },
}

impl ActionsError {
    /// Convert this error to an RpcError for runner protocol responses.
    pub fn to_rpc_error(&self) -> RpcError {
        RpcError {
            code: self.error_code().to_string(),
            message: self.to_string(),
        }
    }

    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::RunnerNotFound { .. } => "RUNNER_NOT_FOUND",
            Self::InvalidRegistration { .. } => "INVALID_REGISTRATION",
            Self::TaskNotFound { .. } => "TASK_NOT_FOUND",
            Self::RunNotFound { .. } => "RUN_NOT_FOUND",
            Self::JobNotFound { .. } => "JOB_NOT_FOUND",
            Self::BadAuthorization => "BAD_AUTHORIZATION",
            Self::InvalidToken { .. } => "INVALID_TOKEN",
            Self::RunMismatch { .. } => "RUN_MISMATCH",
            Self::TaskNotRunning { .. } => "TASK_NOT_RUNNING",
            Self::LogArchived { .. } => "LOG_ARCHIVED",
            Self::ForbiddenName { .. } => "FORBIDDEN_NAME",
            Self::WorkflowError { .. } => "WORKFLOW_ERROR",
            Self::ValidationError { .. } => "VALIDATION_ERROR",
            Self::StorageError { .. } => "STORAGE_ERROR",
            Self::CryptoError { .. } => "CRYPTO_ERROR",
            Self::DatabaseError { .. } => "DATABASE_ERROR",
        }
    }

    /// HTTP status for the OIDC surface.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::BadAuthorization | Self::InvalidToken { .. } => 401,
            Self::RunMismatch { .. } | Self::TaskNotRunning { .. } => 403,
            Self::RunnerNotFound { .. }
            | Self::TaskNotFound { .. }
            | Self::RunNotFound { .. }
            | Self::JobNotFound { .. } => 404,
            Self::ForbiddenName { .. }
            | Self::ValidationError { .. }
            | Self::WorkflowError { .. } => 400,
            _ => 500,
        }
    }
}

impl fmt::Display for ActionsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RunnerNotFound { uuid } => {
                write!(f, "Runner '{}' not found", uuid)
            }
            Self::InvalidRegistration { reason } => {
                write!(f, "Registration refused: {}", reason)
            }
            Self::TaskNotFound { task_id } => {
                write!(f, "Task {} not found", task_id)
            }
            Self::RunNotFound { run_id } => {
                write!(f, "Run {} not found", run_id)
            }
            Self::JobNotFound { job_id } => {
                write!(f, "Job {} not found", job_id)
            }
            Self::BadAuthorization => {
                write!(f, "Missing or malformed Authorization header")
            }
            Self::InvalidToken { reason } => {
                write!(f, "Invalid token: {}", reason)
            }
            Self::RunMismatch { requested, actual } => {
                write!(
                    f,
                    "Run {} in request does not match run {} in token",
                    requested, actual
                )
            }
            Self::TaskNotRunning { task_id } => {
                write!(f, "Task {} is not running", task_id)
            }
            Self::LogArchived { task_id } => {
                write!(f, "Log for task {} has been archived", task_id)
            }
            Self::ForbiddenName { name } => {
                write!(f, "Name '{}' is reserved", name)
            }
            Self::WorkflowError { message } => {
                write!(f, "Workflow error: {}", message)
            }
            Self::ValidationError { field, message } => {
                write!(f, "Validation error for '{}': {}", field, message)
            }
            Self::StorageError { operation, details } => {
                write!(f, "Storage error during '{}': {}", operation, details)
            }
            Self::CryptoError { operation, details } => {
                write!(f, "Crypto error during '{}': {}", operation, details)
            }
            Self::DatabaseError { operation, details } => {
                write!(f, "Database error during '{}': {}", operation, details)
            }
        }
    }
}

impl std::error::Error for ActionsError {}

impl From<sqlx::Error> for ActionsError {
    fn from(err: sqlx::Error) -> Self {
        ActionsError::DatabaseError {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for ActionsError {
    fn from(err: serde_json::Error) -> Self {
        ActionsError::DatabaseError {
            operation: "json".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_yaml::Error> for ActionsError {
    fn from(err: serde_yaml::Error) -> Self {
        ActionsError::WorkflowError {
            message: err.to_string(),
        }
    }
}
