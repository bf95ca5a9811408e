//! Error types for CiteGraph services
//!
//! Provides a single error taxonomy for the shared layer with:
//! - Distinct error types for different failure modes
//! - Machine-readable error codes for logs and operator tooling
//! - A split between invariant violations and recoverable failures

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;

/// Error codes for machine-readable error identification
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Validation errors (1xxx)
    ValidationError,
    InvalidIdentifier,

    // Resource errors (4xxx)
    EntryNotFound,

    // State machine errors (5xxx)
    InvalidTransition,
    RetryBudgetExceeded,
    LeaseLost,

    // Database errors (7xxx)
    DatabaseError,
    ConnectionError,

    // External service errors (8xxx)
    UpstreamError,

    // Internal errors (9xxx)
    InternalError,
    ConfigurationError,
    SerializationError,
}

impl ErrorCode {
    /// Get the numeric code for this error
    pub fn as_code(&self) -> u16 {
        match self {
            ErrorCode::ValidationError => 1001,
            ErrorCode::InvalidIdentifier => 1002,

            ErrorCode::EntryNotFound => 4002,

            ErrorCode::InvalidTransition => 5001,
            ErrorCode::RetryBudgetExceeded => 5002,
            ErrorCode::LeaseLost => 5003,

            ErrorCode::DatabaseError => 7001,
            ErrorCode::ConnectionError => 7002,

            ErrorCode::UpstreamError => 8001,

            ErrorCode::InternalError => 9001,
            ErrorCode::ConfigurationError => 9002,
            ErrorCode::SerializationError => 9003,
        }
    }
}

/// Application error types
#[derive(Error, Debug)]
pub enum AppError {
    // Validation errors
    #[error("Validation failed: {message}")]
    Validation {
        message: String,
        field: Option<String>,
    },

    #[error("Invalid paper identifier: {id:?}")]
    InvalidIdentifier { id: String },

    // Resource errors
    #[error("Queue entry not found: {paper_id}")]
    EntryNotFound { paper_id: String },

    // State machine errors
    #[error("Invalid queue transition for {paper_id}: {from} -> {to}")]
    InvalidTransition {
        paper_id: String,
        from: String,
        to: String,
    },

    /// The worker's lease was reclaimed and possibly handed to another worker
    #[error("Lease on {paper_id} no longer held by {worker_id}")]
    LeaseLost { paper_id: String, worker_id: String },

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] sea_orm::DbErr),

    #[error("Database connection error: {message}")]
    DatabaseConnection { message: String },

    // External service errors
    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    // Internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Generic
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl AppError {
    /// Get the error code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            AppError::Validation { .. } => ErrorCode::ValidationError,
            AppError::InvalidIdentifier { .. } => ErrorCode::InvalidIdentifier,
            AppError::EntryNotFound { .. } => ErrorCode::EntryNotFound,
            AppError::InvalidTransition { .. } => ErrorCode::InvalidTransition,
            AppError::LeaseLost { .. } => ErrorCode::LeaseLost,
            AppError::Database(_) => ErrorCode::DatabaseError,
            AppError::DatabaseConnection { .. } => ErrorCode::ConnectionError,
            AppError::HttpClient(_) => ErrorCode::UpstreamError,
            AppError::Internal { .. } => ErrorCode::InternalError,
            AppError::Configuration { .. } => ErrorCode::ConfigurationError,
            AppError::Serialization(_) => ErrorCode::SerializationError,
            AppError::Other(_) => ErrorCode::InternalError,
        }
    }

    /// Invariant violations that must stop the process instead of being retried.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AppError::InvalidTransition { .. } | AppError::EntryNotFound { .. }
        )
    }

    /// The caller outlived its lease; its work must be discarded, not retried
    pub fn is_lease_lost(&self) -> bool {
        matches!(self, AppError::LeaseLost { .. })
    }

    /// Structural failures of the store itself (connectivity, SQL errors).
    pub fn is_storage_error(&self) -> bool {
        matches!(
            self,
            AppError::Database(_) | AppError::DatabaseConnection { .. }
        )
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Internal {
            message: err.to_string(),
        }
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Configuration {
            message: err.to_string(),
        }
    }
}

impl From<validator::ValidationErrors> for AppError {
    fn from(err: validator::ValidationErrors) -> Self {
        AppError::Configuration {
            message: err.to_string(),
        }
    }
}
