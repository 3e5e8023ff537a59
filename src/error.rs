//! Error handling module
//!
//! Provides unified error types and handling for the entire crate.

use crate::document::DocumentQueryError;
use crate::guard::SqlGuardError;
use serde::Serialize;
use thiserror::Error;

/// Crate-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("SQLGuard blocked query: {0}")]
    Guard(#[from] SqlGuardError),

    #[error("Unsafe query spec: {0}")]
    DocumentQuery(#[from] DocumentQueryError),

    #[error("Database error: {0}")]
    Database(#[from] tokio_postgres::Error),

    #[error("Pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),

    #[error("Store timed out: {0}")]
    Timeout(String),

    #[error("Store not connected: {0}")]
    NotConnected(String),

    #[error("Query generation failed: {0}")]
    Generation(String),

    #[error("Table resolution failed: {0}")]
    Resolution(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Broad families of failure, used for reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    InputShape,
    Confinement,
    OperationSafety,
    Resource,
    Resolution,
    Generation,
    Internal,
}

impl AppError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            AppError::Guard(SqlGuardError::EmptyStatement) => ErrorCategory::InputShape,
            AppError::Guard(SqlGuardError::NoTableFound) => ErrorCategory::Confinement,
            AppError::Guard(e) if e.is_confinement() => ErrorCategory::Confinement,
            AppError::Guard(_) => ErrorCategory::OperationSafety,
            AppError::DocumentQuery(e) if e.is_confinement() => ErrorCategory::Confinement,
            AppError::DocumentQuery(
                DocumentQueryError::InvalidQueryType(_) | DocumentQueryError::InvalidStageShape(_),
            ) => ErrorCategory::InputShape,
            AppError::DocumentQuery(_) => ErrorCategory::OperationSafety,
            AppError::Database(_)
            | AppError::Pool(_)
            | AppError::Timeout(_)
            | AppError::NotConnected(_) => ErrorCategory::Resource,
            AppError::Resolution(_) => ErrorCategory::Resolution,
            AppError::Generation(_) => ErrorCategory::Generation,
            AppError::Validation(_) => ErrorCategory::InputShape,
            AppError::Config(_) | AppError::Internal(_) => ErrorCategory::Internal,
        }
    }

    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Guard(e) => match e {
                SqlGuardError::EmptyStatement => "EMPTY_STATEMENT",
                SqlGuardError::UnsafeOperation(_) => "UNSAFE_OPERATION",
                SqlGuardError::SystemSchemaAccess(_) => "SYSTEM_SCHEMA_ACCESS",
                SqlGuardError::NoTableFound => "NO_TABLE_FOUND",
                SqlGuardError::UnknownTable { .. } => "UNKNOWN_TABLE",
                SqlGuardError::UnknownAlias(_) => "UNKNOWN_ALIAS",
                SqlGuardError::UnknownColumn { .. } => "UNKNOWN_COLUMN",
            },
            AppError::DocumentQuery(e) => match e {
                DocumentQueryError::InvalidQueryType(_) => "INVALID_QUERY_TYPE",
                DocumentQueryError::BlockedOperator { .. } => "BLOCKED_OPERATOR",
                DocumentQueryError::PipelineTooLong { .. } => "PIPELINE_TOO_LONG",
                DocumentQueryError::InvalidStageShape(_) => "INVALID_STAGE_SHAPE",
                DocumentQueryError::DisallowedStage(_) => "DISALLOWED_STAGE",
                DocumentQueryError::UnknownField { .. } => "UNKNOWN_FIELD",
            },
            AppError::Database(_) => "DATABASE_ERROR",
            AppError::Pool(_) => "POOL_EXHAUSTED",
            AppError::Timeout(_) => "TIMEOUT",
            AppError::NotConnected(_) => "NOT_CONNECTED",
            AppError::Generation(_) => "GENERATION_FAILED",
            AppError::Resolution(_) => "RESOLUTION_FAILED",
            AppError::Validation(_) => "VALIDATION_ERROR",
            AppError::Config(_) => "CONFIG_ERROR",
            AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

/// Error response structure handed to callers
#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub message: String,
    pub code: String,
    pub category: ErrorCategory,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
}

/// Result type alias used across the crate
pub type AppResult<T> = Result<T, AppError>;

/// Helper function to create a validation error
pub fn validation_error(msg: impl Into<String>) -> AppError {
    AppError::Validation(msg.into())
}
