use std::path::PathBuf;

use thiserror::Error;

use crate::core::types::ImportResult;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    #[error("failed to open database: {path}: {source}")]
    DbOpenFailed {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    #[error("sql error: {0}")]
    SqlError(String),

    #[error("query is not read-only")]
    NotReadonly,

    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error(
        "import into {} rolled back: {} rows failed",
        .0.table_name,
        .0.failed_count
    )]
    ImportRolledBack(Box<ImportResult>),

    #[error("cancelled")]
    Cancelled,

    #[error("timeout")]
    Timeout,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<rusqlite::Error> for AppError {
    fn from(e: rusqlite::Error) -> Self {
        AppError::SqlError(e.to_string())
    }
}

impl AppError {
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        AppError::NotFound {
            kind,
            name: name.into(),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            AppError::InvalidRequest(_) => "INVALID_REQUEST",
            AppError::Validation(_) => "VALIDATION_ERROR",
            AppError::NotFound { .. } => "NOT_FOUND",
            AppError::DbOpenFailed { .. } => "DB_OPEN_FAILED",
            AppError::SqlError(_) => "SQL_ERROR",
            AppError::NotReadonly => "NOT_READONLY",
            AppError::UnsupportedFormat(_) => "UNSUPPORTED_FORMAT",
            AppError::ImportRolledBack(_) => "PARTIAL_FAILURE",
            AppError::Cancelled => "CANCELLED",
            AppError::Timeout => "TIMEOUT",
            AppError::Io(_) => "IO_ERROR",
            AppError::Json(_) => "JSON_ERROR",
            AppError::Csv(_) => "CSV_ERROR",
            AppError::Internal(_) => "INTERNAL",
        }
    }

    /// Structured payload that travels with the error, if any.
    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            AppError::ImportRolledBack(result) => serde_json::to_value(result.as_ref()).ok(),
            _ => None,
        }
    }
}

pub type AppResult<T> = Result<T, AppError>;
