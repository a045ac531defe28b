//! Error types for flowrun.
//!
//! Every error maps onto one of a small set of caller-facing kinds so the
//! RPC layer can pick a status code without inspecting messages.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for flowrun operations.
pub type Result<T> = std::result::Result<T, Error>;

/// flowrun error types.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Transient storage error: {0}")]
    TransientStorage(String),

    #[error("Node failure: {0}")]
    NodeFailure(String),

    #[error("Canceled: {0}")]
    Cancelled(String),

    #[error("Node error: {0}")]
    Node(String),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Caller-facing error kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidInput,
    NotFound,
    Unauthorized,
    TransientStorage,
    NodeFailure,
    Cancelled,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::TransientStorage => "transient_storage",
            ErrorKind::NodeFailure => "node_failure",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Error {
    /// Shorthand for the cancellation sentinel.
    pub fn cancelled(reason: impl Into<String>) -> Self {
        Error::Cancelled(reason.into())
    }

    /// Get the error code for machine parsing.
    pub fn code(&self) -> &'static str {
        match self {
            Error::InvalidInput(_) => "INVALID_INPUT",
            Error::NotFound(_) => "NOT_FOUND",
            Error::Unauthorized(_) => "UNAUTHORIZED",
            Error::TransientStorage(_) => "TRANSIENT_STORAGE",
            Error::NodeFailure(_) => "NODE_FAILURE",
            Error::Cancelled(_) => "CANCELLED",
            Error::Node(_) => "NODE_ERROR",
            Error::Execution(_) => "EXECUTION_ERROR",
            Error::Storage(_) => "STORAGE_ERROR",
            Error::Config(_) => "CONFIG_ERROR",
            Error::Transport(_) => "TRANSPORT_ERROR",
            Error::Internal(_) => "INTERNAL_ERROR",
            Error::Http(_) => "HTTP_ERROR",
            Error::Database(_) => "DATABASE_ERROR",
            Error::Yaml(_) => "YAML_ERROR",
            Error::Json(_) => "JSON_ERROR",
            Error::Io(_) => "IO_ERROR",
        }
    }

    /// Map the error onto its caller-facing kind.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidInput(_) | Error::Yaml(_) | Error::Json(_) => ErrorKind::InvalidInput,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Unauthorized(_) => ErrorKind::Unauthorized,
            Error::TransientStorage(_) => ErrorKind::TransientStorage,
            Error::NodeFailure(_) | Error::Node(_) | Error::Execution(_) | Error::Http(_) => {
                ErrorKind::NodeFailure
            }
            Error::Cancelled(_) => ErrorKind::Cancelled,
            Error::Database(_) | Error::Storage(_) if self.is_transient_lock() => {
                ErrorKind::TransientStorage
            }
            Error::Storage(_)
            | Error::Database(_)
            | Error::Config(_)
            | Error::Transport(_)
            | Error::Internal(_)
            | Error::Io(_) => ErrorKind::Internal,
        }
    }

    /// Whether this error is the cancellation sentinel.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::Cancelled(_))
    }

    /// Whether this error belongs to the transient lock-contention taxonomy.
    ///
    /// SQLite reports contention as "database is locked" / "database table is
    /// locked" / "busy"; anything else is surfaced without retry.
    pub fn is_transient_lock(&self) -> bool {
        if let Error::Database(rusqlite::Error::SqliteFailure(e, _)) = self {
            if matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ) {
                return true;
            }
        }
        let message = self.to_string().to_lowercase();
        message.contains("locked") || message.contains("busy")
    }

    /// Get a sanitized error message safe for external consumers.
    pub fn external_message(&self) -> String {
        match self {
            Error::InvalidInput(msg) => format!("Invalid input: {}", msg),
            Error::NotFound(msg) => format!("Not found: {}", msg),
            Error::Unauthorized(_) => "Access denied".to_string(),
            Error::NodeFailure(msg) | Error::Node(msg) | Error::Execution(msg) => msg.clone(),
            Error::Cancelled(msg) => msg.clone(),
            Error::Config(msg) => format!("Configuration error: {}", msg),

            Error::TransientStorage(_) => "Storage is busy, retry the run".to_string(),
            Error::Storage(_) | Error::Database(_) => "A storage error occurred".to_string(),
            Error::Internal(_) | Error::Transport(_) => "An internal error occurred".to_string(),
            Error::Io(_) => "An I/O error occurred".to_string(),

            Error::Http(e) => {
                if let Some(status) = e.status() {
                    format!("HTTP request failed with status {}", status.as_u16())
                } else if e.is_timeout() {
                    "HTTP request timed out".to_string()
                } else if e.is_connect() {
                    "Failed to connect to remote server".to_string()
                } else {
                    "HTTP request failed".to_string()
                }
            }

            Error::Yaml(_) => "Invalid YAML format".to_string(),
            Error::Json(_) => "Invalid JSON format".to_string(),
        }
    }

    /// Convert to a JSON error body (includes full error details).
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "error": {
                "code": self.code(),
                "kind": self.kind().as_str(),
                "message": self.to_string(),
            }
        })
    }
}
