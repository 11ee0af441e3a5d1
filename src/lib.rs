// Allow complex types where needed for fault injection hooks and shared sinks
#![allow(clippy::type_complexity)]

pub mod config;
pub mod error;
pub mod hash_file;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod storage;

// Re-export the main entry points for convenience
pub use config::SyncConfig;
pub use error::{
    ErrorClassifier, ErrorContext, ErrorType, PartialSyncRecovery, RecoveryAction,
    RecoveryCoordinator, RecoveryState, RetryConfig, RetryHandler,
};
pub use hash_file::{load_hash_file, HashFileManager, HashFileSource};
pub use metrics::{InMemoryMetrics, MetricsSink, TracingMetrics};
pub use models::{BottleInfo, BottleStatus, Formula, HashEntry};
pub use storage::{FsObjectStore, MemoryObjectStore, ObjectStore, StorageService};

use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

// Global flag for handling Ctrl+C interrupts
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Set the interrupt flag (called by signal handler)
pub fn set_interrupted() {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

/// Check if an interrupt has been received
pub fn is_interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

/// Reset the interrupt flag (primarily for testing)
pub fn reset_interrupted() {
    INTERRUPTED.store(false, Ordering::SeqCst);
}

/// Errors raised by storage, transport and ledger operations.
///
/// The variants mirror the failure families the classifier and the retry
/// engine reason about, so every failure can be mapped to an [`ErrorType`].
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Storage error ({code}): {message}")]
    Storage { code: String, message: String },

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid JSON: {0}")]
    Json(String),

    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

impl SyncError {
    /// Build a storage error carrying a provider error code
    pub fn storage(code: impl Into<String>, message: impl Into<String>) -> Self {
        SyncError::Storage {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Provider error code, if this is a storage error
    pub fn storage_code(&self) -> Option<&str> {
        match self {
            SyncError::Storage { code, .. } => Some(code.as_str()),
            _ => None,
        }
    }

    /// Variant name, recorded in error context metadata
    pub fn variant_name(&self) -> &'static str {
        match self {
            SyncError::Connection(_) => "Connection",
            SyncError::Timeout(_) => "Timeout",
            SyncError::Storage { .. } => "Storage",
            SyncError::Validation(_) => "Validation",
            SyncError::MissingField(_) => "MissingField",
            SyncError::PermissionDenied(_) => "PermissionDenied",
            SyncError::Io(_) => "Io",
            SyncError::Json(_) => "Json",
            SyncError::Http(_) => "Http",
            SyncError::Config(_) => "Config",
            SyncError::Cancelled => "Cancelled",
            SyncError::Other(_) => "Other",
        }
    }
}

// Manual Clone implementation because std::io::Error doesn't implement Clone
impl Clone for SyncError {
    fn clone(&self) -> Self {
        match self {
            SyncError::Connection(s) => SyncError::Connection(s.clone()),
            SyncError::Timeout(s) => SyncError::Timeout(s.clone()),
            SyncError::Storage { code, message } => SyncError::Storage {
                code: code.clone(),
                message: message.clone(),
            },
            SyncError::Validation(s) => SyncError::Validation(s.clone()),
            SyncError::MissingField(s) => SyncError::MissingField(s.clone()),
            SyncError::PermissionDenied(s) => SyncError::PermissionDenied(s.clone()),
            SyncError::Io(e) => SyncError::Io(std::io::Error::new(e.kind(), e.to_string())),
            SyncError::Json(s) => SyncError::Json(s.clone()),
            SyncError::Http(s) => SyncError::Http(s.clone()),
            SyncError::Config(s) => SyncError::Config(s.clone()),
            SyncError::Cancelled => SyncError::Cancelled,
            SyncError::Other(s) => SyncError::Other(s.clone()),
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Json(err.to_string())
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            SyncError::Timeout(err.to_string())
        } else if err.is_connect() {
            SyncError::Connection(err.to_string())
        } else if err.is_decode() {
            SyncError::Json(err.to_string())
        } else {
            SyncError::Http(err.to_string())
        }
    }
}

impl From<::config::ConfigError> for SyncError {
    fn from(err: ::config::ConfigError) -> Self {
        SyncError::Config(err.to_string())
    }
}

impl From<anyhow::Error> for SyncError {
    fn from(err: anyhow::Error) -> Self {
        SyncError::Other(format!("{:#}", err))
    }
}

pub type SyncResult<T> = Result<T, SyncError>;

#[cfg(test)]
mod lib_tests;
