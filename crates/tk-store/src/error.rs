// error.rs — Error types for the task state store.

use thiserror::Error;

/// Errors that can occur during store, lifecycle, and persistence operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Malformed input (e.g. a task without a title).
    #[error("validation error: {0}")]
    Validation(String),

    /// The status change is not permitted by the lifecycle table.
    #[error("invalid transition from {from} to {to} for task {task_id}")]
    InvalidTransition { task_id: u64, from: String, to: String },

    /// The requested task was not found.
    #[error("task not found: {0}")]
    NotFound(u64),

    /// A status string outside the fixed status set.
    #[error("unknown status: {0}")]
    UnknownStatus(String),

    /// A file I/O operation failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    /// The persisted file exists but could not be parsed.
    #[error("corrupt task file at {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },

    /// Failed to serialize store data.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The store config file could not be read.
    #[error("config error at {path}: {message}")]
    Config { path: String, message: String },
}

impl StoreError {
    pub(crate) fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.display().to_string(),
            source,
        }
    }
}
