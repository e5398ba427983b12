//! Error types for rulebook-memory

use thiserror::Error;

/// Result type alias for rulebook-memory operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in rulebook-memory
#[derive(Error, Debug)]
pub enum Error {
    #[error("Memory is not enabled for this project (set memory.enabled in .rulebook/config.json)")]
    Disabled,

    #[error("Invalid {field}: {message}")]
    Validation {
        field: &'static str,
        message: String,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Vector index error: {0}")]
    VectorIndex(String),

    #[error("Vector index serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error(
        "Cannot reclaim space: usage {usage_bytes} bytes exceeds max {max_bytes} bytes \
         after evicting {evicted} records ({freed_bytes} bytes); remaining records are protected"
    )]
    CannotReclaim {
        evicted: usize,
        freed_bytes: u64,
        usage_bytes: u64,
        max_bytes: u64,
    },

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Coarse classification of an [`Error`], used by transports to pick a status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Disabled,
    Validation,
    NotFound,
    Storage,
    ResourceExhausted,
    Config,
}

impl Error {
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::StorageUnavailable(msg.into())
    }

    pub fn vector_index(msg: impl Into<String>) -> Self {
        Self::VectorIndex(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn validation(field: &'static str, message: impl Into<String>) -> Self {
        Self::Validation {
            field,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Disabled => ErrorKind::Disabled,
            Error::Validation { .. } => ErrorKind::Validation,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::StorageUnavailable(_)
            | Error::Sqlite(_)
            | Error::Json(_)
            | Error::Io(_)
            | Error::VectorIndex(_)
            | Error::Serialization(_) => ErrorKind::Storage,
            Error::CannotReclaim { .. } => ErrorKind::ResourceExhausted,
            Error::Config(_) => ErrorKind::Config,
        }
    }
}
