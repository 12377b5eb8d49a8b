use crate::services::ServiceError;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for ragfuse
#[derive(Error, Debug)]
pub enum RagError {
    /// Configuration related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration validation errors
    #[error("Configuration validation failed: {errors:?}")]
    ConfigValidation { errors: Vec<ValidationError> },

    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: PathBuf },

    /// Invalid configuration value
    #[error("Invalid configuration value at {path}: {message}")]
    InvalidConfigValue { path: String, message: String },

    /// Index identifier rejected before any backend call
    #[error("Invalid index identifier '{index_id}': {reason}")]
    InvalidIndexId { index_id: String, reason: String },

    /// A backend reported that the target index does not exist
    #[error("Index not found: {index_id}")]
    UnknownIndex { index_id: String },

    /// A required request parameter is absent
    #[error("Missing required parameter: {0}")]
    MissingParameter(String),

    /// Every (variant, mode) retrieval path failed
    #[error("All {attempted} retrieval paths failed: {failures:?}")]
    TotalFailure {
        attempted: usize,
        failures: Vec<String>,
    },

    /// The request was cancelled by its caller
    #[error("Request cancelled")]
    Cancelled,

    /// External service errors that escaped local degradation
    #[error("Service error: {0}")]
    Service(#[from] ServiceError),

    /// Local index backend errors
    #[error("Index error: {0}")]
    Index(String),

    /// IO errors
    #[error("IO error: {context}: {source}")]
    Io {
        source: std::io::Error,
        context: String,
    },

    /// TOML deserialization errors
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// TOML serialization errors
    #[error("TOML serialization error: {0}")]
    TomlSerialization(#[from] toml::ser::Error),

    /// JSON errors
    #[error("JSON error: {context}: {source}")]
    Json {
        source: serde_json::Error,
        context: String,
    },

    /// Database errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Generic errors
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RagError {
    /// Errors that are fatal at request time and must never be retried.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            RagError::Config(_)
                | RagError::ConfigValidation { .. }
                | RagError::ConfigNotFound { .. }
                | RagError::InvalidConfigValue { .. }
                | RagError::InvalidIndexId { .. }
                | RagError::UnknownIndex { .. }
                | RagError::MissingParameter(_)
        )
    }
}

/// Configuration validation error
#[derive(Debug, Clone)]
pub struct ValidationError {
    /// Path to the configuration key that failed validation
    pub path: String,
    /// Error message describing the validation failure
    pub message: String,
}

impl ValidationError {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Result type for ragfuse operations
pub type Result<T> = std::result::Result<T, RagError>;
