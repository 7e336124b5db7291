//! Error types for tessera

use tessera_validation::ValidationErrors;
use thiserror::Error;

/// Result type alias for tessera operations
pub type Result<T> = std::result::Result<T, TesseraError>;

/// Unified error type for all tessera operations
#[derive(Error, Debug, Clone)]
pub enum TesseraError {
    #[error("MongoDB error: {0}")]
    MongoDB(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Connection error: {0}")]
    Connection(String),

    /// Misuse detected before any I/O: model registered with a bad schema,
    /// model used before its connection exists, and similar.
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Query error: {0}")]
    Query(String),

    /// Schema validation failure with per-path detail
    #[error("Validation error: {0}")]
    Validation(ValidationErrors),

    /// An "or fail" operation matched nothing
    #[error("Not found: {0}")]
    NotFound(String),

    /// A session or relation crossed connection boundaries
    #[error("Cross-connection error: {0}")]
    CrossConnection(String),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Cache error: {0}")]
    Cache(String),

    /// Transient error that may succeed on retry
    #[error("Transient error: {0}")]
    Transient(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TesseraError {
    /// Returns true if this error is potentially retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, TesseraError::Transient(_))
    }

    /// Returns true if this error came from schema validation
    pub fn is_validation(&self) -> bool {
        matches!(self, TesseraError::Validation(_))
    }

    /// Per-path validation detail, if this is a validation error
    pub fn validation_errors(&self) -> Option<&ValidationErrors> {
        match self {
            TesseraError::Validation(errors) => Some(errors),
            _ => None,
        }
    }
}

impl From<ValidationErrors> for TesseraError {
    fn from(errors: ValidationErrors) -> Self {
        TesseraError::Validation(errors)
    }
}

impl From<serde_json::Error> for TesseraError {
    fn from(err: serde_json::Error) -> Self {
        TesseraError::Serialization(err.to_string())
    }
}

// MongoDB-specific error conversions (when mongodb-errors feature is enabled)
#[cfg(feature = "mongodb-errors")]
impl From<mongodb::error::Error> for TesseraError {
    fn from(err: mongodb::error::Error) -> Self {
        if err.contains_label(mongodb::error::TRANSIENT_TRANSACTION_ERROR) {
            return TesseraError::Transient(err.to_string());
        }
        TesseraError::MongoDB(err.to_string())
    }
}

#[cfg(feature = "mongodb-errors")]
impl From<bson::ser::Error> for TesseraError {
    fn from(err: bson::ser::Error) -> Self {
        TesseraError::Serialization(format!("BSON serialization error: {}", err))
    }
}

#[cfg(feature = "mongodb-errors")]
impl From<bson::de::Error> for TesseraError {
    fn from(err: bson::de::Error) -> Self {
        TesseraError::Deserialization(format!("BSON deserialization error: {}", err))
    }
}
