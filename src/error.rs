//! Custom error types for lead qualification

use thiserror::Error;
use uuid::Uuid;

/// Main error type for qualification pipeline operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Knowledge store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Embedding provider unavailable: {0}")]
    EmbeddingUnavailable(String),

    #[error("Embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Completion failed: {0}")]
    CompletionFailed(String),

    #[error("Field '{field}' rejected: {reason}")]
    SchemaValidation { field: String, reason: String },

    #[error("Lead {0} is busy with another merge")]
    ConcurrentMergeConflict(Uuid),

    #[error("Lead not found: {0}")]
    LeadNotFound(String),

    #[error("Message not found: {0}")]
    MessageNotFound(String),

    #[error("Custom field not found: {0}")]
    FieldNotFound(String),

    #[error("Invalid field name '{0}': must match ^[a-z][a-z0-9_]*$")]
    InvalidFieldName(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Background task failed: {0}")]
    Task(String),

    #[error("Unsupported content type: {0}")]
    UnsupportedContentType(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Not initialized: run 'leadq init' first")]
    NotInitialized,

    #[error("Already initialized at {0}")]
    AlreadyInitialized(String),
}

impl Error {
    /// Errors that silently corrupt future retrieval if ignored and must reach an operator.
    pub fn is_config_alert(&self) -> bool {
        matches!(self, Error::DimensionMismatch { .. })
    }

    /// Short machine-readable kind, used in turn records and traces.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Config(_) => "config",
            Error::Database(_) => "database",
            Error::StoreUnavailable(_) => "store_unavailable",
            Error::EmbeddingUnavailable(_) => "embedding_unavailable",
            Error::DimensionMismatch { .. } => "dimension_mismatch",
            Error::CompletionFailed(_) => "completion_failed",
            Error::SchemaValidation { .. } => "schema_validation",
            Error::ConcurrentMergeConflict(_) => "concurrent_merge_conflict",
            Error::LeadNotFound(_) => "lead_not_found",
            Error::MessageNotFound(_) => "message_not_found",
            Error::FieldNotFound(_) => "field_not_found",
            Error::InvalidFieldName(_) => "invalid_field_name",
            Error::InvalidInput(_) => "invalid_input",
            Error::Forbidden(_) => "forbidden",
            Error::Task(_) => "task",
            Error::UnsupportedContentType(_) => "unsupported_content_type",
            Error::Io(_) => "io",
            Error::Http(_) => "http",
            Error::UrlParse(_) => "url_parse",
            Error::Json(_) => "json",
            Error::TomlParse(_) => "toml_parse",
            Error::TomlSerialize(_) => "toml_serialize",
            Error::NotInitialized => "not_initialized",
            Error::AlreadyInitialized(_) => "already_initialized",
        }
    }
}

/// Result type alias for the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Qdrant failures mean the backing index cannot be reached or used
impl From<qdrant_client::QdrantError> for Error {
    fn from(err: qdrant_client::QdrantError) -> Self {
        Error::StoreUnavailable(err.to_string())
    }
}

/// Failure of a single call to a remote provider, classified for retry.
#[derive(Debug, Clone)]
pub struct CallError {
    pub retryable: bool,
    pub message: String,
}

impl CallError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            retryable: true,
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            retryable: false,
            message: message.into(),
        }
    }

    /// Classify a reqwest error: timeouts and connection problems are worth retrying
    pub fn from_reqwest(err: &reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return Self::from_status(status.as_u16(), err.to_string());
        }
        if err.is_timeout() || err.is_connect() || err.is_request() {
            Self::transient(err.to_string())
        } else {
            Self::fatal(err.to_string())
        }
    }

    /// HTTP 429 and 5xx are transient, other 4xx are not
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        if status == 429 || status >= 500 {
            Self::transient(message)
        } else {
            Self::fatal(message)
        }
    }
}

impl std::fmt::Display for CallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(CallError::from_status(429, "slow down").retryable);
        assert!(CallError::from_status(503, "unavailable").retryable);
        assert!(!CallError::from_status(401, "bad key").retryable);
        assert!(!CallError::from_status(400, "bad request").retryable);
    }

    #[test]
    fn test_only_dimension_mismatch_is_alert() {
        let mismatch = Error::DimensionMismatch {
            expected: 1536,
            actual: 768,
        };
        assert!(mismatch.is_config_alert());
        assert_eq!(mismatch.kind(), "dimension_mismatch");
        assert!(!Error::CompletionFailed("timeout".into()).is_config_alert());
        assert!(!Error::StoreUnavailable("down".into()).is_config_alert());
    }
}
