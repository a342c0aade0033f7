//! Framework-wide error types
//!
//! `FrameworkError` covers infrastructure failures (database, queue, pub/sub
//! transport). Business outcomes such as conflicts are modelled by the
//! sequence module's own error type; both map onto HTTP responses through
//! [`HttpError`].

use std::collections::HashMap;
use thiserror::Error;

/// Trait for errors that can be converted to HTTP responses
pub trait HttpError: std::error::Error + Send + Sync + 'static {
    /// HTTP status code (default: 500)
    fn status_code(&self) -> u16 {
        500
    }

    /// Short machine-readable kind for the JSON body
    fn error_kind(&self) -> &'static str {
        "internal"
    }

    /// Error message for HTTP response (default: error's Display)
    fn error_message(&self) -> String {
        self.to_string()
    }
}

/// Field-level validation errors
///
/// ```json
/// {
///     "error": "validation",
///     "message": "The given data was invalid.",
///     "errors": { "client_id": ["client_id must be a positive id"] }
/// }
/// ```
#[derive(Debug, Clone, Default)]
pub struct ValidationErrors {
    /// Map of field names to their validation error messages
    pub errors: HashMap<String, Vec<String>>,
}

impl ValidationErrors {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an error for a specific field
    pub fn add(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors
            .entry(field.into())
            .or_default()
            .push(message.into());
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Convert from validator crate's ValidationErrors
    pub fn from_validator(errors: validator::ValidationErrors) -> Self {
        let mut result = Self::new();
        for (field, field_errors) in errors.field_errors() {
            for error in field_errors {
                let message = error
                    .message
                    .as_ref()
                    .map(|m| m.to_string())
                    .unwrap_or_else(|| format!("Validation failed for field '{}'", field));
                result.add(field.to_string(), message);
            }
        }
        result
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "error": "validation",
            "message": "The given data was invalid.",
            "errors": self.errors
        })
    }
}

impl std::fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Validation failed: {:?}", self.errors)
    }
}

impl std::error::Error for ValidationErrors {}

/// Infrastructure error type
///
/// Everything here is something a caller cannot fix by changing its input.
/// Queue jobs that fail with a transient variant are retried under the
/// queue's attempt/backoff policy.
#[derive(Debug, Clone, Error)]
pub enum FrameworkError {
    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// Job queue bookkeeping failed
    #[error("Queue error: {0}")]
    Queue(String),

    /// Pub/sub transport failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// An outbound message could not be delivered
    #[error("Delivery failed: {0}")]
    Delivery(String),

    /// Operator or caller supplied a value out of range
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Generic internal error
    #[error("Internal server error: {message}")]
    Internal {
        /// The error message
        message: String,
    },
}

impl FrameworkError {
    pub fn database(message: impl Into<String>) -> Self {
        Self::Database(message.into())
    }

    pub fn queue(message: impl Into<String>) -> Self {
        Self::Queue(message.into())
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    pub fn delivery(message: impl Into<String>) -> Self {
        Self::Delivery(message.into())
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether retrying the same operation later may succeed
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::Internal { .. } | Self::InvalidInput(_))
    }
}

impl HttpError for FrameworkError {
    fn status_code(&self) -> u16 {
        match self {
            Self::Transport(_) | Self::Delivery(_) => 502,
            Self::Database(_) | Self::Queue(_) => 503,
            Self::InvalidInput(_) => 422,
            Self::Internal { .. } => 500,
        }
    }

    fn error_kind(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "validation",
            _ => "infrastructure",
        }
    }
}

impl From<sea_orm::DbErr> for FrameworkError {
    fn from(e: sea_orm::DbErr) -> Self {
        Self::Database(e.to_string())
    }
}

impl From<redis::RedisError> for FrameworkError {
    fn from(e: redis::RedisError) -> Self {
        Self::Transport(e.to_string())
    }
}

impl From<serde_json::Error> for FrameworkError {
    fn from(e: serde_json::Error) -> Self {
        Self::internal(format!("JSON error: {}", e))
    }
}
