//! Error types for TideSync domain types.

use thiserror::Error;

/// Result type for type-level operations.
pub type TypeResult<T> = Result<T, TypeError>;

/// Errors raised while interpreting items, timestamps, or config rows.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TypeError {
    /// A timestamp string could not be parsed as ISO-8601 UTC.
    #[error("invalid timestamp {value:?}: {message}")]
    InvalidTimestamp {
        /// The offending input.
        value: String,
        /// Parser diagnostic.
        message: String,
    },

    /// An item is missing its string `id` field.
    #[error("item has no string id")]
    MissingItemId,

    /// A JSON value that must be an object was something else.
    #[error("expected a JSON object, got {0}")]
    NotAnObject(&'static str),

    /// A config-table row is structurally invalid.
    #[error("invalid config row: {0}")]
    InvalidConfigValue(String),

    /// A stored record (such as an operation row) is structurally invalid.
    #[error("invalid stored record: {0}")]
    InvalidRecord(String),
}

impl TypeError {
    /// Creates an invalid timestamp error.
    pub fn invalid_timestamp(value: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidTimestamp {
            value: value.into(),
            message: message.into(),
        }
    }

    /// Creates an invalid config row error.
    pub fn invalid_config_value(message: impl Into<String>) -> Self {
        Self::InvalidConfigValue(message.into())
    }

    /// Creates an invalid stored record error.
    pub fn invalid_record(message: impl Into<String>) -> Self {
        Self::InvalidRecord(message.into())
    }
}
