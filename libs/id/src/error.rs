//! Error types for ID parsing and validation.

use thiserror::Error;

/// Errors that can occur when parsing or validating IDs and labels.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// The ID string is empty.
    #[error("ID cannot be empty")]
    Empty,

    /// The ID has an invalid prefix.
    #[error("invalid ID prefix: expected '{expected}', got '{actual}'")]
    InvalidPrefix {
        expected: &'static str,
        actual: String,
    },

    /// The ID is missing the underscore separator.
    #[error("ID missing underscore separator")]
    MissingSeparator,

    /// The ULID portion of the ID is invalid.
    #[error("invalid ULID: {0}")]
    InvalidUlid(String),

    /// A label has the wrong length or contains characters outside the alphabet.
    #[error("invalid label '{label}': {reason}")]
    InvalidLabel { label: String, reason: &'static str },

    /// A numeric id could not be parsed.
    #[error("invalid numeric ID: {0}")]
    InvalidNumber(String),
}

impl IdError {
    /// Returns true if this error indicates the input was empty.
    pub fn is_empty(&self) -> bool {
        matches!(self, IdError::Empty)
    }

    /// Returns true if this error indicates a malformed label.
    pub fn is_label_error(&self) -> bool {
        matches!(self, IdError::InvalidLabel { .. })
    }
}
