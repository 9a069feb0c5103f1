//! Error types for silodb core.

use std::io;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in silodb core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Identifier fails the alphanumeric rule.
    #[error("invalid name {name:?}: identifiers may contain only letters and digits")]
    NameInvalid {
        /// The offending identifier.
        name: String,
    },

    /// Referenced database, table, row or column is absent.
    #[error("not found: {what}")]
    NotFound {
        /// What was looked up.
        what: String,
    },

    /// Create target already exists.
    ///
    /// Create paths normally report this as `Ok(false)` instead; the variant
    /// exists for callers that need a hard failure.
    #[error("already exists: {what}")]
    AlreadyExists {
        /// What already exists.
        what: String,
    },

    /// Value fails a type, required or enum check.
    #[error("schema violation: {message}")]
    SchemaViolation {
        /// Description of the violation.
        message: String,
    },

    /// Operation on encrypted data without a KEK.
    #[error("KEK required: {message}")]
    KekRequired {
        /// Description of the operation that needed a key.
        message: String,
    },

    /// KEK does not unwrap the DEK, or ciphertext authentication failed.
    #[error("crypto failed: {message}")]
    CryptoFailed {
        /// Description of the failure.
        message: String,
    },

    /// I/O error from the filesystem.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization or parsing error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Query builder misuse: missing source table, bad order, bad limit.
    #[error("malformed query: {message}")]
    QueryMalformed {
        /// Description of the problem.
        message: String,
    },

    /// Invariant violated (should be unreachable).
    #[error("internal error: {message}")]
    Internal {
        /// Description of the violated invariant.
        message: String,
    },
}

impl CoreError {
    /// Creates a name invalid error.
    pub fn name_invalid(name: impl Into<String>) -> Self {
        Self::NameInvalid { name: name.into() }
    }

    /// Creates a not found error.
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    /// Creates an already exists error.
    pub fn already_exists(what: impl Into<String>) -> Self {
        Self::AlreadyExists { what: what.into() }
    }

    /// Creates a schema violation error.
    pub fn schema_violation(message: impl Into<String>) -> Self {
        Self::SchemaViolation {
            message: message.into(),
        }
    }

    /// Creates a KEK required error.
    pub fn kek_required(message: impl Into<String>) -> Self {
        Self::KekRequired {
            message: message.into(),
        }
    }

    /// Creates a crypto failed error.
    pub fn crypto_failed(message: impl Into<String>) -> Self {
        Self::CryptoFailed {
            message: message.into(),
        }
    }

    /// Creates a malformed query error.
    pub fn query_malformed(message: impl Into<String>) -> Self {
        Self::QueryMalformed {
            message: message.into(),
        }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

impl From<zip::result::ZipError> for CoreError {
    fn from(err: zip::result::ZipError) -> Self {
        Self::Io(io::Error::other(err))
    }
}
