//! Normalized error taxonomy shared by every storage backend.

use std::fmt;

use thiserror::Error;

/// Provider-agnostic failure category.
///
/// The integer values are stable and are what callers compare against
/// when they only have the numeric code (see [`StorageError::error_code`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    /// The requested blob does not exist.
    NotFound = 1,
    /// Invalid or missing credentials, unreachable endpoint, malformed
    /// request, or any backend failure not otherwise classified.
    ///
    /// Credential problems are not reported separately: the backends do not
    /// reliably tell them apart from transport or endpoint failures.
    GenericException = 2,
    /// The caller is authenticated but not authorized for the operation.
    AccessDenied = 3,
}

impl ErrorCode {
    /// Integer form of the code.
    pub fn as_i32(self) -> i32 {
        self as i32
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCode::NotFound => "NotFound",
            ErrorCode::GenericException => "GenericException",
            ErrorCode::AccessDenied => "AccessDenied",
        };
        f.write_str(name)
    }
}

/// The single error type crossing the storage interface boundary.
#[derive(Debug, Clone, Error)]
#[error("{code}: {message}")]
pub struct StorageError {
    code: ErrorCode,
    message: String,
}

impl StorageError {
    /// Create an error with an explicit code.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Blob not found.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    /// Generic failure, including credential and endpoint problems.
    pub fn generic(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::GenericException, message)
    }

    /// Authenticated but not permitted.
    pub fn access_denied(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::AccessDenied, message)
    }

    /// Normalized failure category.
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// Integer form of [`StorageError::code`].
    pub fn error_code(&self) -> i32 {
        self.code.as_i32()
    }

    /// Diagnostic message from the point of failure.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Check whether this error carries the given code.
    pub fn is(&self, code: ErrorCode) -> bool {
        self.code == code
    }
}

/// Result type alias using [`StorageError`].
pub type Result<T> = std::result::Result<T, StorageError>;
