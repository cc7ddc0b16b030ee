//! Mapping of backend failures onto the normalized [`ErrorCode`] taxonomy.
//!
//! Missing or unusable credentials, unreachable endpoints and malformed
//! requests all collapse to `GenericException`. The backends cannot tell
//! these apart reliably (a missing token and a refused connection look the
//! same to the caller), so neither does this module. A 401 is treated the
//! same way; only 403 is reported as `AccessDenied`.

use reqwest::StatusCode;
use std::io;

use stowage_common::{ErrorCode, StorageError};

/// Normalized code for an HTTP status returned by a backend.
pub fn classify_status(status: StatusCode) -> ErrorCode {
    match status {
        StatusCode::NOT_FOUND => ErrorCode::NotFound,
        StatusCode::FORBIDDEN => ErrorCode::AccessDenied,
        _ => ErrorCode::GenericException,
    }
}

/// Error for a non-success HTTP response.
pub fn from_status(status: StatusCode, context: &str, body: &str) -> StorageError {
    let body = body.trim();
    let message = if body.is_empty() {
        format!("{}: {}", context, status)
    } else {
        format!("{}: {} - {}", context, status, body)
    };
    StorageError::new(classify_status(status), message)
}

/// Error for a request that never produced a usable response.
pub fn from_transport(err: reqwest::Error, context: &str) -> StorageError {
    if let Some(status) = err.status() {
        return from_status(status, context, "");
    }
    StorageError::generic(format!("{}: {}", context, err))
}

/// Error for a local I/O failure.
pub fn from_io(err: io::Error) -> StorageError {
    match err.kind() {
        io::ErrorKind::NotFound => StorageError::not_found(err.to_string()),
        io::ErrorKind::PermissionDenied => StorageError::access_denied(err.to_string()),
        _ => StorageError::generic(err.to_string()),
    }
}

/// Error for a provider configured without credentials.
pub fn missing_credentials(field: &str) -> StorageError {
    StorageError::generic(format!("Provider credentials are not configured: {} is missing", field))
}

/// Error for malformed configuration or response data.
pub fn from_json(err: serde_json::Error, context: &str) -> StorageError {
    StorageError::generic(format!("{}: {}", context, err))
}

/// Convert a [`StorageError`] back into an I/O error for stream adapters.
pub fn into_io(err: StorageError) -> io::Error {
    let kind = match err.code() {
        ErrorCode::NotFound => io::ErrorKind::NotFound,
        ErrorCode::AccessDenied => io::ErrorKind::PermissionDenied,
        ErrorCode::GenericException => io::ErrorKind::Other,
    };
    io::Error::new(kind, err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_status() {
        assert_eq!(classify_status(StatusCode::NOT_FOUND), ErrorCode::NotFound);
        assert_eq!(classify_status(StatusCode::FORBIDDEN), ErrorCode::AccessDenied);
        assert_eq!(
            classify_status(StatusCode::UNAUTHORIZED),
            ErrorCode::GenericException
        );
        assert_eq!(
            classify_status(StatusCode::BAD_REQUEST),
            ErrorCode::GenericException
        );
        assert_eq!(
            classify_status(StatusCode::INTERNAL_SERVER_ERROR),
            ErrorCode::GenericException
        );
    }

    #[test]
    fn test_from_status_message() {
        let err = from_status(StatusCode::FORBIDDEN, "Get object", "{\"error\":\"denied\"}");
        assert_eq!(err.code(), ErrorCode::AccessDenied);
        assert!(err.message().contains("Get object"));
        assert!(err.message().contains("denied"));

        let err = from_status(StatusCode::NOT_FOUND, "Delete object", "  ");
        assert_eq!(err.message(), "Delete object: 404 Not Found");
    }

    #[test]
    fn test_from_io() {
        let not_found = from_io(io::Error::new(io::ErrorKind::NotFound, "gone"));
        assert_eq!(not_found.code(), ErrorCode::NotFound);

        let denied = from_io(io::Error::new(io::ErrorKind::PermissionDenied, "nope"));
        assert_eq!(denied.code(), ErrorCode::AccessDenied);

        let other = from_io(io::Error::new(io::ErrorKind::UnexpectedEof, "short"));
        assert_eq!(other.code(), ErrorCode::GenericException);
    }

    #[test]
    fn test_io_round_trip_keeps_kind() {
        let io_err = into_io(StorageError::not_found("x"));
        assert_eq!(io_err.kind(), io::ErrorKind::NotFound);
        assert_eq!(from_io(io_err).code(), ErrorCode::NotFound);
    }

    #[test]
    fn test_missing_credentials_is_generic() {
        let err = missing_credentials("email");
        assert_eq!(err.code(), ErrorCode::GenericException);
        assert!(err.message().contains("email"));
    }
}
