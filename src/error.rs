//! Error types for the image relay

use thiserror::Error;

/// Result type alias for relay operations
pub type Result<T> = std::result::Result<T, RelayError>;

/// Error types that can occur while serving an image
#[derive(Error, Debug, Clone)]
pub enum RelayError {
    #[error("Signature mismatch")]
    Unauthorized,

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Processing failed: {0}")]
    ProcessFailed(String),

    #[error("Backend write failed: {0}")]
    BackendWrite(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(String),

    #[error("HTTP error: {0}")]
    HttpError(String),

    #[error("Origin server returned 4xx error: {status} - {message}")]
    OriginClientError { status: u16, message: String },

    #[error("Origin server returned 5xx error: {status} - {message}")]
    OriginServerError { status: u16, message: String },

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl From<std::io::Error> for RelayError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => RelayError::NotFound(err.to_string()),
            _ => RelayError::IoError(err.to_string()),
        }
    }
}

impl RelayError {
    /// Whether this error means "this backend does not have the resource".
    ///
    /// Loaders failing with a not-found error are skipped in favour of the next
    /// registered loader. Any other error stops the loading stage.
    pub fn is_not_found(&self) -> bool {
        match self {
            RelayError::NotFound(_) => true,
            RelayError::OriginClientError { status, .. } => *status == 404 || *status == 410,
            _ => false,
        }
    }

    /// Whether a loader should retry the operation that produced this error
    ///
    /// Transient origin failures (5xx, network, IO, timeouts) are retried;
    /// client errors and not-found are final.
    pub fn should_retry(&self) -> bool {
        match self {
            RelayError::OriginServerError { .. } => true,
            RelayError::HttpError(_) => true,
            RelayError::IoError(_) => true,
            RelayError::Timeout(_) => true,

            RelayError::OriginClientError { .. } => false,
            RelayError::NotFound(_) => false,
            RelayError::Unauthorized => false,
            RelayError::ProcessFailed(_) => false,
            RelayError::BackendWrite(_) => false,
            RelayError::InvalidRequest(_) => false,
            RelayError::ConfigError(_) => false,
            RelayError::InternalError(_) => false,
        }
    }

    /// Convert error to HTTP status code
    pub fn to_http_status(&self) -> u16 {
        match self {
            RelayError::Unauthorized => 403,
            RelayError::NotFound(_) => 404,
            RelayError::Timeout(_) => 504,
            RelayError::ProcessFailed(_) => 422,
            RelayError::InvalidRequest(_) => 400,

            // Pass through client errors from origin, 404/410 included
            RelayError::OriginClientError { status, .. } => *status,
            RelayError::OriginServerError { .. } => 502,
            RelayError::HttpError(_) => 502,

            RelayError::BackendWrite(_) => 500,
            RelayError::ConfigError(_) => 500,
            RelayError::IoError(_) => 500,
            RelayError::InternalError(_) => 500,
        }
    }

    /// Stable classification label, used in metrics and error bodies
    pub fn kind(&self) -> &'static str {
        match self {
            RelayError::Unauthorized => "unauthorized",
            RelayError::NotFound(_) => "not_found",
            RelayError::Timeout(_) => "timeout",
            RelayError::ProcessFailed(_) => "process_failed",
            RelayError::BackendWrite(_) => "backend_write",
            RelayError::InvalidRequest(_) => "invalid_request",
            RelayError::OriginClientError { status, .. } if *status == 404 || *status == 410 => {
                "not_found"
            }
            RelayError::OriginClientError { .. } => "origin_client_error",
            RelayError::OriginServerError { .. } | RelayError::HttpError(_) => "bad_gateway",
            RelayError::ConfigError(_) | RelayError::IoError(_) | RelayError::InternalError(_) => {
                "internal"
            }
        }
    }

    /// Create an OriginClientError from a status code and message
    pub fn origin_client_error(status: u16, message: impl Into<String>) -> Self {
        RelayError::OriginClientError {
            status,
            message: message.into(),
        }
    }

    /// Create an OriginServerError from a status code and message
    pub fn origin_server_error(status: u16, message: impl Into<String>) -> Self {
        RelayError::OriginServerError {
            status,
            message: message.into(),
        }
    }

    /// Create an error from an HTTP status code returned by an origin
    ///
    /// 404 and 410 become `NotFound` so that loader fallback applies.
    pub fn from_http_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            404 | 410 => RelayError::NotFound(message),
            400..=499 => RelayError::origin_client_error(status, message),
            500..=599 => RelayError::origin_server_error(status, message),
            _ => RelayError::HttpError(format!("HTTP {}: {}", status, message)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_not_found_maps_to_not_found() {
        let err: RelayError = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert!(err.is_not_found());
        assert_eq!(err.to_http_status(), 404);

        let err: RelayError = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "no").into();
        assert!(!err.is_not_found());
        assert_eq!(err.kind(), "internal");
    }

    #[test]
    fn test_from_http_status() {
        assert!(RelayError::from_http_status(404, "missing").is_not_found());
        assert!(RelayError::from_http_status(410, "gone").is_not_found());

        let err = RelayError::from_http_status(403, "forbidden");
        assert!(!err.is_not_found());
        assert!(!err.should_retry());
        assert_eq!(err.to_http_status(), 403);

        let err = RelayError::from_http_status(503, "unavailable");
        assert!(err.should_retry());
        assert_eq!(err.to_http_status(), 502);
    }

    #[test]
    fn test_taxonomy_statuses() {
        assert_eq!(RelayError::Unauthorized.to_http_status(), 403);
        assert_eq!(RelayError::Timeout("load".into()).to_http_status(), 504);
        assert_eq!(RelayError::ProcessFailed("bad".into()).to_http_status(), 422);
        assert_eq!(RelayError::InternalError("x".into()).to_http_status(), 500);
        assert_eq!(RelayError::Timeout("load".into()).kind(), "timeout");
    }
}
