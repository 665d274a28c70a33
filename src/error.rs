//! Failure taxonomy for the upload engine.
//!
//! A small closed set of categories, each carrying the human-readable
//! message and the HTTP status (when one was observed). Records and items
//! store these directly, so the whole enum is `Clone`.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UploadError {
    /// Session or credential expired; requires user re-auth, not a retry.
    #[error("authentication failed: {message}")]
    Auth {
        message: String,
        http_status: Option<u16>,
    },

    /// Blocked by cross-origin policy.
    #[error("blocked by cross-origin policy: {message}")]
    Cors {
        message: String,
        http_status: Option<u16>,
    },

    /// Connectivity or timeout; safe to retry.
    #[error("network error: {message}")]
    Network {
        message: String,
        http_status: Option<u16>,
    },

    /// File rejected (too large, unsupported, stale session).
    #[error("validation failed: {message}")]
    Validation {
        message: String,
        http_status: Option<u16>,
    },

    /// Backend storage conflict or lock; safe to retry.
    #[error("storage pipeline error: {message}")]
    Pipeline {
        message: String,
        http_status: Option<u16>,
    },

    #[error("upload failed: {message}")]
    Unknown {
        message: String,
        http_status: Option<u16>,
    },
}

impl UploadError {
    pub fn retryable(&self) -> bool {
        matches!(self, UploadError::Network { .. } | UploadError::Pipeline { .. })
    }

    pub fn message(&self) -> &str {
        match self {
            UploadError::Auth { message, .. }
            | UploadError::Cors { message, .. }
            | UploadError::Network { message, .. }
            | UploadError::Validation { message, .. }
            | UploadError::Pipeline { message, .. }
            | UploadError::Unknown { message, .. } => message,
        }
    }

    pub fn http_status(&self) -> Option<u16> {
        match self {
            UploadError::Auth { http_status, .. }
            | UploadError::Cors { http_status, .. }
            | UploadError::Network { http_status, .. }
            | UploadError::Validation { http_status, .. }
            | UploadError::Pipeline { http_status, .. }
            | UploadError::Unknown { http_status, .. } => *http_status,
        }
    }

    pub fn category(&self) -> &'static str {
        match self {
            UploadError::Auth { .. } => "AUTH",
            UploadError::Cors { .. } => "CORS",
            UploadError::Network { .. } => "NETWORK",
            UploadError::Validation { .. } => "VALIDATION",
            UploadError::Pipeline { .. } => "PIPELINE",
            UploadError::Unknown { .. } => "UNKNOWN",
        }
    }

    /// Classify a non-success HTTP response.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        let http_status = Some(status);
        match status {
            401 | 403 => UploadError::Auth { message, http_status },
            408 | 502 | 503 | 504 => UploadError::Network { message, http_status },
            409 | 423 => UploadError::Pipeline { message, http_status },
            413 | 415 | 422 => UploadError::Validation { message, http_status },
            _ if message.to_lowercase().contains("cors") => {
                UploadError::Cors { message, http_status }
            }
            _ => UploadError::Unknown { message, http_status },
        }
    }

    /// Classify a reqwest transport-level error (no HTTP status reached us).
    pub fn from_transport(err: &reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            UploadError::Network {
                message: err.to_string(),
                http_status: None,
            }
        } else {
            UploadError::Unknown {
                message: err.to_string(),
                http_status: None,
            }
        }
    }

    /// A transport record claimed completion without a durable session
    /// reference. Treated as a failure, never as success.
    pub fn session_missing() -> Self {
        UploadError::Pipeline {
            message: "transfer reported complete without an upload session id".to_string(),
            http_status: None,
        }
    }

    /// A record survived from a previous dialog session and cannot be
    /// resumed; the file has to be added again.
    pub fn expired_session() -> Self {
        UploadError::Validation {
            message: "previous upload session expired - add the file again".to_string(),
            http_status: None,
        }
    }

    /// A local read of the source file failed before any bytes went out.
    pub fn source_read(err: &std::io::Error) -> Self {
        UploadError::Validation {
            message: format!("failed to read source file: {}", err),
            http_status: None,
        }
    }
}
