//! Error types for failover

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Procedure Log Errors ===
    #[error("Corrupted data: {0}")]
    Corrupted(String),

    #[error("Checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("Procedure log error: {0}")]
    ProcedureLog(String),

    /// A procedure state transition could not be made durable. Fatal to the executor.
    #[error("Durability failure: {0}")]
    Durability(String),

    #[error("Procedure executor is halted")]
    Halted,

    #[error("Procedure executor is stopping")]
    Stopping,

    // === Tracker / Procedure Errors ===
    #[error("Server not found: {0}")]
    ServerNotFound(String),

    #[error("Procedure not found: {0}")]
    ProcedureNotFound(u64),

    #[error("Invalid server name: {0}")]
    InvalidServerName(String),

    #[error("Illegal state transition for {server}: {reason}")]
    IllegalTransition { server: String, reason: String },

    #[error("Child procedure {child} failed: {reason}")]
    ChildFailed { child: u64, reason: String },

    // === Collaborator Errors ===
    #[error("Collaborator unavailable: {0}")]
    Unavailable(String),

    #[error("Collaborator error: {0}")]
    Collaborator(String),

    // === Network Errors ===
    #[error("HTTP error: {0}")]
    Http(String),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Generic ===
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation timeout: {0}")]
    Timeout(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Is this a retryable error?
    ///
    /// Retryable errors keep a procedure at its current step; everything else
    /// is terminal for the procedure that hit it.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Unavailable(_) | Error::Timeout(_))
    }

    /// Errors after which the executor must stop advancing procedures.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Durability(_) | Error::Halted)
    }

    /// Convert to HTTP status code
    pub fn to_http_status(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Error::ServerNotFound(_) | Error::ProcedureNotFound(_) => StatusCode::NOT_FOUND,
            Error::InvalidServerName(_) | Error::InvalidConfig(_) => StatusCode::BAD_REQUEST,
            Error::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
            Error::Unavailable(_) | Error::Halted | Error::Stopping | Error::Durability(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

// Implement From for common error types
impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Other(e.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::InvalidConfig(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Error::Timeout(e.to_string())
        } else if e.is_connect() {
            Error::Unavailable(e.to_string())
        } else {
            Error::Http(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::Unavailable("meta offline".into()).is_retryable());
        assert!(Error::Timeout("split".into()).is_retryable());
        assert!(!Error::Collaborator("bad region".into()).is_retryable());
        assert!(!Error::Durability("disk full".into()).is_retryable());
        assert!(Error::Durability("disk full".into()).is_fatal());
        assert!(!Error::Unavailable("x".into()).is_fatal());
    }

    #[test]
    fn test_http_status() {
        use axum::http::StatusCode;
        assert_eq!(
            Error::ServerNotFound("a".into()).to_http_status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(Error::Halted.to_http_status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
