use thiserror::Error;

use crate::portal::LoginError;

/// Custom error types for the exam portal
#[derive(Debug, Error)]
pub enum PortalError {
    /// Remote store errors
    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Remote store rejected request: {0}")]
    RemoteRejected(String),

    #[error("Malformed payload from remote store: {0}")]
    MalformedPayload(String),

    /// Data integrity errors
    #[error("Data-loss guard rejected {collection}: remote returned 0, last known {known}")]
    DataLossGuard {
        collection: &'static str,
        known: usize,
    },

    #[error("Refusing full overwrite with an empty student collection")]
    EmptyOverwrite,

    /// Local cache errors
    #[error("Local cache error: {0}")]
    Cache(String),

    /// Authorization errors
    #[error("Action {action} not permitted for {role}")]
    Forbidden { role: String, action: String },

    #[error("Invalid username or password")]
    InvalidCredentials,

    #[error(transparent)]
    Login(#[from] LoginError),

    /// Dataset validation errors
    #[error("Student {0} not found")]
    StudentNotFound(String),

    #[error("Student {0} already exists")]
    DuplicateStudent(String),

    #[error("Session {0} not found")]
    SessionNotFound(String),

    #[error("Session {0} already exists")]
    DuplicateSession(String),

    #[error("Room {0} not found")]
    RoomNotFound(String),

    #[error("Room {0} already exists")]
    DuplicateRoom(String),

    /// Integrity monitor errors
    #[error("Capability {0} denied")]
    CapabilityDenied(String),

    #[error("Integrity monitor is no longer running")]
    MonitorClosed,

    /// Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Failed to serialize message: {0}")]
    SerializationFailed(#[from] serde_json::Error),

    /// Generic errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Convenience type alias for Results using PortalError
pub type Result<T> = std::result::Result<T, PortalError>;

impl PortalError {
    /// Helper to create Internal errors with context
    pub fn internal(msg: impl Into<String>) -> Self {
        PortalError::Internal(msg.into())
    }

    /// Helper to create network errors
    pub fn network(msg: impl Into<String>) -> Self {
        PortalError::NetworkError(msg.into())
    }

    /// Transient failures are retried by the next poll and never surfaced as fatal.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PortalError::NetworkError(_)
                | PortalError::Timeout(_)
                | PortalError::MalformedPayload(_)
                | PortalError::DataLossGuard { .. }
        )
    }
}

impl From<reqwest::Error> for PortalError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            PortalError::Timeout(err.to_string())
        } else if err.is_decode() {
            PortalError::MalformedPayload(err.to_string())
        } else {
            PortalError::NetworkError(err.to_string())
        }
    }
}

impl From<std::io::Error> for PortalError {
    fn from(err: std::io::Error) -> Self {
        PortalError::Cache(err.to_string())
    }
}
