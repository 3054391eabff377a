use thiserror::Error;

/// Custom error types for the exam client core
#[derive(Debug, Error)]
pub enum ExamError {
    /// Join / session lifecycle errors
    #[error("Session code must not be empty")]
    MissingJoinCode,

    #[error("Guest display name must not be empty")]
    MissingGuestName,

    #[error("The exam has already ended and cannot be rejoined")]
    SessionEnded,

    #[error("Failed to join session {0}: {1}")]
    JoinFailed(String, String),

    #[error("Session is not in a joinable state: {0}")]
    InvalidPhase(String),

    /// Media device errors
    #[error("No {0} device available")]
    NoDeviceAvailable(String),

    #[error("Failed to acquire {0} input: {1}")]
    MediaInput(String, String),

    /// Capability (conferencing session) errors
    #[error("Capability error: {0}")]
    Capability(String),

    #[error("Failed to send data message on topic {0}: {1}")]
    DataMessageSend(String, String),

    #[error("Chat message exceeds {0} characters")]
    ChatTooLong(usize),

    #[error("Chat target is not present in the session")]
    ChatTargetUnavailable,

    /// Backend collaborator errors
    #[error("Backend request failed: {0}")]
    Backend(String),

    #[error("Failed to end session on backend: {0}")]
    EndSessionFailed(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Failed to serialize message: {0}")]
    SerializationFailed(#[from] serde_json::Error),

    /// Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Generic errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Convenience type alias for Results using ExamError
pub type Result<T> = std::result::Result<T, ExamError>;

impl ExamError {
    /// Helper to create Internal errors with context
    pub fn internal(msg: impl Into<String>) -> Self {
        ExamError::Internal(msg.into())
    }

    /// Helper to create capability errors
    pub fn capability(msg: impl Into<String>) -> Self {
        ExamError::Capability(msg.into())
    }

    /// Helper to create backend errors
    pub fn backend(msg: impl Into<String>) -> Self {
        ExamError::Backend(msg.into())
    }

    /// True when retrying the same join can never succeed.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExamError::SessionEnded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ExamError::JoinFailed("EX42".to_string(), "boom".to_string());
        assert_eq!(err.to_string(), "Failed to join session EX42: boom");
    }

    #[test]
    fn test_error_helpers() {
        let err = ExamError::internal("Something went wrong");
        assert!(matches!(err, ExamError::Internal(_)));
    }

    #[test]
    fn test_session_ended_is_terminal() {
        assert!(ExamError::SessionEnded.is_terminal());
        assert!(!ExamError::backend("503").is_terminal());
    }
}
