use thiserror::Error;

/// Custom error types for the live quiz server
#[derive(Debug, Error)]
pub enum QuizError {
    /// Inbound message / request validation errors
    #[error("Missing required field: {0}")]
    Validation(String),

    /// Persistence layer errors
    #[error("Persistence operation failed: {0}")]
    Persistence(String),

    /// External evaluator errors (always degraded, never fatal)
    #[error("Evaluator call failed: {0}")]
    Evaluator(String),

    /// A single connection's send failed during fan-out
    #[error("Broadcast to connection {0} failed")]
    Broadcast(u64),

    /// Non-teacher attempted a teacher-only operation
    #[error("Operation forbidden for role {0}")]
    Forbidden(String),

    /// Lifecycle errors
    #[error("Class {0} not found")]
    ClassNotFound(String),

    #[error("No question blocks configured for class {0}")]
    NoBlocks(String),

    #[error("Current block exhausted for class {0}")]
    BlockExhausted(String),

    #[error("Class {0} is finished")]
    ClassFinished(String),

    #[error("Invalid question pointer: block {0}, question {1}")]
    InvalidPointer(usize, usize),

    /// Wire format errors
    #[error("Failed to serialize message: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic errors
    #[error("Internal server error: {0}")]
    Internal(String),
}

/// Convenience type alias for Results using QuizError
pub type Result<T> = std::result::Result<T, QuizError>;

impl QuizError {
    /// Helper to create Validation errors with context
    pub fn validation(field: impl Into<String>) -> Self {
        QuizError::Validation(field.into())
    }

    /// Helper to create Persistence errors with context
    pub fn persistence(msg: impl Into<String>) -> Self {
        QuizError::Persistence(msg.into())
    }

    /// Helper to create Internal errors with context
    pub fn internal(msg: impl Into<String>) -> Self {
        QuizError::Internal(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = QuizError::ClassNotFound("A1B2C3".to_string());
        assert_eq!(err.to_string(), "Class A1B2C3 not found");
    }

    #[test]
    fn test_error_helpers() {
        let err = QuizError::persistence("write failed");
        assert!(matches!(err, QuizError::Persistence(_)));

        let err = QuizError::validation("classId");
        assert_eq!(err.to_string(), "Missing required field: classId");
    }
}
