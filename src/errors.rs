/// Domain-specific error types for rentql
///
/// Provides actionable error messages with detailed context so that MCP
/// clients can tell a bad request apart from an upstream failure.

#[derive(Debug, thiserror::Error)]
pub enum RentqlError {
    #[error("Validation error: {message}")]
    Validation {
        message: String,
        field: Option<String>
    },

    #[error("Not found: {id}")]
    NotFound {
        id: String
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("SQL rejected: {reason}")]
    SqlRejected {
        reason: String
    },

    #[error("Query execution error: {0}")]
    Execution(String),
}

impl From<sqlx::Error> for RentqlError {
    fn from(e: sqlx::Error) -> Self {
        RentqlError::Storage(e.to_string())
    }
}

impl From<crate::embedding::EmbeddingError> for RentqlError {
    fn from(e: crate::embedding::EmbeddingError) -> Self {
        RentqlError::Internal(e.to_string())
    }
}

impl From<crate::llm::LlmError> for RentqlError {
    fn from(e: crate::llm::LlmError) -> Self {
        RentqlError::Llm(e.to_string())
    }
}

impl From<crate::sql::guard::SqlGuardError> for RentqlError {
    fn from(e: crate::sql::guard::SqlGuardError) -> Self {
        RentqlError::SqlRejected { reason: e.to_string() }
    }
}

impl RentqlError {
    /// Helper to create validation errors with field names
    ///
    /// Example:
    /// ```
    /// use rentql::errors::RentqlError;
    /// let err = RentqlError::validation("question", "Question cannot be empty");
    /// ```
    pub fn validation(field: &str, message: &str) -> Self {
        RentqlError::Validation {
            message: message.to_string(),
            field: Some(field.to_string()),
        }
    }
}
