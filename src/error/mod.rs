use thiserror::Error;

/// Application-level errors
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("ACP protocol error: {0}")]
    Acp(#[from] AcpError),

    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Store layer errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database connection failed: {message}")]
    Connection { message: String },

    #[error("Query failed: {message}")]
    Query { message: String },

    #[error("Migration failed: {message}")]
    Migration { message: String },

    #[error("{message}")]
    Validation { message: String },

    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

impl StoreError {
    /// Shorthand for a validation failure with the given reason.
    pub fn validation(message: impl Into<String>) -> Self {
        StoreError::Validation {
            message: message.into(),
        }
    }
}

/// Errors from the dispatcher's HTTP client against the broker surface
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    #[error("Invalid response: {message}")]
    InvalidResponse { message: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// ACP protocol errors
#[derive(Debug, Error)]
pub enum AcpError {
    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("Unknown tool: {tool_name}")]
    UnknownTool { tool_name: String },

    #[error("Invalid parameters for {tool_name}: {message}")]
    InvalidParameters { tool_name: String, message: String },

    #[error("{message}")]
    ExecutionFailed { message: String },

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<ClientError> for AcpError {
    fn from(err: ClientError) -> Self {
        match err {
            // Preserve the surface's own reason string so tool results carry
            // messages like "annotation not found: <id>" verbatim.
            ClientError::Api { message, .. } if !message.is_empty() => {
                AcpError::ExecutionFailed { message }
            }
            other => AcpError::ExecutionFailed {
                message: other.to_string(),
            },
        }
    }
}

/// Webhook delivery errors
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("Webhook endpoint returned {status}")]
    Status { status: u16 },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Result type alias for application errors
pub type AppResult<T> = Result<T, AppError>;

/// Result type alias for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Result type alias for the dispatcher's HTTP client
pub type ClientResult<T> = Result<T, ClientError>;

/// Result type alias for ACP operations
pub type AcpResult<T> = Result<T, AcpError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_display() {
        let err = StoreError::Connection {
            message: "failed to open".to_string(),
        };
        assert_eq!(err.to_string(), "Database connection failed: failed to open");

        let err = StoreError::validation("illegal status transition: pending -> resolved");
        assert_eq!(
            err.to_string(),
            "illegal status transition: pending -> resolved"
        );
    }

    #[test]
    fn test_acp_error_display() {
        let err = AcpError::UnknownTool {
            tool_name: "nonexistent".to_string(),
        };
        assert_eq!(err.to_string(), "Unknown tool: nonexistent");

        let err = AcpError::InvalidParameters {
            tool_name: "resolve".to_string(),
            message: "missing annotationId".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Invalid parameters for resolve: missing annotationId"
        );
    }

    #[test]
    fn test_client_error_preserves_api_message() {
        let err = ClientError::Api {
            status: 404,
            message: "annotation not found: a-1".to_string(),
        };
        let acp: AcpError = err.into();
        assert_eq!(acp.to_string(), "annotation not found: a-1");
    }

    #[test]
    fn test_store_error_conversion_to_app_error() {
        let err = StoreError::Query {
            message: "syntax error".to_string(),
        };
        let app: AppError = err.into();
        assert!(matches!(app, AppError::Store(_)));
    }
}
