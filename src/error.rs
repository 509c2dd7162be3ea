//! Error types for the crypto chat orchestrator

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result type alias for orchestrator operations
pub type Result<T> = std::result::Result<T, OrchestrationError>;

#[derive(Error, Debug)]
pub enum OrchestrationError {

    // =============================
    // Pipeline Errors
    // =============================

    #[error("Preprocessing error: {0}")]
    Preprocessing(String),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationErrorKind),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("Provider error ({provider}): {message}")]
    Provider {
        provider: String,
        status: Option<u16>,
        message: String,
    },

    #[error("Rate limit exceeded: {0}")]
    RateLimit(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =============================
    // External Library Conversions
    // =============================

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    Http(String),
}

/// Reasons a classification payload is rejected by the schema validator
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationErrorKind {
    #[error("payload does not match schema: {0}")]
    Schema(String),

    #[error("confidence {0} is outside [0, 1]")]
    ConfidenceOutOfRange(f64),

    #[error("{0} detected tokens exceeds the limit of 5")]
    TooManyTokens(usize),

    #[error("unknown intent '{0}'")]
    UnknownIntent(String),

    #[error("unknown ambiguity level '{0}'")]
    UnknownAmbiguity(String),

    #[error("field '{0}' must not be empty")]
    EmptyField(&'static str),
}

/// Structural tag for an error, used for retry and user-facing mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Preprocessing,
    Validation,
    Llm,
    Provider,
    RateLimit,
    Timeout,
    Connection,
    Configuration,
    Internal,
}

impl ErrorKind {
    /// Rate limits, timeouts and dropped connections are worth another attempt
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            ErrorKind::RateLimit | ErrorKind::Timeout | ErrorKind::Connection
        )
    }

    /// Stable, user-safe message for this class of failure
    pub fn user_message(self) -> &'static str {
        match self {
            ErrorKind::Preprocessing => {
                "Please enter a question so I can help you."
            }
            ErrorKind::Validation | ErrorKind::Llm => {
                "I had trouble understanding that request. Please try rephrasing your question."
            }
            ErrorKind::Provider => {
                "Market data is temporarily unavailable. Please try again later."
            }
            ErrorKind::RateLimit => {
                "Service is currently busy. Please try again in a moment."
            }
            ErrorKind::Timeout => "Request timed out. Please try again.",
            ErrorKind::Connection => {
                "Unable to reach an upstream service. Please try again later."
            }
            ErrorKind::Configuration => {
                "The assistant is not configured correctly. Please contact support."
            }
            ErrorKind::Internal => {
                "An unexpected error occurred while processing your request."
            }
        }
    }
}

impl OrchestrationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            OrchestrationError::Preprocessing(_) => ErrorKind::Preprocessing,
            OrchestrationError::Validation(_) => ErrorKind::Validation,
            OrchestrationError::Llm(_) => ErrorKind::Llm,
            OrchestrationError::Provider { .. } => ErrorKind::Provider,
            OrchestrationError::RateLimit(_) => ErrorKind::RateLimit,
            OrchestrationError::Timeout(_) => ErrorKind::Timeout,
            OrchestrationError::Connection(_) => ErrorKind::Connection,
            OrchestrationError::Configuration(_) => ErrorKind::Configuration,
            OrchestrationError::Serialization(_) | OrchestrationError::Http(_) => {
                ErrorKind::Internal
            }
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind().is_transient()
    }

    /// Map a non-success HTTP status from `source` into the taxonomy
    pub fn from_status(source: &str, status: reqwest::StatusCode, body: &str) -> Self {
        match status.as_u16() {
            429 => OrchestrationError::RateLimit(format!("{} returned 429", source)),
            408 | 504 => OrchestrationError::Timeout(format!(
                "{} returned {}",
                source, status
            )),
            code => OrchestrationError::Provider {
                provider: source.to_string(),
                status: Some(code),
                message: truncate(body, 200),
            },
        }
    }
}

impl From<reqwest::Error> for OrchestrationError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            OrchestrationError::Timeout(e.to_string())
        } else if e.is_connect() || e.is_request() {
            OrchestrationError::Connection(e.to_string())
        } else if let Some(status) = e.status() {
            OrchestrationError::from_status("http", status, &e.to_string())
        } else {
            OrchestrationError::Http(e.to_string())
        }
    }
}

/// Error surfaced to the orchestrator's caller
///
/// Carries only the user-safe message; the underlying cause is logged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&OrchestrationError> for QueryError {
    fn from(e: &OrchestrationError) -> Self {
        let kind = e.kind();
        Self {
            kind,
            message: kind.user_message().to_string(),
        }
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for QueryError {}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max).collect();
        format!("{}...", cut)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_kinds() {
        assert!(OrchestrationError::RateLimit("x".into()).is_transient());
        assert!(OrchestrationError::Timeout("x".into()).is_transient());
        assert!(OrchestrationError::Connection("x".into()).is_transient());
        assert!(!OrchestrationError::Preprocessing("x".into()).is_transient());
        assert!(!OrchestrationError::Llm("x".into()).is_transient());
        assert!(!OrchestrationError::Configuration("x".into()).is_transient());
        assert!(!OrchestrationError::Validation(ValidationErrorKind::TooManyTokens(6))
            .is_transient());
    }

    #[test]
    fn test_status_mapping() {
        let err = OrchestrationError::from_status(
            "coingecko",
            reqwest::StatusCode::TOO_MANY_REQUESTS,
            "",
        );
        assert_eq!(err.kind(), ErrorKind::RateLimit);

        let err = OrchestrationError::from_status(
            "coingecko",
            reqwest::StatusCode::INTERNAL_SERVER_ERROR,
            "boom",
        );
        match err {
            OrchestrationError::Provider { provider, status, .. } => {
                assert_eq!(provider, "coingecko");
                assert_eq!(status, Some(500));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_query_error_hides_cause() {
        let err = OrchestrationError::Timeout("socket read at 10.0.0.4:443".into());
        let public = QueryError::from(&err);
        assert_eq!(public.kind, ErrorKind::Timeout);
        assert_eq!(public.to_string(), "Request timed out. Please try again.");
        assert!(!public.message.contains("10.0.0.4"));
    }
}
