use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while talking to a model backend.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ProviderError {
    /// Required options (credentials, endpoint) missing or invalid. Never retried.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Network failures, 429s and 5xx responses. Retryable by the caller.
    #[error("Transient provider error{}: {message}", status_suffix(.status))]
    Transient { status: Option<u16>, message: String },

    /// 4xx responses and validation failures. Not retryable.
    #[error("Fatal provider error{}: {message}", status_suffix(.status))]
    Fatal { status: Option<u16>, message: String },

    /// The conversation no longer fits the model's context window.
    #[error("Context length exceeded: {0}")]
    ContextLengthExceeded(String),
}

fn status_suffix(status: &Option<u16>) -> String {
    match status {
        Some(code) => format!(" (status {code})"),
        None => String::new(),
    }
}

impl ProviderError {
    pub fn status(&self) -> Option<u16> {
        match self {
            ProviderError::Transient { status, .. } | ProviderError::Fatal { status, .. } => {
                *status
            }
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        ProviderError::Transient {
            status: err.status().map(|s| s.as_u16()),
            message: err.to_string(),
        }
    }
}

#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Deserialize, Serialize)]
pub enum AgentError {
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Tool execution failed: {0}")]
    ExecutionError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type AgentResult<T> = Result<T, AgentError>;
