use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failures attached to a tool request or tool response. These travel inside the
/// conversation, so they are serializable and cheap to clone.
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

/// Typed provider failures, so the reasoning loop can tell a terminal failure
/// (bad credentials) from one it may degrade around.
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Context length exceeded: {0}")]
    ContextLengthExceeded(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Server error: {0}")]
    Server(String),

    #[error("Request failed: {0}")]
    Request(String),
}

/// Failures talking to an external tool server.
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Failed to start tool server {server}: {reason}")]
    Spawn { server: String, reason: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("JSON-RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl From<std::io::Error> for ServerError {
    fn from(err: std::io::Error) -> Self {
        ServerError::Transport(err.to_string())
    }
}

impl From<reqwest::Error> for ServerError {
    fn from(err: reqwest::Error) -> Self {
        ServerError::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for ServerError {
    fn from(err: serde_json::Error) -> Self {
        ServerError::Protocol(err.to_string())
    }
}

pub type ServerResult<T> = Result<T, ServerError>;
