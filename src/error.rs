//! Defines the custom `McpError` and `Result` types for the crate.

use std::time::Duration;
use thiserror::Error;

/// The primary error type for running MCP servers in sandboxes.
///
/// This enum consolidates every failure the runner can hit, from bad
/// configuration through sandbox launch to JSON-RPC errors reported by the
/// server, so callers can match on the condition they care about.
#[derive(Debug, Error)]
pub enum McpError {
    /// A `ServerConfig` or `RunnerConfig` failed validation.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The sandbox provider needs a credential and `E2B_API_KEY` is not set.
    #[error("E2B_API_KEY is required by this sandbox provider but is not set")]
    MissingApiKey,

    /// A server with the same name is already registered.
    #[error("Server '{0}' is already registered")]
    DuplicateServer(String),

    /// No server with this name is registered.
    #[error("Server '{0}' is not registered")]
    ServerNotFound(String),

    /// No live session has this id.
    #[error("Session '{0}' not found")]
    SessionNotFound(String),

    /// The runner already holds its maximum number of live sessions.
    #[error("Session limit reached ({0} live sessions)")]
    SessionLimit(usize),

    /// The server does not expose the requested tool.
    #[error("Tool '{tool}' not found on server '{server}'")]
    ToolNotFound { server: String, tool: String },

    /// The sandbox could not be created, prepared or terminated.
    #[error("Sandbox error: {0}")]
    Sandbox(String),

    /// An I/O failure on the pipe to the server process.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A message could not be serialized or deserialized.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The server answered with a JSON-RPC error object.
    #[error("JSON-RPC error (code {code}): {message}")]
    JsonRpc { code: i64, message: String },

    /// The server violated the protocol (bad handshake, missing result, ...).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// No response arrived within the server's timeout.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// The background connection task is gone.
    #[error("Connection to the MCP server closed")]
    ChannelClosed,
}

impl McpError {
    /// Whether retrying the same operation on a fresh session may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            McpError::Timeout(_) | McpError::ChannelClosed | McpError::Io(_)
        )
    }
}

/// A specialized `Result` type for this crate.
pub type Result<T> = std::result::Result<T, McpError>;

impl From<crate::types::ErrorData> for McpError {
    fn from(err: crate::types::ErrorData) -> Self {
        McpError::JsonRpc {
            code: err.code,
            message: err.message,
        }
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for McpError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        McpError::ChannelClosed
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for McpError {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        McpError::ChannelClosed
    }
}
