//! MCP error types.

use std::time::Duration;

use crate::protocol::JsonRpcError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to spawn server `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("server closed the connection")]
    Closed,

    #[error("session not initialized")]
    NotInitialized,

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("JSON-RPC error: {0}")]
    JsonRpc(#[from] JsonRpcError),

    #[error("tool `{name}` failed: {message}")]
    ToolCall { name: String, message: String },

    #[error("timeout after {0:?} waiting for response")]
    Timeout(Duration),

    #[error("failed to serialize request: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("output too large: {size} bytes (max {max})")]
    OutputTooLarge { size: usize, max: usize },
}

impl Error {
    /// Whether the failure came from the process or its byte streams.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Spawn { .. } | Self::Io(_) | Self::Closed)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
