use std::time::Duration;

use crate::model::ModelError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("transport error: {0}")]
    Transport(#[source] mcp::Error),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("invalid tool descriptor: {0}")]
    Schema(String),

    #[error("tool `{name}` failed: {cause}")]
    ToolInvocation { name: String, cause: String },

    #[error("inference failed: {0}")]
    Inference(#[from] ModelError),

    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    #[error("turn limit of {limit} exceeded")]
    TurnLimitExceeded { limit: usize },

    #[error("invalid state: {0}")]
    Usage(String),

    #[error("teardown failed: {}", .failures.join("; "))]
    Teardown { failures: Vec<String> },
}

impl From<mcp::Error> for Error {
    fn from(err: mcp::Error) -> Self {
        match err {
            mcp::Error::NotInitialized => Self::Usage(err.to_string()),
            mcp::Error::Handshake(message) => Self::Handshake(message),
            mcp::Error::Protocol(message) => Self::Protocol(message),
            mcp::Error::JsonRpc(rpc) => Self::Protocol(rpc.to_string()),
            mcp::Error::ToolCall { name, message } => Self::ToolInvocation {
                name,
                cause: message,
            },
            mcp::Error::Timeout(after) => Self::Timeout {
                operation: "tool server request".to_string(),
                after,
            },
            mcp::Error::OutputTooLarge { .. } | mcp::Error::Serialize(_) => {
                Self::Protocol(err.to_string())
            }
            mcp::Error::Spawn { .. } | mcp::Error::Io(_) | mcp::Error::Closed => {
                Self::Transport(err)
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_errors_map_into_taxonomy() {
        assert!(matches!(
            Error::from(mcp::Error::Closed),
            Error::Transport(mcp::Error::Closed)
        ));
        assert!(matches!(
            Error::from(mcp::Error::NotInitialized),
            Error::Usage(_)
        ));
        assert!(matches!(
            Error::from(mcp::Error::Handshake("bad".into())),
            Error::Handshake(_)
        ));

        let err = Error::from(mcp::Error::ToolCall {
            name: "echo".into(),
            message: "boom".into(),
        });
        assert_eq!(err.to_string(), "tool `echo` failed: boom");
    }

    #[test]
    fn teardown_lists_failures() {
        let err = Error::Teardown {
            failures: vec!["session: closed".into(), "transport: kill failed".into()],
        };
        assert_eq!(
            err.to_string(),
            "teardown failed: session: closed; transport: kill failed"
        );
    }
}
