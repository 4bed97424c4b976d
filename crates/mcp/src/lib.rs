//! MCP (Model Context Protocol) client library.
//!
//! This crate provides the two lowest layers of a tool-using client:
//!
//! - [`Transport`]: a newline-delimited duplex channel, normally a spawned
//!   server process's stdin/stdout. Closing it is idempotent.
//! - [`Session`]: the JSON-RPC session layered on a transport. It performs the
//!   initialize handshake and then lists and calls tools.
//!
//! # Example
//!
//! ```no_run
//! use mcp::{ServerConfig, Session, Transport};
//!
//! # async fn example() -> mcp::Result<()> {
//! let config = ServerConfig::from_script("servers/weather.py");
//! let session = Session::connect(Transport::spawn(&config)?).await?;
//!
//! for tool in session.list_tools().await? {
//!     println!("Tool: {:?}", tool.name);
//! }
//!
//! let result = session
//!     .call_tool("get_forecast", Some(serde_json::json!({ "city": "Oslo" })))
//!     .await?;
//! println!("{}", result.joined_text());
//!
//! session.close().await?;
//! session.transport().close().await?;
//! # Ok(())
//! # }
//! ```

mod error;
mod protocol;
mod session;
mod transport;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use error::{Error, Result};
pub use protocol::{
    CallToolParams, CallToolResult, EmbeddedResource, InitializeParams, InitializeResult,
    JsonRpcError, JsonRpcMessage, JsonRpcNotification, JsonRpcReply, JsonRpcRequest,
    ListToolsResult, PROTOCOL_VERSION, RequestId, ServerCapabilities, ServerInfo, Tool,
    ToolContent,
};
pub use session::{DEFAULT_TIMEOUT, Session};
pub use transport::{MAX_OUTPUT_SIZE, ProcessHandle, ServerConfig, Transport};
