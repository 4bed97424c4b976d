//! Conversation runtime for a tool-using model client.
//!
//! The runtime connects an inference backend to an MCP tool server and runs
//! queries against them.
//!
//! # Overview
//!
//! - **Backend**: a trait over inference providers ([`AnthropicBackend`]).
//! - **ToolHost**: the side-effect boundary. An [`mcp::Session`] is one.
//! - **Engine**: the loop that alternates model calls with tool dispatch.
//! - **Client**: owns one server connection and releases it on cleanup.
//!
//! # Example
//!
//! ```no_run
//! use mcp::ServerConfig;
//! use runtime::{AnthropicBackend, Client};
//!
//! # async fn example() -> runtime::Result<()> {
//! let backend = AnthropicBackend::builder("sk-ant-api03-...", "claude-sonnet-4-20250514").build();
//! let config = ServerConfig::from_script("servers/weather.py");
//!
//! let mut client = Client::connect(&config, backend).await?;
//! let outcome = client.process_query("What's the forecast for Oslo?").await;
//! client.cleanup().await?;
//!
//! println!("{}", outcome?.text);
//! # Ok(())
//! # }
//! ```

mod client;
mod engine;
mod error;
mod lifecycle;
pub mod model;
mod providers;
pub mod tools;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use client::{Client, ConnectOptions};
pub use engine::{DEFAULT_MAX_TURNS, Engine, EngineOptions, QueryOutcome};
pub use error::{Error, Result};
pub use lifecycle::{Release, ResourceStack};
pub use model::{
    Backend, Message, ModelError, ModelRequest, ModelResponse, Part, Role, ToolCall, ToolResult,
    ToolSpec, Usage,
};
pub use providers::{
    ANTHROPIC_API_URL, AnthropicBackend, AnthropicBackendBuilder, DEFAULT_MAX_TOKENS,
    DEFAULT_MODEL,
};
pub use tools::{ToolCatalog, ToolHost, tool_output};
