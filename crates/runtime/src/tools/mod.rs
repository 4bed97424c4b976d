//! Tool execution and MCP integration.

mod catalog;
mod mcp_host;

pub use catalog::ToolCatalog;
pub use mcp_host::tool_output;

use crate::Result;
use crate::model::ToolCall;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;

/// Trait for tool execution hosts.
///
/// This is the boundary between the conversation loop and side effects.
pub trait ToolHost: Send + Sync {
    /// Execute a tool call and return its output.
    fn execute(&self, call: &ToolCall) -> impl Future<Output = Result<Value>> + Send;
}

impl<T: ToolHost> ToolHost for Arc<T> {
    fn execute(&self, call: &ToolCall) -> impl Future<Output = Result<Value>> + Send {
        (**self).execute(call)
    }
}
