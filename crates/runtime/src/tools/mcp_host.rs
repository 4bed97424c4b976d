//! MCP-backed tool host.

use super::ToolHost;
use crate::model::ToolCall;
use crate::{Error, Result};
use mcp::{CallToolResult, Session, ToolContent};
use serde_json::Value;

impl ToolHost for Session {
    async fn execute(&self, call: &ToolCall) -> Result<Value> {
        let arguments = match &call.input {
            Value::Null => None,
            Value::Object(_) => Some(call.input.clone()),
            other => {
                return Err(Error::ToolInvocation {
                    name: call.name.clone(),
                    cause: format!("arguments must be a JSON object, got {other}"),
                });
            }
        };

        let result = self.call_tool(&call.name, arguments).await?;
        tool_output(&result)
    }
}

/// Flatten a tool result for the transcript.
///
/// Text-only results become one string; anything else is kept as the JSON
/// content array.
pub fn tool_output(result: &CallToolResult) -> Result<Value> {
    if result.content.iter().all(|c| matches!(c, ToolContent::Text { .. })) {
        return Ok(Value::String(result.joined_text()));
    }
    serde_json::to_value(&result.content)
        .map_err(|e| Error::Protocol(format!("serialize tool result: {e}")))
}
