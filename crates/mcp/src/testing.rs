//! In-process stub tool server for tests.
//!
//! The stub speaks the same line-delimited JSON-RPC as a real server over a
//! `tokio::io::duplex` pipe, so sessions built on it exercise the full
//! request/response path without spawning a process.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Value, json};

use crate::protocol::{
    CallToolResult, JsonRpcError, JsonRpcMessage, JsonRpcReply, PROTOCOL_VERSION, RequestId,
};
use crate::transport::Transport;

type Handler = Arc<dyn Fn(&Value) -> Result<CallToolResult, String> + Send + Sync>;

/// Every `tools/call` the stub received, in order: `(name, arguments)`.
pub type CallLog = Arc<Mutex<Vec<(String, Value)>>>;

/// Every response the client sent back to a server-initiated request.
pub type ReplyLog = Arc<Mutex<Vec<Value>>>;

struct StubTool {
    name: String,
    description: String,
    schema: Value,
    handler: Handler,
}

/// A scriptable tool server.
#[derive(Default)]
pub struct StubServer {
    tools: Vec<StubTool>,
    initialize_result: Option<Value>,
    tool_listing: Option<Value>,
    silent: HashSet<String>,
    page_size: Option<usize>,
    delays: HashMap<String, Duration>,
    interjections: HashMap<String, Vec<Value>>,
    calls: CallLog,
    replies: ReplyLog,
}

impl StubServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Expose a tool backed by `handler`. `Err` becomes an `isError` result.
    pub fn tool<F>(
        mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        schema: Value,
        handler: F,
    ) -> Self
    where
        F: Fn(&Value) -> Result<CallToolResult, String> + Send + Sync + 'static,
    {
        self.tools.push(StubTool {
            name: name.into(),
            description: description.into(),
            schema,
            handler: Arc::new(handler),
        });
        self
    }

    /// Answer `initialize` with this exact result.
    pub fn raw_initialize_result(mut self, result: Value) -> Self {
        self.initialize_result = Some(result);
        self
    }

    /// Answer `tools/list` with this exact result.
    pub fn raw_tool_listing(mut self, result: Value) -> Self {
        self.tool_listing = Some(result);
        self
    }

    /// Never answer requests for `method`.
    pub fn silent_on(mut self, method: impl Into<String>) -> Self {
        self.silent.insert(method.into());
        self
    }

    /// Split `tools/list` into pages of `size` tools linked by `nextCursor`.
    pub fn page_size(mut self, size: usize) -> Self {
        self.page_size = Some(size.max(1));
        self
    }

    /// Answer calls to tool `name` only after `delay`, without blocking
    /// other requests.
    pub fn delay_tool(mut self, name: impl Into<String>, delay: Duration) -> Self {
        self.delays.insert(name.into(), delay);
        self
    }

    /// Send `message` to the client before answering `method`.
    ///
    /// A message with an `id` is a server request: the stub waits for the
    /// client's response and records it in [`StubServer::client_replies`].
    pub fn interject(mut self, method: impl Into<String>, message: Value) -> Self {
        self.interjections
            .entry(method.into())
            .or_default()
            .push(message);
        self
    }

    /// Shared log of the client's responses to server requests.
    pub fn client_replies(&self) -> ReplyLog {
        self.replies.clone()
    }

    /// Shared log of the tool calls this server receives.
    pub fn calls(&self) -> CallLog {
        self.calls.clone()
    }

    /// Run the server on a background task and return the client end.
    pub fn start(self) -> Transport {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (client_read, client_write) = tokio::io::split(client);
        let (server_read, server_write) = tokio::io::split(server);

        let peer = Transport::from_streams(server_read, server_write);
        tokio::spawn(async move { self.serve(peer).await });

        Transport::from_streams(client_read, client_write)
    }

    async fn serve(self, peer: Transport) {
        let peer = Arc::new(peer);
        while let Ok(line) = peer.recv().await {
            let Ok(message) = serde_json::from_str::<JsonRpcMessage>(&line) else {
                continue;
            };
            let (Some(id), Some(method)) = (message.id, message.method) else {
                continue;
            };
            if self.silent.contains(&method) {
                continue;
            }
            if let Some(outgoing) = self.interjections.get(&method) {
                if !self.send_interjections(&peer, outgoing).await {
                    break;
                }
            }

            let params = message.params.unwrap_or(Value::Null);
            let delay = match method.as_str() {
                "tools/call" => params["name"]
                    .as_str()
                    .and_then(|name| self.delays.get(name))
                    .copied(),
                _ => None,
            };
            let reply = self.handle(id, &method, params);
            let Ok(json) = serde_json::to_string(&reply) else {
                break;
            };

            match delay {
                Some(delay) => {
                    let peer = peer.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = peer.send(&json).await;
                    });
                }
                None => {
                    if peer.send(&json).await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    async fn send_interjections(&self, peer: &Transport, messages: &[Value]) -> bool {
        for message in messages {
            let Ok(json) = serde_json::to_string(message) else {
                return false;
            };
            if peer.send(&json).await.is_err() {
                return false;
            }
            if message.get("id").is_none() {
                continue;
            }

            loop {
                let Ok(line) = peer.recv().await else {
                    return false;
                };
                let Ok(reply) = serde_json::from_str::<Value>(&line) else {
                    continue;
                };
                if reply.get("method").is_none() {
                    if let Ok(mut replies) = self.replies.lock() {
                        replies.push(reply);
                    }
                    break;
                }
            }
        }
        true
    }

    fn handle(&self, id: RequestId, method: &str, params: Value) -> JsonRpcReply {
        match method {
            "initialize" => {
                let result = self.initialize_result.clone().unwrap_or_else(|| {
                    json!({
                        "protocolVersion": PROTOCOL_VERSION,
                        "capabilities": {"tools": {}},
                        "serverInfo": {"name": "stub", "version": "0.0.0"}
                    })
                });
                JsonRpcReply::result(id, result)
            }
            "tools/list" => {
                let result = self
                    .tool_listing
                    .clone()
                    .unwrap_or_else(|| self.list_page(&params));
                JsonRpcReply::result(id, result)
            }
            "tools/call" => self.call(id, params),
            other => JsonRpcReply::error(id, JsonRpcError::method_not_found(other)),
        }
    }

    fn list_page(&self, params: &Value) -> Value {
        let start = params["cursor"]
            .as_str()
            .and_then(|cursor| cursor.parse::<usize>().ok())
            .unwrap_or(0)
            .min(self.tools.len());
        let end = match self.page_size {
            Some(size) => (start + size).min(self.tools.len()),
            None => self.tools.len(),
        };

        let tools: Vec<Value> = self.tools[start..end]
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "inputSchema": t.schema,
                })
            })
            .collect();
        if end < self.tools.len() {
            json!({ "tools": tools, "nextCursor": end.to_string() })
        } else {
            json!({ "tools": tools })
        }
    }

    fn call(&self, id: RequestId, params: Value) -> JsonRpcReply {
        let name = params["name"].as_str().unwrap_or_default().to_string();
        let arguments = params.get("arguments").cloned().unwrap_or(Value::Null);

        if let Ok(mut calls) = self.calls.lock() {
            calls.push((name.clone(), arguments.clone()));
        }

        let Some(tool) = self.tools.iter().find(|t| t.name == name) else {
            return JsonRpcReply::error(
                id,
                JsonRpcError {
                    code: -32602,
                    message: format!("unknown tool: {name}"),
                    data: None,
                },
            );
        };

        let result = match (tool.handler)(&arguments) {
            Ok(result) => result,
            Err(message) => CallToolResult {
                is_error: true,
                ..CallToolResult::text(message)
            },
        };
        match serde_json::to_value(result) {
            Ok(value) => JsonRpcReply::result(id, value),
            Err(e) => JsonRpcReply::error(
                id,
                JsonRpcError {
                    code: -32603,
                    message: e.to_string(),
                    data: None,
                },
            ),
        }
    }
}
