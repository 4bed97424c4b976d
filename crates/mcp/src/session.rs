//! Initialized protocol session over a [`Transport`].

use std::collections::HashSet;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{Instrument, Span};

use crate::error::{Error, Result};
use crate::protocol::{
    CallToolParams, CallToolResult, InitializeParams, InitializeResult, JsonRpcError,
    JsonRpcMessage, JsonRpcNotification, JsonRpcReply, JsonRpcRequest, ListToolsParams,
    ListToolsResult, RequestId, Tool,
};
use crate::transport::Transport;

/// Default timeout for a single request/response exchange.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// A protocol session with a tool server.
///
/// The session owns its transport. Requests are serialized: at most one is
/// outstanding at a time, so responses are matched strictly by id.
pub struct Session {
    transport: Transport,
    next_id: AtomicI64,
    initialized: AtomicBool,
    server_info: OnceLock<InitializeResult>,
    in_flight: Mutex<()>,
    timeout: Duration,
    span: Span,
}

impl Session {
    /// Wrap a transport. The session is unusable until [`Session::initialize`].
    pub fn new(transport: Transport) -> Self {
        Self {
            transport,
            next_id: AtomicI64::new(1),
            initialized: AtomicBool::new(false),
            server_info: OnceLock::new(),
            in_flight: Mutex::new(()),
            timeout: DEFAULT_TIMEOUT,
            span: Span::none(),
        }
    }

    /// Wrap a transport and perform the handshake.
    pub async fn connect(transport: Transport) -> Result<Self> {
        let session = Self::new(transport);
        session.initialize().await?;
        Ok(session)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Server info (after initialization).
    pub fn server_info(&self) -> Option<&InitializeResult> {
        self.server_info.get()
    }

    /// Perform the initialize handshake (must be called before other operations).
    pub async fn initialize(&self) -> Result<&InitializeResult> {
        if let Some(info) = self.server_info.get() {
            if self.is_initialized() {
                return Ok(info);
            }
        }

        let value = self
            .request("initialize", Some(InitializeParams::default()))
            .await
            .map_err(|e| match e {
                Error::JsonRpc(rpc) => Error::Handshake(format!("server rejected initialize: {rpc}")),
                Error::Protocol(message) => Error::Handshake(message),
                other => other,
            })?;

        let result: InitializeResult = serde_json::from_value(value)
            .map_err(|e| Error::Handshake(format!("malformed initialize result: {e}")))?;

        self.notify(JsonRpcNotification::new("notifications/initialized"))
            .await?;

        tracing::info!(
            parent: &self.span,
            server = %result.server_info.name,
            protocol = %result.protocol_version,
            "session initialized"
        );

        let info = self.server_info.get_or_init(|| result);
        self.initialized.store(true, Ordering::SeqCst);
        Ok(info)
    }

    /// List every tool the server exposes, following pagination cursors.
    pub async fn list_tools(&self) -> Result<Vec<Tool>> {
        self.require_initialized()?;

        let mut tools = Vec::new();
        let mut cursor = None;
        let mut seen = HashSet::new();
        loop {
            let value = self
                .request("tools/list", Some(ListToolsParams { cursor }))
                .await
                .map_err(|e| match e {
                    Error::JsonRpc(rpc) => Error::Protocol(format!("tools/list failed: {rpc}")),
                    other => other,
                })?;

            let page: ListToolsResult = serde_json::from_value(value)
                .map_err(|e| Error::Protocol(format!("malformed tool listing: {e}")))?;

            tools.extend(page.tools);
            let Some(next) = page.next_cursor else {
                break;
            };
            if !seen.insert(next.clone()) {
                return Err(Error::Protocol(format!("tools/list repeated cursor `{next}`")));
            }
            cursor = Some(next);
        }

        tracing::debug!(parent: &self.span, count = tools.len(), "listed tools");
        Ok(tools)
    }

    /// Call a tool by name and wait for its result.
    ///
    /// A peer-reported failure (JSON-RPC error or `isError` result) becomes
    /// [`Error::ToolCall`].
    pub async fn call_tool(&self, name: &str, arguments: Option<Value>) -> Result<CallToolResult> {
        self.require_initialized()?;

        let params = CallToolParams {
            name: name.to_string(),
            arguments,
        };

        let value = self
            .request("tools/call", Some(params))
            .await
            .map_err(|e| match e {
                Error::JsonRpc(rpc) => Error::ToolCall {
                    name: name.to_string(),
                    message: rpc.to_string(),
                },
                other => other,
            })?;

        let result: CallToolResult = serde_json::from_value(value)
            .map_err(|e| Error::Protocol(format!("malformed tool result: {e}")))?;

        if result.is_error {
            return Err(Error::ToolCall {
                name: name.to_string(),
                message: result.joined_text(),
            });
        }

        Ok(result)
    }

    /// End the session and close the write end of the transport.
    ///
    /// The process itself is left to the transport's own close.
    pub async fn close(&self) -> Result<()> {
        if self.initialized.swap(false, Ordering::SeqCst) {
            tracing::debug!(parent: &self.span, "session closed");
        }
        self.transport.close_writer().await
    }

    // --- Internal methods ---

    fn require_initialized(&self) -> Result<()> {
        if self.is_initialized() {
            Ok(())
        } else {
            Err(Error::NotInitialized)
        }
    }

    fn next_request_id(&self) -> RequestId {
        RequestId::Number(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    async fn request<P: Serialize>(&self, method: &str, params: Option<P>) -> Result<Value> {
        let _guard = self.in_flight.lock().await;

        let id = self.next_request_id();
        let mut request = JsonRpcRequest::new(id.clone(), method);
        if let Some(p) = params {
            request = request.with_params(p)?;
        }
        let request_json = serde_json::to_string(&request)?;

        let span = tracing::debug_span!(parent: &self.span, "request", method, id = ?id);
        self.exchange(&id, &request_json).instrument(span).await
    }

    async fn exchange(&self, id: &RequestId, request_json: &str) -> Result<Value> {
        self.transport.send(request_json).await?;

        let response = timeout(self.timeout, self.await_response(id))
            .await
            .map_err(|_| Error::Timeout(self.timeout))??;

        Ok(response.into_result()?)
    }

    async fn notify(&self, notification: JsonRpcNotification) -> Result<()> {
        let json = serde_json::to_string(&notification)?;
        self.transport.send(&json).await
    }

    async fn await_response(&self, id: &RequestId) -> Result<JsonRpcMessage> {
        loop {
            let line = self.transport.recv().await?;
            let message: JsonRpcMessage = serde_json::from_str(&line)
                .map_err(|e| Error::Protocol(format!("invalid JSON-RPC message: {e}")))?;

            if message.is_response() {
                match &message.id {
                    Some(got) if got == id => return Ok(message),
                    Some(got) if is_superseded(got, id) => {
                        tracing::debug!(id = ?got, "discarding response to abandoned request");
                        continue;
                    }
                    got => {
                        return Err(Error::Protocol(format!(
                            "response ID mismatch: expected {id:?}, got {got:?}"
                        )));
                    }
                }
            }

            if message.is_notification() {
                tracing::debug!(method = ?message.method, "ignoring server notification");
                continue;
            }

            match (message.id, message.method) {
                (Some(request_id), Some(method)) => self.answer_server_request(request_id, &method).await?,
                _ => {
                    return Err(Error::Protocol(
                        "message is neither a request, a response nor a notification".into(),
                    ));
                }
            }
        }
    }

    async fn answer_server_request(&self, id: RequestId, method: &str) -> Result<()> {
        let reply = if method == "ping" {
            JsonRpcReply::result(id, Value::Object(Default::default()))
        } else {
            tracing::debug!(method, "rejecting unsupported server request");
            JsonRpcReply::error(id, JsonRpcError::method_not_found(method))
        };
        self.transport.send(&serde_json::to_string(&reply)?).await
    }
}

/// Whether `got` answers a request issued before `current`.
///
/// Requests are numbered in order and sent one at a time, so a lower id
/// belongs to a request whose caller timed out or was cancelled.
fn is_superseded(got: &RequestId, current: &RequestId) -> bool {
    matches!((got, current), (RequestId::Number(got), RequestId::Number(current)) if got < current)
}
