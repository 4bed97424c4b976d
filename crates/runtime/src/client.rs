//! Connected client: one tool server, one model, one conversation at a time.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mcp::{InitializeResult, ServerConfig, Session, Transport};
use tracing::{Instrument, Span};
use uuid::Uuid;

use crate::engine::{Engine, EngineOptions, QueryOutcome};
use crate::lifecycle::{Release, ResourceStack};
use crate::model::{Backend, Message};
use crate::tools::ToolCatalog;
use crate::{Error, Result};

/// Settings applied while connecting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectOptions {
    pub engine: EngineOptions,
    /// Bound on every request sent to the tool server.
    pub request_timeout: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            engine: EngineOptions::default(),
            request_timeout: mcp::DEFAULT_TIMEOUT,
        }
    }
}

struct TransportLayer(Arc<Session>);

#[async_trait]
impl Release for TransportLayer {
    async fn release(&mut self) -> Result<()> {
        Ok(self.0.transport().close().await?)
    }
}

struct SessionLayer(Arc<Session>);

#[async_trait]
impl Release for SessionLayer {
    async fn release(&mut self) -> Result<()> {
        Ok(self.0.close().await?)
    }
}

/// A client connected to a tool server.
///
/// Resources acquired by [`Client::connect`] are released by
/// [`Client::cleanup`], which is safe to call more than once.
pub struct Client<B: Backend> {
    id: Uuid,
    engine: Engine<B, Arc<Session>>,
    session: Arc<Session>,
    resources: ResourceStack,
    span: Span,
    closed: bool,
}

impl<B: Backend> Client<B> {
    /// Launch the server described by `config` and connect to it.
    pub async fn connect(config: &ServerConfig, backend: B) -> Result<Self> {
        Self::connect_with(config, backend, ConnectOptions::default()).await
    }

    pub async fn connect_with(
        config: &ServerConfig,
        backend: B,
        options: ConnectOptions,
    ) -> Result<Self> {
        if config.command.trim().is_empty() {
            return Err(Error::Config("tool server command is empty".to_string()));
        }
        tracing::info!(server = %config, "starting tool server");
        let transport = Transport::spawn(config)?;
        Self::connect_transport(transport, backend, options).await
    }

    /// Connect over an already established transport.
    ///
    /// On any failure the layers acquired so far are released before the
    /// error is returned.
    pub async fn connect_transport(
        transport: Transport,
        backend: B,
        options: ConnectOptions,
    ) -> Result<Self> {
        let id = Uuid::new_v4();
        let span = tracing::info_span!("client", %id);
        let session = Arc::new(
            Session::new(transport.with_span(span.clone()))
                .with_timeout(options.request_timeout)
                .with_span(span.clone()),
        );

        let mut resources = ResourceStack::new().with_span(span.clone());
        resources.register("transport", TransportLayer(session.clone()));

        let catalog = match Self::handshake(&session, &mut resources)
            .instrument(span.clone())
            .await
        {
            Ok(catalog) => catalog,
            Err(err) => {
                tracing::warn!(parent: &span, error = %err, "connect failed");
                if let Err(teardown) = resources.teardown().await {
                    tracing::warn!(parent: &span, error = %teardown, "cleanup after failed connect");
                }
                return Err(err);
            }
        };

        tracing::info!(parent: &span, tools = catalog.len(), "connected");
        let engine = Engine::new(backend, session.clone(), catalog)
            .with_options(options.engine)
            .with_span(span.clone());

        Ok(Self {
            id,
            engine,
            session,
            resources,
            span,
            closed: false,
        })
    }

    async fn handshake(session: &Arc<Session>, resources: &mut ResourceStack) -> Result<ToolCatalog> {
        let info = session.initialize().await?;
        tracing::debug!(server = %info.server_info.name, "handshake complete");
        resources.register("session", SessionLayer(session.clone()));

        let tools = session.list_tools().await?;
        let catalog = ToolCatalog::normalize(tools)?;
        tracing::debug!(tools = ?catalog.names().collect::<Vec<_>>(), "tool catalog ready");
        Ok(catalog)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn catalog(&self) -> &ToolCatalog {
        self.engine.catalog()
    }

    /// Transcript of the most recent query.
    pub fn transcript(&self) -> &[Message] {
        self.engine.transcript()
    }

    pub fn server_info(&self) -> Option<&InitializeResult> {
        self.session.server_info()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Answer one query, calling tools as the model asks for them.
    pub async fn process_query(&mut self, query: &str) -> Result<QueryOutcome> {
        if self.closed {
            return Err(Error::Usage("client has been cleaned up".to_string()));
        }
        self.engine.process_query(query).await
    }

    /// Close the session and stop the tool server.
    ///
    /// Later calls return `Ok(())` without touching the released resources.
    pub async fn cleanup(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        tracing::info!(parent: &self.span, "cleaning up");
        self.resources.teardown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedBackend;
    use mcp::CallToolResult;
    use mcp::testing::StubServer;
    use serde_json::json;

    fn echo_server() -> StubServer {
        StubServer::new().tool(
            "echo",
            "Echo text",
            json!({"type": "object", "properties": {"text": {"type": "string"}}}),
            |args| Ok(CallToolResult::text(args["text"].as_str().unwrap_or_default())),
        )
    }

    #[tokio::test]
    async fn empty_command_is_config_error() {
        let err = Client::connect(&ServerConfig::new("  "), ScriptedBackend::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn missing_binary_is_transport_error() {
        let config = ServerConfig::new("/nonexistent/tool-server");
        let err = Client::connect(&config, ScriptedBackend::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Transport(mcp::Error::Spawn { .. })));
    }

    #[tokio::test]
    async fn connect_builds_catalog() {
        let mut client = Client::connect_transport(
            echo_server().start(),
            ScriptedBackend::new(),
            ConnectOptions::default(),
        )
        .await
        .unwrap();

        assert_eq!(client.catalog().names().collect::<Vec<_>>(), ["echo"]);
        assert_eq!(client.server_info().unwrap().server_info.name, "stub");
        client.cleanup().await.unwrap();
    }

    #[tokio::test]
    async fn query_after_cleanup_is_rejected() {
        let mut client = Client::connect_transport(
            echo_server().start(),
            ScriptedBackend::new().reply_text("unused"),
            ConnectOptions::default(),
        )
        .await
        .unwrap();

        client.cleanup().await.unwrap();
        assert!(client.is_closed());
        let err = client.process_query("hi").await.unwrap_err();
        assert!(matches!(err, Error::Usage(_)));
    }
}
