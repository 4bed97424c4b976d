//! The conversation loop.
//!
//! One query runs through `Seeded -> AwaitingModel -> (DispatchingTools ->
//! AwaitingModel)* -> Done`. Tool calls from a single reply are dispatched
//! one at a time, in the order the model emitted them, and every result is
//! appended before the model is asked again.

use std::future::Future;
use std::time::Duration;

use tracing::{Instrument, Span};

use crate::model::{Backend, Message, ModelRequest, ToolCall, ToolResult, Usage};
use crate::tools::{ToolCatalog, ToolHost};
use crate::{Error, Result};

/// Default bound on model round-trips per query.
pub const DEFAULT_MAX_TURNS: usize = 16;

/// Limits applied to each query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineOptions {
    /// Maximum number of inference calls per query.
    pub max_turns: usize,
    pub inference_timeout: Option<Duration>,
    pub tool_timeout: Option<Duration>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            max_turns: DEFAULT_MAX_TURNS,
            inference_timeout: None,
            tool_timeout: None,
        }
    }
}

/// Result of a completed query.
#[derive(Debug, Clone)]
pub struct QueryOutcome {
    /// Concatenated text of the terminal reply.
    pub text: String,
    pub transcript: Vec<Message>,
    pub usage: Usage,
    /// Inference calls made.
    pub turns: usize,
}

enum State {
    Seeded,
    AwaitingModel,
    DispatchingTools(Vec<ToolCall>),
    Done(String),
}

/// Drives a model and a tool host through one query at a time.
pub struct Engine<B, H> {
    backend: B,
    tools: H,
    catalog: ToolCatalog,
    options: EngineOptions,
    transcript: Vec<Message>,
    span: Span,
}

impl<B: Backend, H: ToolHost> Engine<B, H> {
    pub fn new(backend: B, tools: H, catalog: ToolCatalog) -> Self {
        Self {
            backend,
            tools,
            catalog,
            options: EngineOptions::default(),
            transcript: Vec::new(),
            span: Span::none(),
        }
    }

    pub fn with_options(mut self, options: EngineOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn catalog(&self) -> &ToolCatalog {
        &self.catalog
    }

    /// Transcript of the most recent query.
    pub fn transcript(&self) -> &[Message] {
        &self.transcript
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Run one query to completion.
    ///
    /// The transcript is reset to the query alone; earlier queries are not
    /// remembered. On failure the transcript keeps everything appended up to
    /// the failing step.
    pub async fn process_query(&mut self, query: &str) -> Result<QueryOutcome> {
        let span = tracing::info_span!(parent: &self.span, "query", turns = tracing::field::Empty);
        self.run(query).instrument(span).await
    }

    async fn run(&mut self, query: &str) -> Result<QueryOutcome> {
        let mut usage = Usage::default();
        let mut turns = 0;
        let mut state = State::Seeded;

        loop {
            state = match state {
                State::Seeded => {
                    self.transcript.clear();
                    self.transcript.push(Message::user(query));
                    State::AwaitingModel
                }
                State::AwaitingModel => {
                    if turns >= self.options.max_turns {
                        tracing::warn!(limit = self.options.max_turns, "turn limit reached");
                        return Err(Error::TurnLimitExceeded {
                            limit: self.options.max_turns,
                        });
                    }
                    turns += 1;

                    let request = ModelRequest {
                        messages: &self.transcript,
                        tools: self.catalog.specs(),
                    };
                    let response = bounded(
                        self.options.inference_timeout,
                        "inference",
                        self.backend.call(request),
                    )
                    .await??;
                    usage += response.usage;

                    let reply = response.message;
                    let calls = reply.tool_calls();
                    tracing::debug!(turn = turns, tool_calls = calls.len(), "model replied");
                    if calls.is_empty() {
                        let text = reply.text();
                        self.transcript.push(reply);
                        State::Done(text)
                    } else {
                        self.transcript.push(reply);
                        State::DispatchingTools(calls)
                    }
                }
                State::DispatchingTools(calls) => {
                    for call in calls {
                        let output = self.dispatch(&call).await?;
                        self.transcript.push(Message::tool_result(ToolResult {
                            tool_call_id: call.id,
                            output,
                        }));
                    }
                    State::AwaitingModel
                }
                State::Done(text) => {
                    Span::current().record("turns", turns);
                    tracing::info!(
                        input_tokens = usage.input_tokens,
                        output_tokens = usage.output_tokens,
                        "query complete"
                    );
                    return Ok(QueryOutcome {
                        text,
                        transcript: self.transcript.clone(),
                        usage,
                        turns,
                    });
                }
            };
        }
    }

    async fn dispatch(&self, call: &ToolCall) -> Result<serde_json::Value> {
        tracing::debug!(tool = %call.name, id = %call.id, "calling tool");
        let operation = format!("tool `{}`", call.name);
        let result = bounded(self.options.tool_timeout, &operation, self.tools.execute(call)).await;

        match result {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(err)) => {
                tracing::warn!(tool = %call.name, error = %err, "tool call failed");
                Err(match err {
                    Error::ToolInvocation { .. } | Error::Timeout { .. } | Error::Transport(_) => err,
                    other => Error::ToolInvocation {
                        name: call.name.clone(),
                        cause: other.to_string(),
                    },
                })
            }
            Err(err) => {
                tracing::warn!(tool = %call.name, error = %err, "tool call timed out");
                Err(err)
            }
        }
    }
}

/// Await `fut`, failing with [`Error::Timeout`] once `limit` elapses.
async fn bounded<F: Future>(
    limit: Option<Duration>,
    operation: &str,
    fut: F,
) -> Result<F::Output> {
    match limit {
        Some(after) => tokio::time::timeout(after, fut)
            .await
            .map_err(|_| Error::Timeout {
                operation: operation.to_string(),
                after,
            }),
        None => Ok(fut.await),
    }
}
