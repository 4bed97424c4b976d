//! Test doubles for the inference side of the conversation loop.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;

use crate::model::{
    Backend, Message, ModelError, ModelRequest, ModelResponse, Part, Role, ToolCall, Usage,
};

/// Replays a fixed sequence of model replies.
///
/// Every request is recorded so tests can inspect the transcript the engine
/// sent. Running out of replies is an inference failure.
#[derive(Clone, Default)]
pub struct ScriptedBackend {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    replies: Mutex<VecDeque<Result<Message, ModelError>>>,
    requests: Mutex<Vec<Vec<Message>>>,
    delay: Mutex<Option<Duration>>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a plain text reply.
    pub fn reply_text(self, text: impl Into<String>) -> Self {
        self.reply(Message::assistant(text))
    }

    /// Queue a reply that asks for one tool call.
    pub fn reply_tool_call(self, id: &str, name: &str, input: Value) -> Self {
        self.reply(Message {
            role: Role::Assistant,
            parts: vec![Part::ToolCall(ToolCall {
                id: id.to_string(),
                name: name.to_string(),
                input,
            })],
        })
    }

    pub fn reply(self, message: Message) -> Self {
        self.push(Ok(message));
        self
    }

    pub fn fail(self, error: ModelError) -> Self {
        self.push(Err(error));
        self
    }

    /// Hold every reply back for `delay`.
    pub fn with_delay(self, delay: Duration) -> Self {
        *self.inner.delay.lock().unwrap() = Some(delay);
        self
    }

    /// Transcripts received so far, one per call.
    pub fn requests(&self) -> Vec<Vec<Message>> {
        self.inner.requests.lock().unwrap().clone()
    }

    fn push(&self, reply: Result<Message, ModelError>) {
        self.inner.replies.lock().unwrap().push_back(reply);
    }
}

impl Backend for ScriptedBackend {
    async fn call(&self, request: ModelRequest<'_>) -> Result<ModelResponse, ModelError> {
        self.inner
            .requests
            .lock()
            .unwrap()
            .push(request.messages.to_vec());

        let delay = *self.inner.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let reply = self.inner.replies.lock().unwrap().pop_front();
        let message = reply.unwrap_or_else(|| {
            Err(ModelError::InvalidResponse("script exhausted".to_string()))
        })?;

        Ok(ModelResponse {
            message,
            usage: Usage {
                input_tokens: 10,
                output_tokens: 5,
            },
        })
    }
}
