//! Runtime abstractions for chat completion providers.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod models;
pub mod providers;

pub use models::{Direction, ModelError, ModelRegistry, ModelSpec, Pricing, TokenizerFamily};
pub use providers::OpenAIClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One message of a conversation as sent to the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Turn {
    pub fn user(content: impl Into<String>, name: Option<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            name,
        }
    }

    pub fn assistant(content: impl Into<String>, name: Option<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            name,
        }
    }
}

/// The assistant reply produced by one completion call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Completion {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
}

impl Completion {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            reasoning_content: None,
        }
    }

    pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning_content = Some(reasoning.into());
        self
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CompletionError {
    #[error("context length exceeded: {0}")]
    ContextLengthExceeded(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("provider returned HTTP {status}: {body}")]
    HttpStatus { status: u16, body: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("client configuration error: {0}")]
    Config(String),
    #[error("mock client has no queued response")]
    MockQueueEmpty,
}

impl CompletionError {
    /// The provider refused the request because the prompt is too long.
    pub fn is_context_length(&self) -> bool {
        matches!(self, Self::ContextLengthExceeded(_))
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited(_))
    }
}

/// A remote chat completion endpoint.
///
/// Implementations are expected to bound the duration of a call themselves;
/// callers do not impose deadlines.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    fn name(&self) -> &'static str;

    /// Sends `system` followed by `turns` to `model` and returns the reply.
    async fn complete(
        &self,
        system: &str,
        turns: &[Turn],
        model: &ModelSpec,
    ) -> Result<Completion, CompletionError>;
}

/// A request observed by [`MockCompletionClient`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedRequest {
    pub system: String,
    pub turns: Vec<Turn>,
    pub model: String,
}

#[derive(Debug, Default)]
pub struct MockCompletionClient {
    queue: Mutex<VecDeque<Result<Completion, CompletionError>>>,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl MockCompletionClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, result: Result<Completion, CompletionError>) {
        self.queue
            .lock()
            .expect("mock completion queue poisoned")
            .push_back(result);
    }

    pub fn enqueue_reply(&self, content: impl Into<String>) {
        self.enqueue(Ok(Completion::new(content)));
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests
            .lock()
            .expect("mock request log poisoned")
            .clone()
    }

    pub fn last_request(&self) -> Option<RecordedRequest> {
        self.requests
            .lock()
            .expect("mock request log poisoned")
            .last()
            .cloned()
    }
}

#[async_trait]
impl CompletionClient for MockCompletionClient {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn complete(
        &self,
        system: &str,
        turns: &[Turn],
        model: &ModelSpec,
    ) -> Result<Completion, CompletionError> {
        self.requests
            .lock()
            .expect("mock request log poisoned")
            .push(RecordedRequest {
                system: system.to_string(),
                turns: turns.to_vec(),
                model: model.wire_name.clone(),
            });

        self.queue
            .lock()
            .expect("mock completion queue poisoned")
            .pop_front()
            .unwrap_or(Err(CompletionError::MockQueueEmpty))
    }
}
