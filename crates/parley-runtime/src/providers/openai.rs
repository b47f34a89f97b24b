//! OpenAI Chat Completions client
//!
//! Works against any OpenAI-compatible endpoint. Provider failures are
//! classified into [`CompletionError`] variants so callers never match on
//! error strings.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;
use tracing::debug;

use crate::{Completion, CompletionClient, CompletionError, ModelSpec, Role, Turn};

const OPENAI_API_BASE: &str = "https://api.openai.com/v1";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);
const CONTEXT_LENGTH_CODE: &str = "context_length_exceeded";
const CONTEXT_LENGTH_PHRASE: &str = "maximum context length";

#[derive(Debug, Clone)]
pub struct OpenAIClient {
    client: Client,
    api_key: String,
    base_url: String,
}

impl OpenAIClient {
    /// Build a client from `OPENAI_API_KEY` and optional `OPENAI_API_BASE`.
    pub fn from_env(timeout: Option<Duration>) -> Result<Self, CompletionError> {
        let api_key = env::var("OPENAI_API_KEY").map_err(|_| {
            CompletionError::Config("OPENAI_API_KEY environment variable must be set".to_string())
        })?;

        let base_url = env::var("OPENAI_API_BASE").unwrap_or_else(|_| OPENAI_API_BASE.to_string());

        Self::new(api_key, base_url, timeout.unwrap_or(DEFAULT_TIMEOUT))
    }

    pub fn new(
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, CompletionError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| CompletionError::Config(err.to_string()))?;

        Ok(Self {
            client,
            api_key: api_key.into(),
            base_url: base_url.into(),
        })
    }

    pub fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    fn payload<'a>(system: &'a str, turns: &'a [Turn], model: &'a ModelSpec) -> ChatRequest<'a> {
        let mut messages = Vec::with_capacity(turns.len() + 1);
        messages.push(ChatMessage {
            role: Role::System,
            content: system,
            name: None,
        });
        messages.extend(turns.iter().map(|turn| ChatMessage {
            role: turn.role,
            content: &turn.content,
            name: turn.name.as_deref(),
        }));

        ChatRequest {
            model: &model.wire_name,
            messages,
        }
    }

    async fn classify_error(status: StatusCode, response: reqwest::Response) -> CompletionError {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<unable to read body>".to_string());

        let detail = serde_json::from_str::<ErrorEnvelope>(&body)
            .ok()
            .map(|envelope| envelope.error);
        let message = detail
            .as_ref()
            .map_or_else(|| body.clone(), |detail| detail.message.clone());

        if status == StatusCode::TOO_MANY_REQUESTS {
            return CompletionError::RateLimited(message);
        }

        let code_says_too_long = detail
            .as_ref()
            .and_then(|detail| detail.code.as_deref())
            .is_some_and(|code| code == CONTEXT_LENGTH_CODE);
        if status == StatusCode::BAD_REQUEST
            && (code_says_too_long || message.to_lowercase().contains(CONTEXT_LENGTH_PHRASE))
        {
            return CompletionError::ContextLengthExceeded(message);
        }

        CompletionError::HttpStatus {
            status: status.as_u16(),
            body: message,
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: Role,
    content: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    message: String,
    #[serde(default)]
    code: Option<String>,
}

#[async_trait]
impl CompletionClient for OpenAIClient {
    fn name(&self) -> &'static str {
        "openai"
    }

    async fn complete(
        &self,
        system: &str,
        turns: &[Turn],
        model: &ModelSpec,
    ) -> Result<Completion, CompletionError> {
        let payload = Self::payload(system, turns, model);
        debug!(model = %model.wire_name, turns = turns.len(), "sending chat completion");

        let response = self
            .client
            .post(self.endpoint("/chat/completions"))
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|err| CompletionError::Transport(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Self::classify_error(status, response).await);
        }

        let body: ChatResponse = response
            .json()
            .await
            .map_err(|err| CompletionError::Decode(err.to_string()))?;

        let first_choice = body
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| CompletionError::Decode("missing choice in response".to_string()))?;

        Ok(Completion {
            role: Role::Assistant,
            content: first_choice.message.content.unwrap_or_default(),
            reasoning_content: first_choice.message.reasoning_content,
        })
    }
}
