//! LLM integration.
//!
//! A small provider trait with one OpenAI-compatible chat-completions
//! backend, and the two outreach uses built on it: writing messages
//! ([`compose`]) and classifying replies ([`classify`]).

pub mod classify;
pub mod compose;
pub mod openai;

pub use classify::{LlmReplyClassifier, ReplyClassifier};
pub use compose::{ContentGenerator, GeneratedEmail, LlmContentGenerator};
pub use openai::OpenAiProvider;

use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::LlmError;

/// Who authored a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// A single completion call.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    /// Ask the backend for a JSON object response.
    pub json_response: bool,
}

impl CompletionRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            max_tokens: None,
            temperature: None,
            json_response: false,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn json(mut self) -> Self {
        self.json_response = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    Length,
    Other,
}

#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub content: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub finish_reason: FinishReason,
}

/// A chat-completion backend.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn model_name(&self) -> &str;

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError>;
}

/// Configuration for creating an LLM provider.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_key: secrecy::SecretString,
    pub model: String,
    /// Base URL of an OpenAI-compatible API, without the trailing path.
    pub base_url: String,
}

impl LlmConfig {
    pub const DEFAULT_MODEL: &'static str = "gpt-4o-mini";
    pub const DEFAULT_BASE_URL: &'static str = "https://api.openai.com/v1";

    /// Returns `None` when no API key is configured (generation disabled).
    pub fn from_lookup(get: &impl Fn(&str) -> Option<String>) -> Option<Self> {
        let api_key = get("LLM_API_KEY")
            .or_else(|| get("OPENAI_API_KEY"))
            .filter(|k| !k.trim().is_empty())?;

        Some(Self {
            api_key: secrecy::SecretString::from(api_key),
            model: get("LLM_MODEL").unwrap_or_else(|| Self::DEFAULT_MODEL.to_string()),
            base_url: get("LLM_BASE_URL")
                .map(|u| u.trim_end_matches('/').to_string())
                .unwrap_or_else(|| Self::DEFAULT_BASE_URL.to_string()),
        })
    }
}

/// Create an LLM provider from configuration.
pub fn create_provider(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
    let provider = OpenAiProvider::new(config)?;
    tracing::info!("Using OpenAI-compatible API (model: {})", config.model);
    Ok(Arc::new(provider))
}

static FENCED_JSON: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```").expect("static regex")
});

/// Pull a JSON object out of model output that may be wrapped in a
/// markdown fence or surrounded by prose.
pub(crate) fn extract_json_object(text: &str) -> &str {
    let trimmed = text.trim();
    if trimmed.starts_with('{') {
        return trimmed;
    }
    if let Some(inner) = FENCED_JSON.captures(trimmed).and_then(|c| c.get(1)) {
        return inner.as_str();
    }
    match (trimmed.find('{'), trimmed.rfind('}')) {
        (Some(start), Some(end)) if end > start => &trimmed[start..=end],
        _ => trimmed,
    }
}
