//! Language model integrations.
//!
//! The AI-assisted strategy only needs "send a system + user prompt, get text
//! back", so providers stay small. [`OpenAiProvider`] talks to any
//! OpenAI-compatible chat-completions endpoint.

mod openai;

pub use openai::OpenAiProvider;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Generation settings shared by providers.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelConfig {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub timeout: Duration,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".into(),
            max_tokens: 2000,
            temperature: 0.3,
            timeout: Duration::from_secs(120),
        }
    }
}

/// Prompt pair sent to the model.
#[derive(Debug, Clone)]
pub struct ModelPrompt {
    pub system: String,
    pub user: String,
    /// Ask the provider to constrain the answer to a JSON object.
    pub json_response: bool,
}

impl ModelPrompt {
    pub fn new(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            user: user.into(),
            json_response: false,
        }
    }

    pub fn expecting_json(mut self) -> Self {
        self.json_response = true;
        self
    }
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    fn name(&self) -> &'static str;
    async fn complete(&self, prompt: &ModelPrompt) -> Result<String, LanguageModelError>;
}

#[derive(Debug, Error)]
pub enum LanguageModelError {
    #[error("language model misconfigured: {0}")]
    Configuration(String),
    #[error("language model unreachable: {0}")]
    Unreachable(String),
    #[error("language model request timed out after {0:?}")]
    Timeout(Duration),
    #[error("language model provider error (status {status}): {message}")]
    Provider { status: u16, message: String },
    #[error("language model returned no content")]
    EmptyResponse,
    #[error("language model error: {0}")]
    Other(String),
}
