use crate::trio::error::EngineError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A ClientWrapper is a wrapper around a specific cloud LLM service.
/// It provides a common interface for text completion and text embedding.
/// It does not pick models or keep conversation state; the
/// [`CompletionGateway`](crate::gateway::CompletionGateway) selects a wrapper by
/// model prefix and the orchestrators assemble every prompt from scratch.
// src/trio/client_wrapper

/// Output format requested from the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseFormat {
    #[default]
    Text,
    /// Strict JSON object output. The evaluator step depends on this.
    Json,
}

/// How many tokens were spent on prompt vs. completion.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: usize,
    pub output_tokens: usize,
    pub total_tokens: usize,
}

/// A single system + user prompt pair sent to a model.
#[derive(Clone, Debug)]
pub struct CompletionRequest {
    pub system_prompt: String,
    pub user_prompt: String,
    pub model: String,
    /// Internal id of the user the call is made for, forwarded for abuse attribution.
    pub user_id: Option<i64>,
    pub response_format: ResponseFormat,
}

impl CompletionRequest {
    pub fn new(
        model: impl Into<String>,
        system_prompt: impl Into<String>,
        user_prompt: impl Into<String>,
    ) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            user_prompt: user_prompt.into(),
            model: model.into(),
            user_id: None,
            response_format: ResponseFormat::Text,
        }
    }

    pub fn for_user(mut self, user_id: i64) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn with_response_format(mut self, format: ResponseFormat) -> Self {
        self.response_format = format;
        self
    }
}

/// The text a model produced plus whatever usage the provider reported.
#[derive(Clone, Debug)]
pub struct Completion {
    pub text: String,
    pub usage: Option<TokenUsage>,
}

/// Text to embed with a specific model and vector size.
#[derive(Clone, Debug)]
pub struct EmbeddingRequest {
    pub input: String,
    pub model: String,
    pub dimensions: usize,
}

impl EmbeddingRequest {
    pub fn new(input: impl Into<String>, model: impl Into<String>, dimensions: usize) -> Self {
        Self {
            input: input.into(),
            model: model.into(),
            dimensions,
        }
    }
}

/// Trait defining the interface to interact with various LLM services.
#[async_trait]
pub trait ClientWrapper: Send + Sync {
    /// Short backend name used in logs (e.g. `"openai"`).
    fn name(&self) -> &str;

    /// Run a single completion and return the assistant's content.
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, EngineError>;

    /// Embed a piece of text.
    /// This method has a default implementation that returns an error so
    /// completion-only backends don't have to implement it.
    async fn embed(&self, request: &EmbeddingRequest) -> Result<Vec<f32>, EngineError> {
        Err(EngineError::UnsupportedModel(format!(
            "{} (embeddings are not supported by {})",
            request.model,
            self.name()
        )))
    }
}
