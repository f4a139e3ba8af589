use async_trait::async_trait;

use crate::trio::client_wrapper::{
    ClientWrapper, Completion, CompletionRequest, EmbeddingRequest,
};
use crate::trio::clients::common::{send_chat_completion, send_embedding};
use crate::trio::error::EngineError;
use crate::trio::http_client_pool::get_or_create_client;

/// Google's OpenAI-compatible surface for Gemini models.
pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/openai";

pub struct GeminiClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl GeminiClient {
    pub fn new(secret_key: &str) -> Self {
        Self::new_with_base_url(secret_key, DEFAULT_BASE_URL)
    }

    /// This function is used to create a GeminiClient with a custom base URL
    /// The default base URL is "<https://generativelanguage.googleapis.com/v1beta/openai>"
    pub fn new_with_base_url(secret_key: &str, base_url: &str) -> Self {
        GeminiClient {
            http: get_or_create_client(base_url),
            api_key: secret_key.to_string(),
            base_url: base_url.to_string(),
        }
    }
}

#[async_trait]
impl ClientWrapper for GeminiClient {
    fn name(&self) -> &str {
        "gemini"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, EngineError> {
        let result =
            send_chat_completion(&self.http, &self.base_url, &self.api_key, request).await;
        if let Err(err) = &result {
            log::error!("GeminiClient::complete error: {}", err);
        }
        result
    }

    async fn embed(&self, request: &EmbeddingRequest) -> Result<Vec<f32>, EngineError> {
        send_embedding(&self.http, &self.base_url, &self.api_key, request).await
    }
}
