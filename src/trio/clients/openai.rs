//! The `OpenAIClient` struct implements `ClientWrapper` for OpenAI's Chat
//! Completions and Embeddings APIs.
//!
//! # Example
//!
//! ```rust,no_run
//! use trio::clients::openai::OpenAIClient;
//! use trio::client_wrapper::{ClientWrapper, CompletionRequest};
//!
//! #[tokio::main]
//! async fn main() {
//!     let secret_key = std::env::var("OPENAI_API_KEY").expect("OPENAI_API_KEY not set");
//!     let client = OpenAIClient::new(&secret_key);
//!
//!     let request = CompletionRequest::new("gpt-4o-mini", "You are an assistant.", "Hello!");
//!     let completion = client.complete(&request).await.unwrap();
//!     println!("Assistant: {}", completion.text);
//! }
//! ```
use async_trait::async_trait;

use crate::trio::client_wrapper::{
    ClientWrapper, Completion, CompletionRequest, EmbeddingRequest,
};
use crate::trio::clients::common::{send_chat_completion, send_embedding};
use crate::trio::error::EngineError;
use crate::trio::http_client_pool::get_or_create_client;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Client wrapper for OpenAI (and any OpenAI-compatible endpoint).
///
/// The model is chosen per request; a single instance serves both the `gpt` and
/// `text-embedding` families.
pub struct OpenAIClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl OpenAIClient {
    pub fn new(secret_key: &str) -> Self {
        Self::new_with_base_url(secret_key, DEFAULT_BASE_URL)
    }

    /// Construct a client targeting a custom OpenAI compatible base URL.
    pub fn new_with_base_url(secret_key: &str, base_url: &str) -> Self {
        OpenAIClient {
            http: get_or_create_client(base_url),
            api_key: secret_key.to_string(),
            base_url: base_url.to_string(),
        }
    }
}

#[async_trait]
impl ClientWrapper for OpenAIClient {
    fn name(&self) -> &str {
        "openai"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, EngineError> {
        send_chat_completion(&self.http, &self.base_url, &self.api_key, request).await
    }

    async fn embed(&self, request: &EmbeddingRequest) -> Result<Vec<f32>, EngineError> {
        send_embedding(&self.http, &self.base_url, &self.api_key, request).await
    }
}
