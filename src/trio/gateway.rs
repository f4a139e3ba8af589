//! Uniform completion and embedding access over heterogeneous backends.
//!
//! The [`CompletionGateway`] owns a routing table from model-name prefix to a
//! [`ClientWrapper`]. Every call races the backend against the caller's
//! [`CancellationToken`], so a fired deadline or a disconnected client stops the
//! in-flight request instead of waiting for the provider to answer.
//!
//! ```rust
//! use std::sync::Arc;
//! use trio::gateway::CompletionGateway;
//! use trio::clients::openai::OpenAIClient;
//!
//! let openai = Arc::new(OpenAIClient::new("sk-test"));
//! let gateway = CompletionGateway::new()
//!     .with_route("gpt", openai.clone())
//!     .with_route("text-embedding", openai);
//!
//! assert!(gateway.supports("gpt-4o-mini"));
//! assert!(!gateway.supports("claude-3-5-sonnet"));
//! ```

use std::sync::Arc;

use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use crate::trio::client_wrapper::{
    ClientWrapper, Completion, CompletionRequest, EmbeddingRequest,
};
use crate::trio::error::EngineError;

/// Routes requests to a backend by the longest registered prefix of the model id.
#[derive(Clone, Default)]
pub struct CompletionGateway {
    routes: Vec<(String, Arc<dyn ClientWrapper>)>,
}

impl CompletionGateway {
    pub fn new() -> Self {
        Self { routes: Vec::new() }
    }

    /// Register `client` for every model whose id starts with `prefix`.
    pub fn with_route(mut self, prefix: impl Into<String>, client: Arc<dyn ClientWrapper>) -> Self {
        self.add_route(prefix, client);
        self
    }

    pub fn add_route(&mut self, prefix: impl Into<String>, client: Arc<dyn ClientWrapper>) {
        let prefix = prefix.into();
        self.routes.retain(|(existing, _)| *existing != prefix);
        self.routes.push((prefix, client));
    }

    pub fn supports(&self, model: &str) -> bool {
        self.resolve(model).is_ok()
    }

    fn resolve(&self, model: &str) -> Result<&Arc<dyn ClientWrapper>, EngineError> {
        self.routes
            .iter()
            .filter(|(prefix, _)| model.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, client)| client)
            .ok_or_else(|| EngineError::UnsupportedModel(model.to_string()))
    }

    /// Run one completion, aborting promptly if `cancel` fires first.
    pub async fn complete(
        &self,
        request: &CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<Completion, EngineError> {
        let client = self.resolve(&request.model)?;
        log::debug!(
            "trio::gateway: completion on {} via {}",
            request.model,
            client.name()
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(EngineError::Cancelled),
            result = client.complete(request) => result,
        }
    }

    /// Embed `request.input`, checking the vector has the configured size.
    pub async fn embed(
        &self,
        request: &EmbeddingRequest,
        cancel: &CancellationToken,
    ) -> Result<Vec<f32>, EngineError> {
        let client = self.resolve(&request.model)?;

        let vector = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            result = client.embed(request) => result?,
        };

        if vector.len() != request.dimensions {
            return Err(EngineError::Configuration(format!(
                "{} returned {} dimensions, expected {}",
                request.model,
                vector.len(),
                request.dimensions
            )));
        }
        Ok(vector)
    }
}

/// Parse a structured model response, tolerating surrounding whitespace and a
/// single Markdown code fence.
pub fn parse_structured<T: DeserializeOwned>(raw: &str) -> Result<T, EngineError> {
    let mut text = raw.trim();
    if let Some(rest) = text.strip_prefix("```") {
        // Drop the info string ("json") up to the first newline.
        let rest = match rest.find('\n') {
            Some(idx) => &rest[idx + 1..],
            None => rest,
        };
        text = rest.trim_end().strip_suffix("```").unwrap_or(rest).trim();
    }

    serde_json::from_str(text).map_err(|err| {
        log::warn!("trio::gateway: unparseable structured response: {}", err);
        EngineError::StructuredOutputParse(err.to_string())
    })
}
