//! Wire types and request helpers shared by every OpenAI-compatible backend.
//!
//! Both the OpenAI and the Gemini clients speak the `/chat/completions` and
//! `/embeddings` dialect; they only differ in base URL and in which model families
//! they are registered for.

use serde::{Deserialize, Serialize};

use crate::trio::client_wrapper::{
    Completion, CompletionRequest, EmbeddingRequest, ResponseFormat, TokenUsage,
};
use crate::trio::error::EngineError;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct ChatCompletionBody<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<WireResponseFormat>,
    #[serde(skip_serializing_if = "Option::is_none")]
    user: Option<String>,
}

#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct WireResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: usize,
    #[serde(default)]
    completion_tokens: usize,
    #[serde(default)]
    total_tokens: usize,
}

#[derive(Debug, Serialize)]
struct EmbeddingBody<'a> {
    model: &'a str,
    input: &'a str,
    encoding_format: &'static str,
    dimensions: usize,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    #[serde(default)]
    data: Vec<EmbeddingDatum>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Send a chat completion and return the assistant's content and usage.
///
/// A missing `content` (e.g. a refusal) is returned as an empty string; deciding
/// what an empty answer means is left to the orchestrators.
pub async fn send_chat_completion(
    http: &reqwest::Client,
    base_url: &str,
    api_key: &str,
    request: &CompletionRequest,
) -> Result<Completion, EngineError> {
    let body = ChatCompletionBody {
        model: &request.model,
        messages: vec![
            WireMessage {
                role: "system",
                content: &request.system_prompt,
            },
            WireMessage {
                role: "user",
                content: &request.user_prompt,
            },
        ],
        response_format: match request.response_format {
            ResponseFormat::Text => None,
            ResponseFormat::Json => Some(WireResponseFormat {
                kind: "json_object",
            }),
        },
        user: request.user_id.map(|id| id.to_string()),
    };

    let url = format!("{}/chat/completions", base_url.trim_end_matches('/'));
    let response = http
        .post(&url)
        .bearer_auth(api_key)
        .json(&body)
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        log::error!(
            "trio::clients::common::send_chat_completion(...): {} returned {}: {}",
            url,
            status,
            text
        );
        return Err(EngineError::Gateway(format!("{} returned {}", request.model, status)));
    }

    let parsed: ChatCompletionResponse = response.json().await?;
    let text = parsed
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .unwrap_or_default();
    let usage = parsed.usage.map(|u| TokenUsage {
        input_tokens: u.prompt_tokens,
        output_tokens: u.completion_tokens,
        total_tokens: u.total_tokens,
    });

    Ok(Completion { text, usage })
}

/// Request a single float embedding of the requested size.
pub async fn send_embedding(
    http: &reqwest::Client,
    base_url: &str,
    api_key: &str,
    request: &EmbeddingRequest,
) -> Result<Vec<f32>, EngineError> {
    let body = EmbeddingBody {
        model: &request.model,
        input: &request.input,
        encoding_format: "float",
        dimensions: request.dimensions,
    };

    let url = format!("{}/embeddings", base_url.trim_end_matches('/'));
    let response = http
        .post(&url)
        .bearer_auth(api_key)
        .json(&body)
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        log::error!(
            "trio::clients::common::send_embedding(...): {} returned {}: {}",
            url,
            status,
            text
        );
        return Err(EngineError::Gateway(format!("{} returned {}", request.model, status)));
    }

    let parsed: EmbeddingResponse = response.json().await?;
    parsed
        .data
        .into_iter()
        .next()
        .map(|datum| datum.embedding)
        .ok_or_else(|| EngineError::Gateway("embedding response contained no data".into()))
}
