//! Error taxonomy shared by every layer of the engine.
//!
//! All failures that can reach a client are expressed as an [`EngineError`]. The
//! orchestrators never turn these into hard connection failures; instead the request
//! supervisor pushes [`EngineError::client_message`] into the stream's `error` field.
//!
//! # Examples
//!
//! ```
//! use trio::error::EngineError;
//!
//! let err = EngineError::UnsupportedModel("claude-3".into());
//! assert_eq!(err.to_string(), "Unsupported model: claude-3");
//! ```

use std::error::Error;
use std::fmt;

/// Errors produced while orchestrating a chat turn or reflection exchange.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineError {
    /// Bad or oversized input. Reported before anything is persisted.
    Validation(String),

    /// No authenticated principal accompanied the request.
    Unauthenticated,

    /// A chat or agent does not exist or is not owned by the caller.
    NotFound(String),

    /// No completion backend is registered for the model prefix.
    UnsupportedModel(String),

    /// A completion or embedding backend call failed.
    Gateway(String),

    /// A database or similarity-store write failed.
    Persistence(String),

    /// The evaluator's structured response could not be parsed.
    StructuredOutputParse(String),

    /// A prompt template is missing or failed to render.
    Render(String),

    /// The request deadline elapsed.
    Timeout,

    /// The request was cancelled (deadline or client disconnect) while work was in flight.
    Cancelled,

    /// The engine was configured inconsistently (e.g. embedding dimensions).
    Configuration(String),
}

impl EngineError {
    /// Text pushed to the client through the stream's error field.
    ///
    /// Persistence failures are summarised; their cause is only logged.
    ///
    /// ```
    /// use trio::error::EngineError;
    ///
    /// let err = EngineError::Persistence("disk I/O error".into());
    /// assert_eq!(err.client_message(), "An error occurred while saving your message");
    /// ```
    pub fn client_message(&self) -> String {
        match self {
            EngineError::Persistence(_) => {
                "An error occurred while saving your message".to_string()
            }
            EngineError::Timeout => "Request timeout exceeded".to_string(),
            other => other.to_string(),
        }
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Validation(msg) => write!(f, "{}", msg),
            EngineError::Unauthenticated => write!(f, "User not authenticated"),
            EngineError::NotFound(what) => write!(f, "{} not found", what),
            EngineError::UnsupportedModel(model) => write!(f, "Unsupported model: {}", model),
            EngineError::Gateway(msg) => write!(f, "Model backend error: {}", msg),
            EngineError::Persistence(msg) => write!(f, "Persistence error: {}", msg),
            EngineError::StructuredOutputParse(msg) => {
                write!(f, "Could not parse evaluator response: {}", msg)
            }
            EngineError::Render(msg) => write!(f, "Prompt rendering failed: {}", msg),
            EngineError::Timeout => write!(f, "Request timeout exceeded"),
            EngineError::Cancelled => write!(f, "Request cancelled"),
            EngineError::Configuration(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl Error for EngineError {}

impl From<rusqlite::Error> for EngineError {
    fn from(err: rusqlite::Error) -> Self {
        EngineError::Persistence(err.to_string())
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(err: reqwest::Error) -> Self {
        EngineError::Gateway(err.to_string())
    }
}

impl From<minijinja::Error> for EngineError {
    fn from(err: minijinja::Error) -> Self {
        EngineError::Render(err.to_string())
    }
}
