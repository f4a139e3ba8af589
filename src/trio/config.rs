//! Configuration for trio.
//!
//! Two plain structs cover everything: [`EngineConfig`] holds the orchestration
//! tunables (models, limits, deadline, collection names) and [`TrioConfig`] wraps it
//! with process-level settings (database path, bind address, provider keys).
//! Users construct them manually or through [`TrioConfig::from_env`]; no
//! configuration-file parsing dependencies are required.
//!
//! # Example
//!
//! ```rust
//! use trio::EngineConfig;
//!
//! let config = EngineConfig {
//!     max_reflection_iterations: 3,
//!     ..EngineConfig::default()
//! };
//! assert!(config.validate().is_ok());
//! assert_eq!(config.max_message_length, 400);
//! ```

use crate::trio::error::EngineError;
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Collection holding embeddings of agent messages from basic chats.
pub const BASIC_MESSAGES_COLLECTION: &str = "basic_messages";
/// Collection holding embeddings of accepted reflection exchanges.
pub const REFLECTION_MESSAGES_COLLECTION: &str = "reflection_messages";

/// Tunables consumed by the orchestrators.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Model answering as an agent in basic chats.
    pub response_model: String,
    /// Model producing drafts in reflection exchanges.
    pub answerer_model: String,
    /// Model judging drafts in reflection exchanges. Must support JSON output.
    pub evaluator_model: String,
    /// Model used for both write-time and query-time embeddings.
    pub embedding_model: String,
    /// Vector size requested from the embedding model and used by the collections.
    pub embedding_dimensions: usize,
    /// Inbound messages longer than this many characters are rejected.
    pub max_message_length: usize,
    /// Number of history entries handed to each prompt.
    pub history_limit: usize,
    /// Number of semantically retrieved entries handed to each prompt.
    pub context_limit: usize,
    /// Iteration index at which the current draft is force-accepted.
    ///
    /// Iterations are counted from zero, so an exchange produces at most
    /// `max_reflection_iterations + 1` answers.
    pub max_reflection_iterations: usize,
    /// Wall-clock budget for one request.
    pub request_timeout: Duration,
    pub basic_collection: String,
    pub reflection_collection: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            response_model: "gpt-4o-mini".to_string(),
            answerer_model: "gpt-4.1-nano-2025-04-14".to_string(),
            evaluator_model: "gpt-4.1-nano-2025-04-14".to_string(),
            embedding_model: "text-embedding-3-small".to_string(),
            embedding_dimensions: 1536,
            max_message_length: 400,
            history_limit: 10,
            context_limit: 10,
            max_reflection_iterations: 5,
            request_timeout: Duration::from_secs(300),
            basic_collection: BASIC_MESSAGES_COLLECTION.to_string(),
            reflection_collection: REFLECTION_MESSAGES_COLLECTION.to_string(),
        }
    }
}

impl EngineConfig {
    /// Reject settings that would only fail later, mid-request.
    pub fn validate(&self) -> Result<(), EngineError> {
        let models = [
            ("response_model", &self.response_model),
            ("answerer_model", &self.answerer_model),
            ("evaluator_model", &self.evaluator_model),
            ("embedding_model", &self.embedding_model),
        ];
        for (field, value) in models {
            if value.trim().is_empty() {
                return Err(EngineError::Configuration(format!("{} is empty", field)));
            }
        }
        if self.embedding_dimensions == 0 {
            return Err(EngineError::Configuration(
                "embedding_dimensions must be positive".into(),
            ));
        }
        if self.max_message_length == 0 || self.history_limit == 0 || self.context_limit == 0 {
            return Err(EngineError::Configuration(
                "message, history and context limits must be positive".into(),
            ));
        }
        if self.request_timeout.is_zero() {
            return Err(EngineError::Configuration(
                "request_timeout must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Process-level configuration for the `trio-server` binary.
#[derive(Debug, Clone)]
pub struct TrioConfig {
    pub database_path: PathBuf,
    pub bind_addr: SocketAddr,
    pub openai_api_key: Option<String>,
    pub openai_base_url: Option<String>,
    pub gemini_api_key: Option<String>,
    pub gemini_base_url: Option<String>,
    /// REST endpoint of Qdrant, e.g. `http://localhost:6333`. When unset the
    /// in-memory similarity store is used.
    pub qdrant_url: Option<String>,
    pub qdrant_api_key: Option<String>,
    /// Directory holding template overrides; built-in templates are used otherwise.
    pub template_dir: Option<PathBuf>,
    pub engine: EngineConfig,
}

impl Default for TrioConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("trio.db"),
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            openai_api_key: None,
            openai_base_url: None,
            gemini_api_key: None,
            gemini_base_url: None,
            qdrant_url: None,
            qdrant_api_key: None,
            template_dir: None,
            engine: EngineConfig::default(),
        }
    }
}

impl TrioConfig {
    /// Build a configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, EngineError> {
        let mut config = TrioConfig::default();

        if let Some(path) = non_empty_var("TRIO_DATABASE_PATH") {
            config.database_path = PathBuf::from(path);
        }
        if let Some(addr) = non_empty_var("TRIO_BIND_ADDR") {
            config.bind_addr = addr.parse().map_err(|e| {
                EngineError::Configuration(format!("invalid TRIO_BIND_ADDR {}: {}", addr, e))
            })?;
        } else if let Some(port) = non_empty_var("PORT") {
            let port: u16 = port
                .parse()
                .map_err(|e| EngineError::Configuration(format!("invalid PORT {}: {}", port, e)))?;
            config.bind_addr = SocketAddr::from(([0, 0, 0, 0], port));
        }

        config.openai_api_key = non_empty_var("OPENAI_API_KEY");
        config.openai_base_url = non_empty_var("OPENAI_BASE_URL");
        config.gemini_api_key = non_empty_var("GEMINI_API_KEY");
        config.gemini_base_url = non_empty_var("GEMINI_BASE_URL");
        config.qdrant_url = non_empty_var("QDRANT_URL");
        config.qdrant_api_key = non_empty_var("QDRANT_API_KEY");
        config.template_dir = non_empty_var("TRIO_TEMPLATE_DIR").map(PathBuf::from);

        if let Some(model) = non_empty_var("TRIO_RESPONSE_MODEL") {
            config.engine.response_model = model;
        }
        if let Some(model) = non_empty_var("TRIO_ANSWERER_MODEL") {
            config.engine.answerer_model = model;
        }
        if let Some(model) = non_empty_var("TRIO_EVALUATOR_MODEL") {
            config.engine.evaluator_model = model;
        }
        if let Some(model) = non_empty_var("TRIO_EMBEDDING_MODEL") {
            config.engine.embedding_model = model;
        }

        config.engine.validate()?;
        Ok(config)
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}
