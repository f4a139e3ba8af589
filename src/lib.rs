//! # Trio
//!
//! Trio is a conversational orchestration engine. A user talks to a chat; the engine decides
//! which language-model calls to make, in what order, with which prompts, persists every
//! message, and streams cumulative progress snapshots back while the work is in flight.
//!
//! Two chat flavours are supported:
//!
//! * **Basic chats** hold a roster of named agents, each with a list of character traits.
//!   Every user message starts a turn: the [`TurnOrchestrator`] asks each agent in a freshly
//!   shuffled order, and agents that judge the message is not for them stay silent.
//! * **Reflection chats** run an answer → evaluate → revise loop through the
//!   [`ReflectionLoop`] until the evaluator accepts a draft or the iteration cap is reached.
//!   The whole exchange is persisted atomically.
//!
//! Everything the orchestrators talk to is injected through [`services::Services`]:
//!
//! * [`storage::SqliteStore`] for relational records
//! * [`gateway::CompletionGateway`] routing model names to [`ClientWrapper`] backends
//! * [`context::ContextRetriever`] for history and similarity recall over a
//!   [`vector_store::VectorStore`] (in memory or [`qdrant::QdrantStore`])
//! * [`prompt::PromptRenderer`] rendering minijinja templates from an
//!   [`prompt::InformationBank`]
//!
//! Progress reaches the client through an [`stream::UpdateChannel`], and
//! [`supervisor::supervise`] enforces the per-request deadline.
//!
//! ## Wiring an engine
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use trio::clients::openai::OpenAIClient;
//! use trio::gateway::CompletionGateway;
//! use trio::prompt::PromptRenderer;
//! use trio::services::Services;
//! use trio::storage::SqliteStore;
//! use trio::vector_store::InMemoryVectorStore;
//! use trio::{EngineConfig, TurnOrchestrator};
//!
//! fn main() -> Result<(), trio::error::EngineError> {
//!     let openai = Arc::new(OpenAIClient::new(&std::env::var("OPENAI_API_KEY").unwrap_or_default()));
//!     let gateway = CompletionGateway::new()
//!         .with_route("gpt", openai.clone())
//!         .with_route("text-embedding", openai);
//!
//!     let services = Services::new(
//!         Arc::new(SqliteStore::open("trio.db")?),
//!         Arc::new(InMemoryVectorStore::new()),
//!         Arc::new(gateway),
//!         Arc::new(PromptRenderer::builtin()?),
//!         EngineConfig::default(),
//!     );
//!     let _turns = TurnOrchestrator::new(services);
//!     Ok(())
//! }
//! ```

use std::sync::Once;

static INIT_LOGGER: Once = Once::new();

/// Initialise the global [`env_logger`] subscriber exactly once.
///
/// ```rust
/// trio::init_logger();
/// log::info!("Logger is ready");
/// ```
pub fn init_logger() {
    INIT_LOGGER.call_once(|| {
        env_logger::init();
    });
}

// Import the top-level `trio` module.
pub mod trio;

// Re-exporting key items for easier external access.
pub use trio::auth;
pub use trio::client_wrapper;
pub use trio::client_wrapper::{ClientWrapper, Completion, CompletionRequest, TokenUsage};
pub use trio::clients;
pub use trio::config;
pub use trio::config::{EngineConfig, TrioConfig};
pub use trio::context;
pub use trio::error;
pub use trio::error::EngineError;
pub use trio::event;
pub use trio::event::{EventHandler, ReflectionEvent, TurnEvent};
pub use trio::gateway;
pub use trio::http_client_pool;
pub use trio::models;
pub use trio::orchestration;
pub use trio::prompt;
pub use trio::qdrant;
pub use trio::reflection;
#[cfg(feature = "server")]
pub use trio::server;
pub use trio::services;
pub use trio::storage;
pub use trio::stream;
pub use trio::supervisor;
pub use trio::vector_store;
pub use trio::{ReflectionLoop, TurnOrchestrator};
