//! Turn and reflection event system.
//!
//! Provides a callback-based observability layer for both orchestrators.
//! Implement [`EventHandler`] to receive real-time notifications about:
//!
//! - **Basic chat turns**: turn start, each agent's answer, skip or failure, turn end
//! - **Reflection exchanges**: iteration boundaries, evaluator verdicts, the terminal state
//!
//! # Architecture
//!
//! Events flow through a single [`EventHandler`] trait with two methods:
//! - [`on_turn_event`](EventHandler::on_turn_event) receives [`TurnEvent`]s from the
//!   [`TurnOrchestrator`](crate::orchestration::TurnOrchestrator)
//! - [`on_reflection_event`](EventHandler::on_reflection_event) receives
//!   [`ReflectionEvent`]s from the [`ReflectionLoop`](crate::reflection::ReflectionLoop)
//!
//! Both methods have default no-op implementations, so you only override what
//! you care about. The handler is wrapped in `Arc<dyn EventHandler>` and registered
//! once on the [`Services`](crate::services::Services) shared by both orchestrators
//! via [`with_event_handler`](crate::services::Services::with_event_handler).
//!
//! # Example
//!
//! ```rust,no_run
//! use trio::event::{EventHandler, ReflectionEvent, TurnEvent};
//! use async_trait::async_trait;
//!
//! struct MyHandler;
//!
//! #[async_trait]
//! impl EventHandler for MyHandler {
//!     async fn on_turn_event(&self, event: &TurnEvent) {
//!         if let TurnEvent::AgentResponded { agent_name, elapsed_ms, .. } = event {
//!             println!("{} answered in {} ms", agent_name, elapsed_ms);
//!         }
//!     }
//!     async fn on_reflection_event(&self, event: &ReflectionEvent) {
//!         println!("Reflection: {:?}", event);
//!     }
//! }
//! ```

use async_trait::async_trait;

use crate::trio::client_wrapper::TokenUsage;
use crate::trio::reflection::ReflectionState;

/// Events emitted while a basic chat turn runs.
///
/// ```text
/// TurnStarted
///   └─ AgentResponded | AgentSkipped   (once per agent, shuffled order)
///   └─ AgentFailed                     (aborts the rest of the roster)
/// TurnCompleted                        (only when no agent failed)
/// ```
#[derive(Debug, Clone)]
pub enum TurnEvent {
    TurnStarted {
        chat_id: String,
        /// Agent names in the order they will be asked.
        order: Vec<String>,
    },
    AgentResponded {
        chat_id: String,
        agent_name: String,
        tokens_used: Option<TokenUsage>,
        elapsed_ms: u128,
    },
    /// The agent stayed silent (empty content) or its prompt failed to render.
    AgentSkipped { chat_id: String, agent_name: String },
    AgentFailed {
        chat_id: String,
        agent_name: String,
        error: String,
    },
    TurnCompleted {
        chat_id: String,
        responded: usize,
        skipped: usize,
        elapsed_ms: u128,
    },
}

/// Events emitted while a reflection exchange runs.
#[derive(Debug, Clone)]
pub enum ReflectionEvent {
    /// Fired before each Answering step. Iterations are 0-based.
    IterationStarted { chat_id: String, iteration: usize },
    EvaluationCompleted {
        chat_id: String,
        iteration: usize,
        /// What the evaluator answered, before any forced acceptance.
        verdict: bool,
    },
    ExchangeFinished {
        chat_id: String,
        state: ReflectionState,
        answers: usize,
        elapsed_ms: u128,
    },
}

/// Trait for receiving turn and reflection events.
///
/// Both methods have **default no-op implementations**, so you only need to
/// override the events you care about.
///
/// # Thread Safety
///
/// The `Send + Sync` bound allows the handler to be shared across request
/// workers via `Arc<dyn EventHandler>`. Make sure any internal state uses
/// appropriate synchronization (e.g., `AtomicUsize`, `Mutex`).
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Called for every [`TurnEvent`].
    async fn on_turn_event(&self, _event: &TurnEvent) {}

    /// Called for every [`ReflectionEvent`].
    async fn on_reflection_event(&self, _event: &ReflectionEvent) {}
}
