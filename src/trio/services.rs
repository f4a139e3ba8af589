//! Capability bundle shared by both orchestrators.
//!
//! Everything an orchestrator talks to (store, gateway, similarity recall,
//! templates, tunables) is constructed once at process start and injected
//! here. Cloning is cheap; every field is reference counted.

use std::sync::Arc;

use crate::trio::client_wrapper::TokenUsage;
use crate::trio::config::EngineConfig;
use crate::trio::context::ContextRetriever;
use crate::trio::event::{EventHandler, ReflectionEvent, TurnEvent};
use crate::trio::gateway::CompletionGateway;
use crate::trio::prompt::PromptRenderer;
use crate::trio::storage::SqliteStore;
use crate::trio::vector_store::VectorStore;

#[derive(Clone)]
pub struct Services {
    pub store: Arc<SqliteStore>,
    pub gateway: Arc<CompletionGateway>,
    pub retriever: ContextRetriever,
    pub prompts: Arc<PromptRenderer>,
    pub config: Arc<EngineConfig>,
    event_handler: Option<Arc<dyn EventHandler>>,
}

impl Services {
    pub fn new(
        store: Arc<SqliteStore>,
        vectors: Arc<dyn VectorStore>,
        gateway: Arc<CompletionGateway>,
        prompts: Arc<PromptRenderer>,
        config: EngineConfig,
    ) -> Self {
        let retriever = ContextRetriever::new(store.clone(), vectors, gateway.clone(), &config);
        Self {
            store,
            gateway,
            retriever,
            prompts,
            config: Arc::new(config),
            event_handler: None,
        }
    }

    /// Register a handler receiving turn and reflection events.
    pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.event_handler = Some(handler);
        self
    }

    pub(crate) async fn emit_turn(&self, event: TurnEvent) {
        if let Some(handler) = &self.event_handler {
            handler.on_turn_event(&event).await;
        }
    }

    pub(crate) async fn emit_reflection(&self, event: ReflectionEvent) {
        if let Some(handler) = &self.event_handler {
            handler.on_reflection_event(&event).await;
        }
    }

    /// Record provider-reported usage. Failures are logged, never propagated.
    pub(crate) async fn record_usage(&self, user_id: i64, model: &str, usage: Option<&TokenUsage>) {
        let Some(usage) = usage.cloned() else {
            return;
        };
        let model_name = model.to_string();
        let result = self
            .store
            .run(move |store| store.record_usage(Some(user_id), &model_name, &usage))
            .await;
        if let Err(err) = result {
            log::warn!("trio::services: usage for {} not recorded: {}", model, err);
        }
    }
}
