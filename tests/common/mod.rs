// Shared fixtures for the integration tests: a scripted backend and a wired engine
// over a throw-away SQLite file and the in-memory similarity store.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::Notify;

use trio::auth::Principal;
use trio::client_wrapper::{ClientWrapper, Completion, CompletionRequest, EmbeddingRequest, TokenUsage};
use trio::error::EngineError;
use trio::gateway::CompletionGateway;
use trio::prompt::PromptRenderer;
use trio::services::Services;
use trio::storage::SqliteStore;
use trio::vector_store::InMemoryVectorStore;
use trio::EngineConfig;

pub const DIMENSIONS: usize = 8;
pub const RESPONSE_MODEL: &str = "gpt-response";
pub const ANSWERER_MODEL: &str = "gpt-answerer";
pub const EVALUATOR_MODEL: &str = "gpt-evaluator";
pub const EMBEDDING_MODEL: &str = "text-embedding-test";

type Script = dyn Fn(&CompletionRequest) -> Result<String, EngineError> + Send + Sync;

/// Pauses calls to one model: `entered` fires when a call arrives, the call then
/// waits for `release`.
#[derive(Default)]
pub struct Gate {
    pub entered: Notify,
    pub release: Notify,
}

/// Backend whose completions come from a closure and whose embeddings are a
/// deterministic function of the input text.
pub struct ScriptedClient {
    script: Box<Script>,
    calls: Mutex<Vec<CompletionRequest>>,
    fail_embeddings_of: Mutex<Option<String>>,
    gates: Mutex<HashMap<String, Arc<Gate>>>,
}

impl ScriptedClient {
    pub fn new<F>(script: F) -> Self
    where
        F: Fn(&CompletionRequest) -> Result<String, EngineError> + Send + Sync + 'static,
    {
        Self {
            script: Box::new(script),
            calls: Mutex::new(Vec::new()),
            fail_embeddings_of: Mutex::new(None),
            gates: Mutex::new(HashMap::new()),
        }
    }

    pub fn calls(&self) -> Vec<CompletionRequest> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, model: &str) -> Vec<CompletionRequest> {
        self.calls()
            .into_iter()
            .filter(|call| call.model == model)
            .collect()
    }

    /// Make embedding `text` fail from now on; `None` heals the backend.
    pub fn fail_embeddings_of(&self, text: Option<&str>) {
        *self.fail_embeddings_of.lock().unwrap() = text.map(str::to_string);
    }

    /// Hold every later call to `model` at a [`Gate`].
    pub fn hold(&self, model: &str) -> Arc<Gate> {
        let gate = Arc::new(Gate::default());
        self.gates
            .lock()
            .unwrap()
            .insert(model.to_string(), gate.clone());
        gate
    }
}

/// Agent name a basic-chat system prompt was rendered for.
pub fn agent_of(request: &CompletionRequest) -> String {
    request
        .system_prompt
        .lines()
        .find_map(|line| line.strip_prefix("You are ").map(|rest| rest.to_string()))
        .unwrap_or_default()
        .split(|c: char| c == ',' || c == '.')
        .next()
        .unwrap_or_default()
        .trim()
        .to_string()
}

pub fn embed_text(text: &str) -> Vec<f32> {
    let mut vector = vec![0.0f32; DIMENSIONS];
    for (i, byte) in text.bytes().enumerate() {
        vector[i % DIMENSIONS] += byte as f32;
    }
    vector[0] += 1.0;
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    vector.iter().map(|v| v / norm).collect()
}

#[async_trait]
impl ClientWrapper for ScriptedClient {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, EngineError> {
        self.calls.lock().unwrap().push(request.clone());
        let gate = self.gates.lock().unwrap().get(&request.model).cloned();
        if let Some(gate) = gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }
        let text = (self.script)(request)?;
        Ok(Completion {
            text,
            usage: Some(TokenUsage {
                input_tokens: 10,
                output_tokens: 5,
                total_tokens: 15,
            }),
        })
    }

    async fn embed(&self, request: &EmbeddingRequest) -> Result<Vec<f32>, EngineError> {
        let failing = self.fail_embeddings_of.lock().unwrap().clone();
        if failing.as_deref() == Some(request.input.as_str()) {
            return Err(EngineError::Gateway("embedding backend down".into()));
        }
        Ok(embed_text(&request.input))
    }
}

pub fn test_config() -> EngineConfig {
    EngineConfig {
        response_model: RESPONSE_MODEL.to_string(),
        answerer_model: ANSWERER_MODEL.to_string(),
        evaluator_model: EVALUATOR_MODEL.to_string(),
        embedding_model: EMBEDDING_MODEL.to_string(),
        embedding_dimensions: DIMENSIONS,
        ..EngineConfig::default()
    }
}

pub struct Fixture {
    _dir: TempDir,
    pub store: Arc<SqliteStore>,
    pub vectors: Arc<InMemoryVectorStore>,
    pub client: Arc<ScriptedClient>,
    pub services: Services,
    pub user: Principal,
}

impl Fixture {
    pub fn new(client: ScriptedClient) -> Self {
        Self::with_config(client, test_config())
    }

    pub fn with_config(client: ScriptedClient, config: EngineConfig) -> Self {
        trio::init_logger();
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteStore::open(dir.path().join("trio.db")).unwrap());
        let vectors = Arc::new(InMemoryVectorStore::new());
        let client = Arc::new(client);
        let gateway = CompletionGateway::new()
            .with_route("gpt", client.clone())
            .with_route("text-embedding", client.clone());
        let services = Services::new(
            store.clone(),
            vectors.clone(),
            Arc::new(gateway),
            Arc::new(PromptRenderer::builtin().unwrap()),
            config,
        );
        let user = store.create_user("ada").unwrap();
        Self {
            _dir: dir,
            store,
            vectors,
            client,
            services,
            user,
        }
    }
}
