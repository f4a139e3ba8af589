// src/bin/trio-server.rs
//
// Runs the trio HTTP surface configured from the environment.
//
//   OPENAI_API_KEY=... TRIO_DATABASE_PATH=trio.db cargo run --bin trio-server

use std::error::Error;
use std::sync::Arc;

use tokio::net::TcpListener;

use trio::clients::gemini::GeminiClient;
use trio::clients::openai::OpenAIClient;
use trio::gateway::CompletionGateway;
use trio::prompt::PromptRenderer;
use trio::qdrant::QdrantStore;
use trio::server::{router, AppState};
use trio::services::Services;
use trio::storage::SqliteStore;
use trio::vector_store::{InMemoryVectorStore, VectorStore};
use trio::{ClientWrapper, TrioConfig};

fn build_gateway(config: &TrioConfig) -> CompletionGateway {
    let mut gateway = CompletionGateway::new();

    if let Some(key) = &config.openai_api_key {
        let openai: Arc<dyn ClientWrapper> = match &config.openai_base_url {
            Some(url) => Arc::new(OpenAIClient::new_with_base_url(key, url)),
            None => Arc::new(OpenAIClient::new(key)),
        };
        gateway.add_route("gpt", openai.clone());
        gateway.add_route("text-embedding", openai);
    } else {
        log::warn!("trio-server: OPENAI_API_KEY not set, gpt models are unavailable");
    }

    if let Some(key) = &config.gemini_api_key {
        let gemini: Arc<dyn ClientWrapper> = match &config.gemini_base_url {
            Some(url) => Arc::new(GeminiClient::new_with_base_url(key, url)),
            None => Arc::new(GeminiClient::new(key)),
        };
        gateway.add_route("gemini", gemini);
    }

    gateway
}

async fn build_vector_store(config: &TrioConfig) -> Result<Arc<dyn VectorStore>, Box<dyn Error>> {
    let engine = &config.engine;
    match &config.qdrant_url {
        Some(url) => {
            let qdrant = QdrantStore::new(url, config.qdrant_api_key.clone());
            qdrant
                .ensure_collections(
                    &[
                        engine.basic_collection.as_str(),
                        engine.reflection_collection.as_str(),
                    ],
                    engine.embedding_dimensions,
                )
                .await?;
            log::info!("trio-server: using Qdrant at {}", url);
            Ok(Arc::new(qdrant))
        }
        None => {
            log::warn!("trio-server: QDRANT_URL not set, similarity recall is kept in memory");
            let store = InMemoryVectorStore::new();
            for collection in [&engine.basic_collection, &engine.reflection_collection] {
                store
                    .ensure_collection(collection, engine.embedding_dimensions)
                    .await?;
            }
            Ok(Arc::new(store))
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    trio::init_logger();

    let config = TrioConfig::from_env()?;
    let store = Arc::new(SqliteStore::open(&config.database_path)?);
    log::info!("trio-server: database at {}", store.path().display());

    let gateway = build_gateway(&config);
    for model in [
        &config.engine.response_model,
        &config.engine.answerer_model,
        &config.engine.evaluator_model,
        &config.engine.embedding_model,
    ] {
        if !gateway.supports(model) {
            log::warn!("trio-server: no backend registered for model {}", model);
        }
    }

    let prompts = match &config.template_dir {
        Some(dir) => PromptRenderer::from_dir(dir)?,
        None => PromptRenderer::builtin()?,
    };
    let vectors = build_vector_store(&config).await?;

    let services = Services::new(
        store,
        vectors,
        Arc::new(gateway),
        Arc::new(prompts),
        config.engine.clone(),
    );
    let app = router(AppState::new(services));

    let listener = TcpListener::bind(config.bind_addr).await?;
    log::info!("trio-server: listening on {}", config.bind_addr);
    axum::serve(listener, app).await?;
    Ok(())
}
