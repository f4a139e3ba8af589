// src/trio/mod.rs

pub mod auth;
pub mod client_wrapper;
pub mod clients;
pub mod config;
pub mod context;
pub mod error;
pub mod event;
pub mod gateway;
pub mod http_client_pool;
pub mod models;
pub mod orchestration;
pub mod prompt;
pub mod qdrant;
pub mod reflection;
#[cfg(feature = "server")]
pub mod server;
pub mod services;
pub mod storage;
pub mod stream;
pub mod supervisor;
pub mod vector_store;

// Export the two orchestrators so they can be reached as trio::TurnOrchestrator
// instead of trio::orchestration::TurnOrchestrator
pub use orchestration::TurnOrchestrator;
pub use reflection::ReflectionLoop;
