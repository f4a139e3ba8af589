//! Context retrieval: recent history plus semantically relevant recall.
//!
//! History comes from the relational store, newest first. Relevant context comes
//! from embedding the query text and asking the [`VectorStore`] for the nearest
//! messages of the same chat. Messages are embedded at write time through
//! [`ContextRetriever::remember`] with the same model and dimensions used for
//! queries, so the two spaces always match.
//!
//! `remember` pairs the vectors with the rows they describe: points are
//! upserted first and deleted again when the rows fail to persist, so recall
//! never surfaces a message that was rolled back.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::trio::client_wrapper::EmbeddingRequest;
use crate::trio::config::EngineConfig;
use crate::trio::error::EngineError;
use crate::trio::gateway::CompletionGateway;
use crate::trio::models::HistoryEntry;
use crate::trio::storage::SqliteStore;
use crate::trio::vector_store::{PayloadFilter, VectorPayload, VectorPoint, VectorStore};

/// Which kind of chat a history request is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatScope {
    Basic(i64),
    /// Reflection chats only expose accepted answers.
    Reflection(i64),
}

/// A message about to be embedded into a collection.
#[derive(Debug, Clone)]
pub struct MemoryRecord<'a> {
    pub chat_external_id: Uuid,
    pub message_external_id: Uuid,
    pub sender_name: &'a str,
    pub content: &'a str,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct ContextRetriever {
    store: Arc<SqliteStore>,
    vectors: Arc<dyn VectorStore>,
    gateway: Arc<CompletionGateway>,
    embedding_model: String,
    dimensions: usize,
}

impl ContextRetriever {
    pub fn new(
        store: Arc<SqliteStore>,
        vectors: Arc<dyn VectorStore>,
        gateway: Arc<CompletionGateway>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            store,
            vectors,
            gateway,
            embedding_model: config.embedding_model.clone(),
            dimensions: config.embedding_dimensions,
        }
    }

    /// Most recent history entries for the chat, newest first, at most `limit`.
    pub async fn chat_history(
        &self,
        scope: ChatScope,
        limit: usize,
    ) -> Result<Vec<HistoryEntry>, EngineError> {
        self.store
            .run(move |store| match scope {
                ChatScope::Basic(chat_id) => store.basic_history(chat_id, limit),
                ChatScope::Reflection(chat_id) => store.reflection_history(chat_id, limit),
            })
            .await
    }

    /// Messages of `chat_external_id` closest to `query`, best match first.
    ///
    /// A chat with nothing indexed yet yields an empty list.
    pub async fn relevant_context(
        &self,
        collection: &str,
        chat_external_id: Uuid,
        query: &str,
        limit: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<HistoryEntry>, EngineError> {
        let vector = self.embed(query, cancel).await?;
        let filter = PayloadFilter::chat(chat_external_id.to_string());

        let hits = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            hits = self.vectors.query(collection, &vector, &filter, limit) => hits?,
        };

        Ok(hits
            .into_iter()
            .map(|hit| HistoryEntry {
                sender_name: hit.payload.sender_name,
                content: hit.payload.content,
                sent_at: hit.payload.created_at,
            })
            .collect())
    }

    /// Embed `records`, upsert them into `collection`, then run `persist`.
    ///
    /// Every record is embedded before anything is written. If an upsert or
    /// `persist` fails, the points upserted here are deleted again. Embedding and
    /// upsert failures are reported as [`EngineError::Persistence`] unless they
    /// are configuration or cancellation errors.
    pub async fn remember<T, P, Fut>(
        &self,
        collection: &str,
        records: &[MemoryRecord<'_>],
        cancel: &CancellationToken,
        persist: P,
    ) -> Result<T, EngineError>
    where
        P: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, EngineError>>,
    {
        let mut points = Vec::with_capacity(records.len());
        for record in records {
            let vector = self.embed(record.content, cancel).await.map_err(as_persistence)?;
            points.push(VectorPoint {
                id: record.message_external_id,
                vector,
                payload: VectorPayload {
                    chat_id: record.chat_external_id.to_string(),
                    content: record.content.to_string(),
                    sender_name: record.sender_name.to_string(),
                    external_id: record.message_external_id.to_string(),
                    created_at: record.created_at,
                },
            });
        }

        let mut upserted = Vec::with_capacity(points.len());
        for point in points {
            // An interrupted upsert may still land, so its id is tracked up front.
            upserted.push(point.id);
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(EngineError::Cancelled),
                result = self.vectors.upsert(collection, point) => result.map_err(as_persistence),
            };
            if let Err(err) = result {
                self.forget(collection, &upserted).await;
                return Err(err);
            }
        }

        match persist().await {
            Ok(value) => Ok(value),
            Err(err) => {
                log::error!(
                    "trio::context: rows failed to persist, removing {} points from {}: {}",
                    upserted.len(),
                    collection,
                    err
                );
                self.forget(collection, &upserted).await;
                Err(err)
            }
        }
    }

    async fn forget(&self, collection: &str, ids: &[Uuid]) {
        if let Err(err) = self.vectors.delete(collection, ids).await {
            log::error!(
                "trio::context: could not delete {} orphaned points from {}: {}",
                ids.len(),
                collection,
                err
            );
        }
    }

    async fn embed(&self, text: &str, cancel: &CancellationToken) -> Result<Vec<f32>, EngineError> {
        let request = EmbeddingRequest::new(text, &self.embedding_model, self.dimensions);
        self.gateway.embed(&request, cancel).await
    }
}

fn as_persistence(err: EngineError) -> EngineError {
    match err {
        EngineError::Configuration(_) | EngineError::Cancelled | EngineError::Persistence(_) => err,
        other => EngineError::Persistence(other.to_string()),
    }
}
