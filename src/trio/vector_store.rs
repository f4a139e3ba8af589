//! Similarity-store capability used for semantic recall.
//!
//! The orchestrators upsert one point per stored message, query the nearest points
//! scoped to a single chat, and delete points whose message never got stored.
//! [`InMemoryVectorStore`] ranks by cosine similarity and is what tests and
//! Qdrant-less deployments run against; [`crate::qdrant::QdrantStore`] talks to a
//! real Qdrant instance.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::trio::error::EngineError;

/// Metadata stored next to every vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorPayload {
    /// Public id of the chat the message belongs to.
    pub chat_id: String,
    pub content: String,
    pub sender_name: String,
    /// Public id of the message row.
    pub external_id: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct VectorPoint {
    pub id: Uuid,
    pub vector: Vec<f32>,
    pub payload: VectorPayload,
}

/// Restricts a query to points whose payload matches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadFilter {
    pub chat_id: String,
}

impl PayloadFilter {
    pub fn chat(chat_id: impl Into<String>) -> Self {
        Self {
            chat_id: chat_id.into(),
        }
    }

    fn matches(&self, payload: &VectorPayload) -> bool {
        payload.chat_id == self.chat_id
    }
}

#[derive(Debug, Clone)]
pub struct ScoredPoint {
    pub id: Uuid,
    pub score: f32,
    pub payload: VectorPayload,
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Create `collection` for vectors of `dimensions` if it does not exist yet.
    ///
    /// Fails with [`EngineError::Configuration`] when the collection exists with a
    /// different vector size.
    async fn ensure_collection(&self, collection: &str, dimensions: usize)
        -> Result<(), EngineError>;

    /// Insert or replace a single point.
    async fn upsert(&self, collection: &str, point: VectorPoint) -> Result<(), EngineError>;

    /// Remove the points with the given ids. Unknown ids and collections are ignored.
    async fn delete(&self, collection: &str, ids: &[Uuid]) -> Result<(), EngineError>;

    /// Return up to `limit` points matching `filter`, best match first.
    ///
    /// An empty or unknown collection yields an empty list.
    async fn query(
        &self,
        collection: &str,
        vector: &[f32],
        filter: &PayloadFilter,
        limit: usize,
    ) -> Result<Vec<ScoredPoint>, EngineError>;
}

#[derive(Default)]
struct Collection {
    dimensions: Option<usize>,
    points: HashMap<Uuid, VectorPoint>,
}

/// Process-local similarity store ranking by cosine similarity.
#[derive(Default)]
pub struct InMemoryVectorStore {
    collections: RwLock<HashMap<String, Collection>>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of points currently held in `collection`.
    pub async fn len(&self, collection: &str) -> usize {
        self.collections
            .read()
            .await
            .get(collection)
            .map(|c| c.points.len())
            .unwrap_or(0)
    }

    pub async fn is_empty(&self, collection: &str) -> bool {
        self.len(collection).await == 0
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn ensure_collection(
        &self,
        collection: &str,
        dimensions: usize,
    ) -> Result<(), EngineError> {
        let mut collections = self.collections.write().await;
        let entry = collections.entry(collection.to_string()).or_default();
        match entry.dimensions {
            Some(existing) if existing != dimensions => Err(EngineError::Configuration(format!(
                "collection {} has vector size {}, expected {}",
                collection, existing, dimensions
            ))),
            _ => {
                entry.dimensions = Some(dimensions);
                Ok(())
            }
        }
    }

    async fn upsert(&self, collection: &str, point: VectorPoint) -> Result<(), EngineError> {
        let mut collections = self.collections.write().await;
        let entry = collections.entry(collection.to_string()).or_default();
        match entry.dimensions {
            Some(expected) if expected != point.vector.len() => {
                return Err(EngineError::Configuration(format!(
                    "vector of size {} does not fit collection {} of size {}",
                    point.vector.len(),
                    collection,
                    expected
                )))
            }
            None => entry.dimensions = Some(point.vector.len()),
            _ => {}
        }
        entry.points.insert(point.id, point);
        Ok(())
    }

    async fn delete(&self, collection: &str, ids: &[Uuid]) -> Result<(), EngineError> {
        let mut collections = self.collections.write().await;
        if let Some(entry) = collections.get_mut(collection) {
            for id in ids {
                entry.points.remove(id);
            }
        }
        Ok(())
    }

    async fn query(
        &self,
        collection: &str,
        vector: &[f32],
        filter: &PayloadFilter,
        limit: usize,
    ) -> Result<Vec<ScoredPoint>, EngineError> {
        let collections = self.collections.read().await;
        let Some(entry) = collections.get(collection) else {
            return Ok(Vec::new());
        };

        let mut scored: Vec<ScoredPoint> = entry
            .points
            .values()
            .filter(|point| filter.matches(&point.payload))
            .map(|point| ScoredPoint {
                id: point.id,
                score: cosine_similarity(vector, &point.vector),
                payload: point.payload.clone(),
            })
            .collect();

        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored.truncate(limit);
        Ok(scored)
    }
}

/// Cosine similarity; zero when either vector has no magnitude or sizes differ.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}
