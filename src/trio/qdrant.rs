//! [`VectorStore`] backed by Qdrant's REST API.
//!
//! Points are keyed by the public uuid of the message they embed and carry the
//! [`VectorPayload`] fields as their payload. Queries always filter on `chat_id`,
//! so [`QdrantStore::ensure_collection`] also creates keyword indexes for the
//! payload fields we filter or look up by.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::trio::error::EngineError;
use crate::trio::http_client_pool::get_or_create_client;
use crate::trio::vector_store::{PayloadFilter, ScoredPoint, VectorPayload, VectorPoint, VectorStore};

const INDEXED_FIELDS: [&str; 2] = ["chat_id", "external_id"];

pub struct QdrantStore {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct QdrantEnvelope<T> {
    result: T,
}

#[derive(Debug, Deserialize)]
struct CollectionInfo {
    config: CollectionConfig,
}

#[derive(Debug, Deserialize)]
struct CollectionConfig {
    params: CollectionParams,
}

#[derive(Debug, Deserialize)]
struct CollectionParams {
    vectors: VectorParams,
}

#[derive(Debug, Deserialize)]
struct VectorParams {
    size: usize,
}

#[derive(Debug, Serialize)]
struct WirePoint<'a> {
    id: String,
    vector: &'a [f32],
    payload: &'a VectorPayload,
}

#[derive(Debug, Deserialize)]
struct QueryResult {
    #[serde(default)]
    points: Vec<WireScoredPoint>,
}

#[derive(Debug, Deserialize)]
struct WireScoredPoint {
    id: serde_json::Value,
    score: f32,
    payload: Option<VectorPayload>,
}

impl QdrantStore {
    pub fn new(base_url: &str, api_key: Option<String>) -> Self {
        let base_url = base_url.trim_end_matches('/').to_string();
        Self {
            http: get_or_create_client(&base_url),
            base_url,
            api_key,
        }
    }

    fn collection_url(&self, collection: &str, suffix: &str) -> String {
        format!(
            "{}/collections/{}{}",
            self.base_url,
            urlencoding::encode(collection),
            suffix
        )
    }

    fn request(&self, method: reqwest::Method, url: String) -> reqwest::RequestBuilder {
        let builder = self.http.request(method, url);
        match &self.api_key {
            Some(key) => builder.header("api-key", key),
            None => builder,
        }
    }

    async fn check(response: reqwest::Response, what: &str) -> Result<reqwest::Response, EngineError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        log::error!("trio::qdrant: {} failed with {}: {}", what, status, body);
        Err(EngineError::Persistence(format!("qdrant {} failed with {}", what, status)))
    }

    /// Ensure every collection in `collections` exists with vectors of `dimensions`.
    pub async fn ensure_collections(
        &self,
        collections: &[&str],
        dimensions: usize,
    ) -> Result<(), EngineError> {
        for collection in collections {
            self.ensure_collection(collection, dimensions).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl VectorStore for QdrantStore {
    async fn ensure_collection(
        &self,
        collection: &str,
        dimensions: usize,
    ) -> Result<(), EngineError> {
        let response = self
            .request(reqwest::Method::GET, self.collection_url(collection, ""))
            .send()
            .await
            .map_err(|e| EngineError::Persistence(e.to_string()))?;

        if response.status() == StatusCode::NOT_FOUND {
            log::info!(
                "trio::qdrant: creating collection {} ({} dimensions, cosine)",
                collection,
                dimensions
            );
            let response = self
                .request(reqwest::Method::PUT, self.collection_url(collection, ""))
                .json(&json!({ "vectors": { "size": dimensions, "distance": "Cosine" } }))
                .send()
                .await
                .map_err(|e| EngineError::Persistence(e.to_string()))?;
            Self::check(response, "create collection").await?;

            for field in INDEXED_FIELDS {
                let response = self
                    .request(reqwest::Method::PUT, self.collection_url(collection, "/index?wait=true"))
                    .json(&json!({ "field_name": field, "field_schema": "keyword" }))
                    .send()
                    .await
                    .map_err(|e| EngineError::Persistence(e.to_string()))?;
                Self::check(response, "create payload index").await?;
            }
            return Ok(());
        }

        let response = Self::check(response, "get collection").await?;
        let info: QdrantEnvelope<CollectionInfo> = response
            .json()
            .await
            .map_err(|e| EngineError::Persistence(e.to_string()))?;
        let existing = info.result.config.params.vectors.size;
        if existing != dimensions {
            return Err(EngineError::Configuration(format!(
                "collection {} has vector size {}, expected {}",
                collection, existing, dimensions
            )));
        }
        Ok(())
    }

    async fn upsert(&self, collection: &str, point: VectorPoint) -> Result<(), EngineError> {
        let body = json!({
            "points": [WirePoint {
                id: point.id.to_string(),
                vector: &point.vector,
                payload: &point.payload,
            }]
        });
        let response = self
            .request(
                reqwest::Method::PUT,
                self.collection_url(collection, "/points?wait=true"),
            )
            .json(&body)
            .send()
            .await
            .map_err(|e| EngineError::Persistence(e.to_string()))?;
        Self::check(response, "upsert").await?;
        Ok(())
    }

    async fn delete(&self, collection: &str, ids: &[Uuid]) -> Result<(), EngineError> {
        if ids.is_empty() {
            return Ok(());
        }
        let response = self
            .request(
                reqwest::Method::POST,
                self.collection_url(collection, "/points/delete?wait=true"),
            )
            .json(&delete_body(ids))
            .send()
            .await
            .map_err(|e| EngineError::Persistence(e.to_string()))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Self::check(response, "delete").await?;
        Ok(())
    }

    async fn query(
        &self,
        collection: &str,
        vector: &[f32],
        filter: &PayloadFilter,
        limit: usize,
    ) -> Result<Vec<ScoredPoint>, EngineError> {
        let body = json!({
            "query": vector,
            "filter": { "must": [ { "key": "chat_id", "match": { "value": filter.chat_id } } ] },
            "limit": limit,
            "with_payload": true,
        });
        let response = self
            .request(
                reqwest::Method::POST,
                self.collection_url(collection, "/points/query"),
            )
            .json(&body)
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        let response = Self::check(response, "query").await?;
        let parsed: QdrantEnvelope<QueryResult> = response.json().await?;

        let points = parsed
            .result
            .points
            .into_iter()
            .filter_map(|point| {
                let payload = point.payload?;
                let id = point
                    .id
                    .as_str()
                    .and_then(|raw| Uuid::parse_str(raw).ok())
                    .unwrap_or_else(Uuid::nil);
                Some(ScoredPoint {
                    id,
                    score: point.score,
                    payload,
                })
            })
            .collect();
        Ok(points)
    }
}

fn delete_body(ids: &[Uuid]) -> serde_json::Value {
    json!({ "points": ids.iter().map(Uuid::to_string).collect::<Vec<_>>() })
}
