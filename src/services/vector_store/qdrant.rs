//! Qdrant vector store backend implementation.

use async_trait::async_trait;
use qdrant_client::qdrant::{
    Condition, CreateCollectionBuilder, DeletePointsBuilder, Distance, Filter, PointStruct,
    ScrollPointsBuilder, SearchPointsBuilder, UpsertPointsBuilder, VectorParamsBuilder,
};
use qdrant_client::Qdrant;
use std::collections::HashMap;

use super::{CollectionInfo, VectorStore};
use crate::error::VectorStoreError;
use crate::models::{ChunkFilter, DocumentChunk, SearchResult, VectorStoreConfig};

/// Qdrant vector store backend.
pub struct QdrantBackend {
    client: Qdrant,
    collection: String,
    embedding_dim: u64,
}

impl QdrantBackend {
    /// Create a new Qdrant backend from configuration.
    pub fn new(config: &VectorStoreConfig, embedding_dim: u64) -> Result<Self, VectorStoreError> {
        let mut builder = Qdrant::from_url(&config.url);

        if let Some(ref api_key) = config.api_key {
            builder = builder.api_key(api_key.clone());
        }

        let client = builder
            .build()
            .map_err(|e| VectorStoreError::ConnectionError(e.to_string()))?;

        Ok(Self {
            client,
            collection: config.collection.clone(),
            embedding_dim,
        })
    }

    fn build_filter(filter: &ChunkFilter) -> Option<Filter> {
        let mut must_conditions: Vec<Condition> = Vec::new();

        if let Some(ref document_id) = filter.document_id {
            must_conditions.push(Condition::matches("document_id", document_id.clone()));
        }
        if let Some(ref file_name) = filter.file_name {
            must_conditions.push(Condition::matches("file_name", file_name.clone()));
        }

        if must_conditions.is_empty() {
            None
        } else {
            Some(Filter::must(must_conditions))
        }
    }

    fn payload_str(
        payload: &HashMap<String, qdrant_client::qdrant::Value>,
        key: &str,
    ) -> Option<String> {
        payload.get(key).and_then(|v| match &v.kind {
            Some(qdrant_client::qdrant::value::Kind::StringValue(s)) => Some(s.clone()),
            _ => None,
        })
    }

    fn payload_int(
        payload: &HashMap<String, qdrant_client::qdrant::Value>,
        key: &str,
    ) -> Option<i64> {
        payload.get(key).and_then(|v| match &v.kind {
            Some(qdrant_client::qdrant::value::Kind::IntegerValue(n)) => Some(*n),
            _ => None,
        })
    }

    fn payload_str_list(
        payload: &HashMap<String, qdrant_client::qdrant::Value>,
        key: &str,
    ) -> Vec<String> {
        payload
            .get(key)
            .and_then(|v| match &v.kind {
                Some(qdrant_client::qdrant::value::Kind::ListValue(list)) => Some(
                    list.values
                        .iter()
                        .filter_map(|v| match &v.kind {
                            Some(qdrant_client::qdrant::value::Kind::StringValue(s)) => {
                                Some(s.clone())
                            }
                            _ => None,
                        })
                        .collect(),
                ),
                _ => None,
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl VectorStore for QdrantBackend {
    async fn health_check(&self) -> Result<bool, VectorStoreError> {
        self.client
            .health_check()
            .await
            .map(|_| true)
            .map_err(|e| VectorStoreError::ConnectionError(e.to_string()))
    }

    async fn get_collection_info(&self) -> Result<Option<CollectionInfo>, VectorStoreError> {
        match self.client.collection_info(&self.collection).await {
            Ok(info) => Ok(Some(CollectionInfo {
                points_count: info.result.map_or(0, |r| r.points_count.unwrap_or(0)),
            })),
            Err(e) => {
                let msg = e.to_string();
                if msg.contains("not found") || msg.contains("doesn't exist") {
                    Ok(None)
                } else {
                    Err(VectorStoreError::CollectionError(msg))
                }
            }
        }
    }

    async fn create_collection(&self) -> Result<(), VectorStoreError> {
        if self.get_collection_info().await?.is_some() {
            return Ok(());
        }

        let create_collection = CreateCollectionBuilder::new(&self.collection).vectors_config(
            VectorParamsBuilder::new(self.embedding_dim, Distance::Cosine),
        );

        self.client
            .create_collection(create_collection)
            .await
            .map_err(|e| VectorStoreError::CollectionError(e.to_string()))?;

        Ok(())
    }

    async fn upsert_chunks(&self, chunks: Vec<DocumentChunk>) -> Result<(), VectorStoreError> {
        if chunks.is_empty() {
            return Ok(());
        }

        let points: Vec<PointStruct> = chunks
            .into_iter()
            .map(|chunk| {
                let mut payload: HashMap<String, qdrant_client::qdrant::Value> = HashMap::new();
                payload.insert("document_id".to_string(), chunk.document_id.into());
                payload.insert("file_name".to_string(), chunk.file_name.into());
                payload.insert("ordinal".to_string(), i64::from(chunk.ordinal).into());
                payload.insert("text".to_string(), chunk.text.into());

                if let Some(page) = chunk.page {
                    payload.insert("page".to_string(), i64::from(page).into());
                }
                if let Some(section) = chunk.section {
                    payload.insert("section".to_string(), section.into());
                }
                if let Some(summary) = chunk.summary {
                    payload.insert("summary".to_string(), summary.into());
                }
                if !chunk.keywords.is_empty() {
                    let keywords: Vec<qdrant_client::qdrant::Value> =
                        chunk.keywords.into_iter().map(Into::into).collect();
                    payload.insert("keywords".to_string(), keywords.into());
                }

                PointStruct::new(chunk.id, chunk.embedding, payload)
            })
            .collect();

        let upsert = UpsertPointsBuilder::new(&self.collection, points);

        self.client
            .upsert_points(upsert)
            .await
            .map_err(|e| VectorStoreError::UpsertError(e.to_string()))?;

        Ok(())
    }

    async fn search(
        &self,
        query_vector: Vec<f32>,
        limit: u64,
        filter: &ChunkFilter,
    ) -> Result<Vec<SearchResult>, VectorStoreError> {
        let mut search_builder =
            SearchPointsBuilder::new(&self.collection, query_vector, limit).with_payload(true);

        if let Some(f) = Self::build_filter(filter) {
            search_builder = search_builder.filter(f);
        }

        let results = self
            .client
            .search_points(search_builder)
            .await
            .map_err(|e| VectorStoreError::SearchError(e.to_string()))?;

        let search_results: Vec<SearchResult> = results
            .result
            .into_iter()
            .map(|point| {
                let payload = point.payload;

                let chunk_id = match &point.id {
                    Some(id) => match &id.point_id_options {
                        Some(qdrant_client::qdrant::point_id::PointIdOptions::Uuid(uuid)) => {
                            uuid.clone()
                        }
                        Some(qdrant_client::qdrant::point_id::PointIdOptions::Num(num)) => {
                            num.to_string()
                        }
                        None => String::new(),
                    },
                    None => String::new(),
                };

                SearchResult {
                    chunk_id,
                    score: point.score,
                    text: Self::payload_str(&payload, "text").unwrap_or_default(),
                    document_id: Self::payload_str(&payload, "document_id").unwrap_or_default(),
                    file_name: Self::payload_str(&payload, "file_name").unwrap_or_default(),
                    page: Self::payload_int(&payload, "page").map(|n| n as u32),
                    section: Self::payload_str(&payload, "section"),
                    summary: Self::payload_str(&payload, "summary"),
                    keywords: Self::payload_str_list(&payload, "keywords"),
                }
            })
            .collect();

        Ok(search_results)
    }

    async fn has_document(&self, document_id: &str) -> Result<bool, VectorStoreError> {
        let filter = Filter::must([Condition::matches("document_id", document_id.to_string())]);

        let scroll = ScrollPointsBuilder::new(&self.collection)
            .filter(filter)
            .limit(1)
            .with_payload(false)
            .with_vectors(false);

        let response = self
            .client
            .scroll(scroll)
            .await
            .map_err(|e| VectorStoreError::SearchError(e.to_string()))?;

        Ok(!response.result.is_empty())
    }

    async fn delete_by_document_ids(
        &self,
        document_ids: &[String],
    ) -> Result<(), VectorStoreError> {
        if document_ids.is_empty() {
            return Ok(());
        }

        let conditions: Vec<Condition> = document_ids
            .iter()
            .map(|id| Condition::matches("document_id", id.clone()))
            .collect();

        let filter = Filter::should(conditions);
        let delete = DeletePointsBuilder::new(&self.collection).points(filter);

        self.client
            .delete_points(delete)
            .await
            .map_err(|e| VectorStoreError::DeleteError(e.to_string()))?;

        Ok(())
    }

    fn collection(&self) -> &str {
        &self.collection
    }
}
