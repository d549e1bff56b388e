//! In-memory vector store backend.
//!
//! Brute-force cosine similarity over a hash map. Used for local runs
//! without external services and as the default store in tests.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::{CollectionInfo, VectorStore};
use crate::error::VectorStoreError;
use crate::models::{ChunkFilter, DocumentChunk, SearchResult};

pub struct MemoryBackend {
    collection: String,
    chunks: RwLock<HashMap<String, DocumentChunk>>,
}

impl MemoryBackend {
    pub fn new(collection: &str) -> Self {
        Self {
            collection: collection.to_string(),
            chunks: RwLock::new(HashMap::new()),
        }
    }

    fn cosine_sim(a: &[f32], b: &[f32]) -> f32 {
        if a.len() != b.len() || a.is_empty() {
            return 0.0;
        }
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;
        for (x, y) in a.iter().zip(b.iter()) {
            dot += x * y;
            norm_a += x * x;
            norm_b += y * y;
        }
        if norm_a == 0.0 || norm_b == 0.0 {
            return 0.0;
        }
        dot / (norm_a.sqrt() * norm_b.sqrt())
    }

    fn matches_filter(chunk: &DocumentChunk, filter: &ChunkFilter) -> bool {
        if let Some(ref document_id) = filter.document_id {
            if &chunk.document_id != document_id {
                return false;
            }
        }
        if let Some(ref file_name) = filter.file_name {
            if &chunk.file_name != file_name {
                return false;
            }
        }
        true
    }
}

#[async_trait]
impl VectorStore for MemoryBackend {
    async fn health_check(&self) -> Result<bool, VectorStoreError> {
        Ok(true)
    }

    async fn get_collection_info(&self) -> Result<Option<CollectionInfo>, VectorStoreError> {
        let chunks = self.chunks.read().await;
        Ok(Some(CollectionInfo {
            points_count: chunks.len() as u64,
        }))
    }

    async fn create_collection(&self) -> Result<(), VectorStoreError> {
        Ok(())
    }

    async fn upsert_chunks(&self, new_chunks: Vec<DocumentChunk>) -> Result<(), VectorStoreError> {
        let mut chunks = self.chunks.write().await;
        for chunk in new_chunks {
            chunks.insert(chunk.id.clone(), chunk);
        }
        Ok(())
    }

    async fn search(
        &self,
        query_vector: Vec<f32>,
        limit: u64,
        filter: &ChunkFilter,
    ) -> Result<Vec<SearchResult>, VectorStoreError> {
        let chunks = self.chunks.read().await;

        let mut scored: Vec<SearchResult> = chunks
            .values()
            .filter(|chunk| Self::matches_filter(chunk, filter))
            .map(|chunk| SearchResult {
                chunk_id: chunk.id.clone(),
                score: Self::cosine_sim(&query_vector, &chunk.embedding),
                text: chunk.text.clone(),
                document_id: chunk.document_id.clone(),
                file_name: chunk.file_name.clone(),
                page: chunk.page,
                section: chunk.section.clone(),
                summary: chunk.summary.clone(),
                keywords: chunk.keywords.clone(),
            })
            .collect();

        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit as usize);

        Ok(scored)
    }

    async fn has_document(&self, document_id: &str) -> Result<bool, VectorStoreError> {
        let chunks = self.chunks.read().await;
        Ok(chunks.values().any(|c| c.document_id == document_id))
    }

    async fn delete_by_document_ids(
        &self,
        document_ids: &[String],
    ) -> Result<(), VectorStoreError> {
        if document_ids.is_empty() {
            return Ok(());
        }
        let mut chunks = self.chunks.write().await;
        chunks.retain(|_, c| !document_ids.contains(&c.document_id));
        Ok(())
    }

    fn collection(&self) -> &str {
        &self.collection
    }
}
