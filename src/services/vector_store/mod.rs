//! Vector store abstraction layer.
//!
//! A trait-based abstraction over vector index backends (Qdrant,
//! PostgreSQL/pgvector, in-memory) allowing seamless switching based on
//! configuration. Business logic depends only on [`VectorStore`]; the driver
//! choice happens once, in [`create_backend`].

mod memory;
mod pgvector;
mod qdrant;

pub use memory::MemoryBackend;
pub use pgvector::PgVectorBackend;
pub use qdrant::QdrantBackend;

use async_trait::async_trait;

use crate::error::VectorStoreError;
use crate::models::{ChunkFilter, DocumentChunk, SearchResult, VectorDriver, VectorStoreConfig};

/// Collection/table information.
#[derive(Debug, Clone)]
pub struct CollectionInfo {
    pub points_count: u64,
}

/// Abstract trait for vector index operations.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Check if the vector store is healthy and accessible.
    async fn health_check(&self) -> Result<bool, VectorStoreError>;

    /// Get information about the current collection/table.
    /// Returns None if the collection doesn't exist.
    async fn get_collection_info(&self) -> Result<Option<CollectionInfo>, VectorStoreError>;

    /// Create the collection/table if it doesn't exist.
    async fn create_collection(&self) -> Result<(), VectorStoreError>;

    /// Insert or update document chunks with their embeddings.
    /// Chunk ids are deterministic, so re-ingestion overwrites in place.
    async fn upsert_chunks(&self, chunks: Vec<DocumentChunk>) -> Result<(), VectorStoreError>;

    /// Top-K cosine similarity search with an optional exact-match filter.
    async fn search(
        &self,
        query_vector: Vec<f32>,
        limit: u64,
        filter: &ChunkFilter,
    ) -> Result<Vec<SearchResult>, VectorStoreError>;

    /// Whether at least one chunk of the document is indexed.
    async fn has_document(&self, document_id: &str) -> Result<bool, VectorStoreError>;

    /// Delete all chunks belonging to the given documents.
    async fn delete_by_document_ids(&self, document_ids: &[String])
        -> Result<(), VectorStoreError>;

    /// Get the collection/table name.
    fn collection(&self) -> &str;
}

/// Create a vector store backend based on configuration.
pub async fn create_backend(
    config: &VectorStoreConfig,
    embedding_dim: u32,
) -> Result<Box<dyn VectorStore>, VectorStoreError> {
    match config.driver {
        VectorDriver::Qdrant => {
            let backend = QdrantBackend::new(config, u64::from(embedding_dim))?;
            Ok(Box::new(backend))
        }
        VectorDriver::PostgreSQL => {
            let backend = PgVectorBackend::new(config, u64::from(embedding_dim)).await?;
            Ok(Box::new(backend))
        }
        VectorDriver::Memory => Ok(Box::new(MemoryBackend::new(&config.collection))),
    }
}
