//! PostgreSQL + pgvector vector store backend implementation.

use async_trait::async_trait;
use pgvector::Vector;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::time::Duration;

use super::{CollectionInfo, VectorStore};
use crate::error::VectorStoreError;
use crate::models::{ChunkFilter, DocumentChunk, SearchResult, VectorStoreConfig};

pub struct PgVectorBackend {
    pool: PgPool,
    table_name: String,
    collection: String,
    embedding_dim: u64,
}

impl PgVectorBackend {
    pub async fn new(
        config: &VectorStoreConfig,
        embedding_dim: u64,
    ) -> Result<Self, VectorStoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.pool_max)
            .acquire_timeout(Duration::from_secs(config.pool_acquire_timeout.into()))
            .connect(&config.url)
            .await
            .map_err(|e| VectorStoreError::ConnectionError(e.to_string()))?;

        let backend = Self {
            pool,
            table_name: config.qualified_table_name(),
            collection: config.collection.clone(),
            embedding_dim,
        };

        backend.check_pgvector_extension().await?;

        if let Some(ref schema) = config.schema {
            backend.ensure_schema(schema).await?;
        }

        Ok(backend)
    }

    async fn check_pgvector_extension(&self) -> Result<(), VectorStoreError> {
        let result: Option<(String,)> =
            sqlx::query_as("SELECT extname FROM pg_extension WHERE extname = 'vector'")
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| VectorStoreError::PostgresError(e.to_string()))?;

        if result.is_none() {
            return Err(VectorStoreError::PgVectorExtensionError(
                "pgvector extension is not installed. Run: CREATE EXTENSION vector;".to_string(),
            ));
        }

        Ok(())
    }

    async fn ensure_schema(&self, schema: &str) -> Result<(), VectorStoreError> {
        let query = format!("CREATE SCHEMA IF NOT EXISTS {}", schema);
        sqlx::query(&query)
            .execute(&self.pool)
            .await
            .map_err(|e| VectorStoreError::PostgresError(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl VectorStore for PgVectorBackend {
    async fn health_check(&self) -> Result<bool, VectorStoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map(|_| true)
            .map_err(|e| VectorStoreError::ConnectionError(e.to_string()))
    }

    async fn get_collection_info(&self) -> Result<Option<CollectionInfo>, VectorStoreError> {
        let table_exists: Option<(String,)> = sqlx::query_as(
            "SELECT table_name FROM information_schema.tables WHERE table_name = $1",
        )
        .bind(&self.collection)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| VectorStoreError::PostgresError(e.to_string()))?;

        if table_exists.is_none() {
            return Ok(None);
        }

        let query = format!("SELECT COUNT(*) as count FROM {}", self.table_name);
        let row: (i64,) = sqlx::query_as(&query)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| VectorStoreError::PostgresError(e.to_string()))?;

        Ok(Some(CollectionInfo {
            points_count: row.0 as u64,
        }))
    }

    async fn create_collection(&self) -> Result<(), VectorStoreError> {
        if self.get_collection_info().await?.is_some() {
            return Ok(());
        }

        let create_table = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                id UUID PRIMARY KEY,
                document_id TEXT NOT NULL,
                file_name TEXT NOT NULL,
                ordinal INTEGER NOT NULL,
                content TEXT NOT NULL,
                embedding vector({}) NOT NULL,
                page INTEGER,
                section TEXT,
                summary TEXT,
                keywords TEXT[] NOT NULL DEFAULT '{{}}'
            )
            "#,
            self.table_name, self.embedding_dim
        );

        sqlx::query(&create_table)
            .execute(&self.pool)
            .await
            .map_err(|e| VectorStoreError::CollectionError(e.to_string()))?;

        let indices = [
            format!(
                "CREATE INDEX IF NOT EXISTS {}_embedding_idx ON {} USING hnsw (embedding vector_cosine_ops)",
                self.collection, self.table_name
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS {}_document_id_idx ON {} (document_id)",
                self.collection, self.table_name
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS {}_file_name_idx ON {} (file_name)",
                self.collection, self.table_name
            ),
        ];

        for index_sql in &indices {
            sqlx::query(index_sql)
                .execute(&self.pool)
                .await
                .map_err(|e| VectorStoreError::CollectionError(e.to_string()))?;
        }

        Ok(())
    }

    async fn upsert_chunks(&self, chunks: Vec<DocumentChunk>) -> Result<(), VectorStoreError> {
        if chunks.is_empty() {
            return Ok(());
        }

        let query = format!(
            r#"
            INSERT INTO {} (id, document_id, file_name, ordinal, content, embedding,
                          page, section, summary, keywords)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (id) DO UPDATE SET
                document_id = EXCLUDED.document_id,
                file_name = EXCLUDED.file_name,
                ordinal = EXCLUDED.ordinal,
                content = EXCLUDED.content,
                embedding = EXCLUDED.embedding,
                page = EXCLUDED.page,
                section = EXCLUDED.section,
                summary = EXCLUDED.summary,
                keywords = EXCLUDED.keywords
            "#,
            self.table_name
        );

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| VectorStoreError::UpsertError(e.to_string()))?;

        for chunk in chunks {
            let id = uuid::Uuid::parse_str(&chunk.id)
                .map_err(|e| VectorStoreError::UpsertError(format!("Invalid UUID: {}", e)))?;

            let embedding = Vector::from(chunk.embedding);

            sqlx::query(&query)
                .bind(id)
                .bind(&chunk.document_id)
                .bind(&chunk.file_name)
                .bind(chunk.ordinal as i32)
                .bind(&chunk.text)
                .bind(&embedding)
                .bind(chunk.page.map(|v| v as i32))
                .bind(&chunk.section)
                .bind(&chunk.summary)
                .bind(&chunk.keywords)
                .execute(&mut *tx)
                .await
                .map_err(|e| VectorStoreError::UpsertError(e.to_string()))?;
        }

        tx.commit()
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
        let embedding = Vector::from(query_vector);

        let mut where_parts = Vec::new();
        let mut param_index = 2;

        if filter.document_id.is_some() {
            where_parts.push(format!("document_id = ${}", param_index));
            param_index += 1;
        }
        if filter.file_name.is_some() {
            where_parts.push(format!("file_name = ${}", param_index));
        }

        let where_clause = if where_parts.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", where_parts.join(" AND "))
        };

        let query = format!(
            r#"
            SELECT
                id::text as chunk_id,
                1 - (embedding <=> $1) as score,
                content,
                document_id,
                file_name,
                page,
                section,
                summary,
                keywords
            FROM {}
            {}
            ORDER BY embedding <=> $1
            LIMIT {}
            "#,
            self.table_name, where_clause, limit
        );

        let mut query_builder = sqlx::query(&query).bind(&embedding);

        if let Some(ref document_id) = filter.document_id {
            query_builder = query_builder.bind(document_id);
        }
        if let Some(ref file_name) = filter.file_name {
            query_builder = query_builder.bind(file_name);
        }

        let rows = query_builder
            .fetch_all(&self.pool)
            .await
            .map_err(|e| VectorStoreError::SearchError(e.to_string()))?;

        let results = rows
            .into_iter()
            .map(|row: PgRow| {
                let score: f64 = row.get("score");
                let page: Option<i32> = row.get("page");

                SearchResult {
                    chunk_id: row.get("chunk_id"),
                    score: score as f32,
                    text: row.get("content"),
                    document_id: row.get("document_id"),
                    file_name: row.get("file_name"),
                    page: page.map(|v| v as u32),
                    section: row.get("section"),
                    summary: row.get("summary"),
                    keywords: row.get("keywords"),
                }
            })
            .collect();

        Ok(results)
    }

    async fn has_document(&self, document_id: &str) -> Result<bool, VectorStoreError> {
        let query = format!(
            "SELECT EXISTS(SELECT 1 FROM {} WHERE document_id = $1)",
            self.table_name
        );

        let row: (bool,) = sqlx::query_as(&query)
            .bind(document_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| VectorStoreError::SearchError(e.to_string()))?;

        Ok(row.0)
    }

    async fn delete_by_document_ids(
        &self,
        document_ids: &[String],
    ) -> Result<(), VectorStoreError> {
        if document_ids.is_empty() {
            return Ok(());
        }

        let query = format!(
            "DELETE FROM {} WHERE document_id = ANY($1)",
            self.table_name
        );

        sqlx::query(&query)
            .bind(document_ids)
            .execute(&self.pool)
            .await
            .map_err(|e| VectorStoreError::DeleteError(e.to_string()))?;

        Ok(())
    }

    fn collection(&self) -> &str {
        &self.collection
    }
}
