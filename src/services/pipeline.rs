//! Multi-stage document ingestion pipeline.
//!
//! Stages run in strict order: resolve canonical name, check the index,
//! fetch source bytes, extract and chunk and embed, summarize, persist
//! the ingestion record. Failures never cross the pipeline boundary; the
//! caller always receives a well-formed [`IngestReport`].

use bytes::Bytes;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::IngestError;
use crate::models::{Document, DocumentChunk, IngestConfig, IngestMode, IngestionRecord};
use crate::services::chunker::TextChunker;
use crate::services::completion::Summarizer;
use crate::services::embedding::Embedder;
use crate::services::record_store::RecordStore;
use crate::services::vector_store::VectorStore;

/// Canonical file name for a source URL: the last path segment with query
/// and fragment stripped, forced to a `.pdf` suffix. Deterministic, no I/O.
pub fn resolve_file_name(source_url: &str) -> String {
    let without_fragment = source_url.split('#').next().unwrap_or(source_url);
    let without_query = without_fragment.split('?').next().unwrap_or(without_fragment);
    let trimmed = without_query.trim_end_matches('/');
    let segment = trimmed.rsplit('/').next().unwrap_or(trimmed);
    let segment = if segment.is_empty() { "document" } else { segment };

    if segment.to_ascii_lowercase().ends_with(".pdf") {
        segment.to_string()
    } else {
        format!("{}.pdf", segment)
    }
}

/// Terminal value of one ingestion run. Always well-formed: a failed run
/// carries the failure reason as its summary and an empty keyword list.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestReport {
    pub document_id: String,
    pub file_name: String,
    pub summary: String,
    pub keywords: Vec<String>,
    pub chunks_indexed: usize,
    pub chunks_failed: usize,
    /// True when cache mode short-circuited on the existence check.
    pub already_indexed: bool,
    /// False when the ingestion record write was skipped or failed.
    pub persisted: bool,
}

impl IngestReport {
    fn failed(document_id: &str, file_name: &str, error: &IngestError) -> Self {
        Self {
            document_id: document_id.to_string(),
            file_name: file_name.to_string(),
            summary: error.to_string(),
            keywords: Vec::new(),
            chunks_indexed: 0,
            chunks_failed: 0,
            already_indexed: false,
            persisted: false,
        }
    }
}

/// One chunk that could not be embedded or upserted.
#[derive(Debug, Clone, Serialize)]
pub struct ChunkFailure {
    pub ordinal: u32,
    pub reason: String,
}

pub struct IngestPipeline {
    chunker: TextChunker,
    embedder: Arc<dyn Embedder>,
    summarizer: Arc<dyn Summarizer>,
    vector_store: Arc<dyn VectorStore>,
    record_store: Arc<dyn RecordStore>,
    http: reqwest::Client,
    config: IngestConfig,
}

impl IngestPipeline {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        summarizer: Arc<dyn Summarizer>,
        vector_store: Arc<dyn VectorStore>,
        record_store: Arc<dyn RecordStore>,
        config: IngestConfig,
    ) -> Self {
        Self {
            chunker: TextChunker::new(&config),
            embedder,
            summarizer,
            vector_store,
            record_store,
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(120))
                .build()
                .unwrap_or_default(),
            config,
        }
    }

    /// Run the full pipeline for a document behind a URL.
    pub async fn ingest(&self, document_id: &str, source_url: &str) -> IngestReport {
        let file_name = resolve_file_name(source_url);
        info!(document_id, file_name = %file_name, "starting ingestion");

        match self.run(document_id, &file_name, source_url).await {
            Ok(report) => report,
            Err(e) => {
                warn!(document_id, error = %e, "ingestion failed");
                IngestReport::failed(document_id, &file_name, &e)
            }
        }
    }

    /// Run the index/summarize/persist stages over already-extracted text.
    /// Used for documents supplied as local files.
    pub async fn ingest_document(&self, document: Document) -> IngestReport {
        let document_id = document.id.clone();
        let file_name = document.file_name.clone();

        match self.check_existing(&document_id, &file_name).await {
            Ok(Some(report)) => return report,
            Ok(None) => {}
            Err(e) => return IngestReport::failed(&document_id, &file_name, &e),
        }

        match self.index_document(document).await {
            Ok(report) => report,
            Err(e) => {
                warn!(document_id = %document_id, error = %e, "ingestion failed");
                IngestReport::failed(&document_id, &file_name, &e)
            }
        }
    }

    async fn run(
        &self,
        document_id: &str,
        file_name: &str,
        source_url: &str,
    ) -> Result<IngestReport, IngestError> {
        if let Some(report) = self.check_existing(document_id, file_name).await? {
            return Ok(report);
        }

        let bytes = self.fetch(source_url).await?;
        let document = self.extract(document_id, file_name, source_url, &bytes)?;
        self.index_document(document).await
    }

    /// Stage 2: in cache mode, short-circuit when the document already has
    /// indexed chunks. Refresh mode always falls through.
    async fn check_existing(
        &self,
        document_id: &str,
        file_name: &str,
    ) -> Result<Option<IngestReport>, IngestError> {
        if self.config.mode != IngestMode::Cache {
            return Ok(None);
        }

        if !self.vector_store.has_document(document_id).await? {
            return Ok(None);
        }

        debug!(document_id, "already indexed, skipping re-ingestion");

        let record = self
            .record_store
            .ingestion_record(document_id)
            .await
            .ok()
            .flatten();

        let (summary, keywords) = match record {
            Some(r) => (r.summary, r.keywords),
            None => ("document already indexed".to_string(), Vec::new()),
        };

        Ok(Some(IngestReport {
            document_id: document_id.to_string(),
            file_name: file_name.to_string(),
            summary,
            keywords,
            chunks_indexed: 0,
            chunks_failed: 0,
            already_indexed: true,
            persisted: false,
        }))
    }

    /// Stage 3: fetch the source bytes. Non-2xx is terminal for this run.
    async fn fetch(&self, source_url: &str) -> Result<Bytes, IngestError> {
        let response = self
            .http
            .get(source_url)
            .send()
            .await
            .map_err(|e| IngestError::FetchError(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(IngestError::FetchStatus(status.as_u16()));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| IngestError::FetchError(e.to_string()))?;

        if bytes.len() as u64 > self.config.max_document_bytes {
            return Err(IngestError::FetchError(format!(
                "document is {} bytes, limit is {}",
                bytes.len(),
                self.config.max_document_bytes
            )));
        }

        Ok(bytes)
    }

    /// Stage 4a: extract text page by page and rebuild it with page markers
    /// so the chunker can attribute chunks to pages. Public so locally
    /// supplied files can enter the pipeline without a fetch.
    pub fn extract(
        &self,
        document_id: &str,
        file_name: &str,
        source_url: &str,
        bytes: &[u8],
    ) -> Result<Document, IngestError> {
        let raw = pdf_extract::extract_text_from_mem(bytes)
            .map_err(|e| IngestError::ExtractError(e.to_string()))?;

        // Extraction separates pages with form feeds; a single page yields
        // no separator at all.
        let mut text = String::new();
        let mut num_pages = 0u32;
        for page in raw.split('\u{c}') {
            let page = page.trim();
            if page.is_empty() {
                continue;
            }
            num_pages += 1;
            text.push_str(&format!("## Page {}\n\n{}\n\n", num_pages, page));
        }

        if num_pages == 0 {
            return Err(IngestError::EmptyDocument);
        }

        Ok(Document::new(document_id, file_name, source_url, num_pages, text))
    }

    /// Stages 4b through 6: chunk, embed and upsert with per-chunk failure
    /// isolation, then summarize and persist the ingestion record.
    async fn index_document(&self, document: Document) -> Result<IngestReport, IngestError> {
        let chunks = self.chunker.chunk(&document);
        if chunks.is_empty() {
            return Err(IngestError::EmptyDocument);
        }

        let context = self.summary_context(&chunks);
        let total = chunks.len();

        let (indexed, failures) = self.embed_and_upsert(chunks).await;
        if indexed == 0 {
            return Err(IngestError::AllChunksFailed { failed: failures.len() });
        }
        for failure in &failures {
            warn!(
                document_id = %document.id,
                ordinal = failure.ordinal,
                reason = %failure.reason,
                "chunk failed"
            );
        }
        info!(
            document_id = %document.id,
            indexed,
            failed = failures.len(),
            total,
            "chunks indexed"
        );

        let (summary, keywords) = self.summarize(&document.file_name, &context).await;
        let persisted = self.persist(&document.id, &summary, &keywords).await;

        Ok(IngestReport {
            document_id: document.id,
            file_name: document.file_name,
            summary,
            keywords,
            chunks_indexed: indexed,
            chunks_failed: failures.len(),
            already_indexed: false,
            persisted,
        })
    }

    /// Fan out per-chunk metadata extraction, embedding and upsert. One
    /// chunk's failure never aborts the rest.
    async fn embed_and_upsert(&self, chunks: Vec<DocumentChunk>) -> (usize, Vec<ChunkFailure>) {
        let concurrency = self.config.concurrency.max(1) as usize;

        let results: Vec<Result<(), ChunkFailure>> = stream::iter(chunks)
            .map(|chunk| self.index_chunk(chunk))
            .buffer_unordered(concurrency)
            .collect()
            .await;

        let mut indexed = 0;
        let mut failures = Vec::new();
        for result in results {
            match result {
                Ok(()) => indexed += 1,
                Err(failure) => failures.push(failure),
            }
        }
        failures.sort_by_key(|f| f.ordinal);

        (indexed, failures)
    }

    async fn index_chunk(&self, mut chunk: DocumentChunk) -> Result<(), ChunkFailure> {
        let ordinal = chunk.ordinal;

        // Per-chunk metadata is enrichment; losing it does not fail the chunk.
        match self
            .summarizer
            .extract_summary(&chunk.file_name, &chunk.text)
            .await
        {
            Ok(extraction) => {
                if !extraction.summary.is_empty() {
                    chunk.summary = Some(extraction.summary);
                }
                chunk.keywords = extraction.keywords;
            }
            Err(e) => debug!(ordinal, error = %e, "chunk metadata extraction failed"),
        }

        chunk.embedding = self
            .embedder
            .embed_document(&chunk.text)
            .await
            .map_err(|e| ChunkFailure {
                ordinal,
                reason: e.to_string(),
            })?;

        self.vector_store
            .upsert_chunks(vec![chunk])
            .await
            .map_err(|e| ChunkFailure {
                ordinal,
                reason: e.to_string(),
            })?;

        Ok(())
    }

    fn summary_context(&self, chunks: &[DocumentChunk]) -> String {
        chunks
            .iter()
            .take(self.config.summary_context_chunks as usize)
            .map(|c| c.text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    /// Stage 5: document-level summary and keywords. A failed generation
    /// degrades to a placeholder summary; the indexed chunks stay queryable.
    async fn summarize(&self, file_name: &str, context: &str) -> (String, Vec<String>) {
        match self.summarizer.extract_summary(file_name, context).await {
            Ok(extraction) => {
                if extraction.keywords.len() < 5 {
                    debug!(
                        file_name,
                        keywords = extraction.keywords.len(),
                        "fewer than 5 keywords extracted"
                    );
                }
                (extraction.summary, extraction.keywords)
            }
            Err(e) => {
                warn!(file_name, error = %e, "summary generation failed");
                (format!("summary generation failed: {}", e), Vec::new())
            }
        }
    }

    /// Stage 6: write the ingestion record in a single call. Failure is
    /// logged, not retried; the run still counts as completed.
    async fn persist(&self, document_id: &str, summary: &str, keywords: &[String]) -> bool {
        let embedding = match self.embedder.embed_query(summary).await {
            Ok(v) => v,
            Err(e) => {
                debug!(document_id, error = %e, "summary embedding failed");
                Vec::new()
            }
        };

        let record = IngestionRecord {
            document_id: document_id.to_string(),
            summary: summary.to_string(),
            keywords: keywords.to_vec(),
            embedding,
            last_updated_at: chrono::Utc::now().timestamp_millis(),
        };

        match self.record_store.update_ingestion_record(&record).await {
            Ok(()) => true,
            Err(e) => {
                warn!(document_id, error = %e, "ingestion record write failed");
                false
            }
        }
    }
}
