use serde::{Deserialize, Serialize};

/// A source document fetched from a URL and indexed as chunks.
/// Immutable once chunked; re-ingestion overwrites chunks by deterministic id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    /// Canonical file name resolved from the source URL.
    pub file_name: String,
    pub source_url: String,
    pub num_pages: u32,
    pub text: String,
}

impl Document {
    pub fn new(
        id: impl Into<String>,
        file_name: impl Into<String>,
        source_url: impl Into<String>,
        num_pages: u32,
        text: String,
    ) -> Self {
        Self {
            id: id.into(),
            file_name: file_name.into(),
            source_url: source_url.into(),
            num_pages,
            text,
        }
    }
}

/// A bounded span of a document's extracted text, independently embedded
/// and indexed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentChunk {
    pub id: String,
    pub document_id: String,
    pub file_name: String,
    pub ordinal: u32,
    pub text: String,
    /// Page number parsed from the surrounding page marker, if any.
    pub page: Option<u32>,
    /// Section label (e.g. the nearest heading) the chunk falls under.
    pub section: Option<String>,
    /// Model-derived chunk summary; absent when extraction was skipped or failed.
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub keywords: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub embedding: Vec<f32>,
}

impl DocumentChunk {
    /// Deterministic chunk id from (document id, ordinal), so re-ingestion
    /// upserts instead of inserting duplicates.
    pub fn generate_id(document_id: &str, ordinal: u32) -> String {
        use uuid::Uuid;
        let name = format!("{}:{}", document_id, ordinal);
        Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()).to_string()
    }

    pub fn new(
        document: &Document,
        text: String,
        ordinal: u32,
        page: Option<u32>,
        section: Option<String>,
    ) -> Self {
        let id = Self::generate_id(&document.id, ordinal);
        Self {
            id,
            document_id: document.id.clone(),
            file_name: document.file_name.clone(),
            ordinal,
            text,
            page,
            section,
            summary: None,
            keywords: Vec::new(),
            embedding: Vec::new(),
        }
    }
}

/// The durable artifact the pipeline writes back to the system of record.
/// Always written whole; never partially.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestionRecord {
    pub document_id: String,
    pub summary: String,
    pub keywords: Vec<String>,
    /// Document-level embedding of the summary, for related-document lookup.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub embedding: Vec<f32>,
    /// Epoch milliseconds of the last successful ingestion run.
    pub last_updated_at: i64,
}
