//! Similarity-query models.

use serde::{Deserialize, Serialize};

/// Exact-match metadata filter applied to a similarity query.
/// Supports the two keys the index is partitioned on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkFilter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
}

impl ChunkFilter {
    pub fn document(document_id: impl Into<String>) -> Self {
        Self {
            document_id: Some(document_id.into()),
            file_name: None,
        }
    }

    pub fn file(file_name: impl Into<String>) -> Self {
        Self {
            document_id: None,
            file_name: Some(file_name.into()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.document_id.is_none() && self.file_name.is_none()
    }
}

/// A single ranked match from the vector index.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResult {
    pub chunk_id: String,
    /// Cosine similarity score (higher is closer).
    pub score: f32,
    pub text: String,
    pub document_id: String,
    pub file_name: String,
    pub page: Option<u32>,
    pub section: Option<String>,
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub keywords: Vec<String>,
}

/// Collection of search results with timing, for the CLI surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResults {
    pub query: String,
    pub results: Vec<SearchResult>,
    pub duration_ms: u64,
}

impl SearchResults {
    pub fn new(query: String, results: Vec<SearchResult>, duration_ms: u64) -> Self {
        Self {
            query,
            results,
            duration_ms,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }
}
