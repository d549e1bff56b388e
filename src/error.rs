//! Error types for the document QA service.

use thiserror::Error;

use crate::utils::retry::Retryable;

/// Errors related to embedding operations.
#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("failed to connect to embedding server: {0}")]
    ConnectionError(String),

    #[error("embedding server error: {0}")]
    ServerError(String),

    #[error("embedding request failed: {0}")]
    RequestError(#[from] reqwest::Error),

    #[error("invalid embedding response: {0}")]
    InvalidResponse(String),

    #[error("embedding timeout")]
    Timeout,
}

impl Retryable for EmbeddingError {
    fn is_retryable(&self) -> bool {
        match self {
            // Connection and timeout errors are retryable
            EmbeddingError::ConnectionError(_) | EmbeddingError::Timeout => true,
            // Server errors might be transient (e.g., 503 Service Unavailable)
            EmbeddingError::ServerError(msg) => {
                msg.contains("503")
                    || msg.contains("502")
                    || msg.contains("504")
                    || msg.contains("429")
                    || msg.to_lowercase().contains("unavailable")
                    || msg.to_lowercase().contains("too many requests")
            }
            // Request errors depend on the underlying cause
            EmbeddingError::RequestError(e) => e.is_timeout() || e.is_connect(),
            // Invalid responses are not retryable
            EmbeddingError::InvalidResponse(_) => false,
        }
    }
}

/// Errors related to the completion model (generation and chat streaming).
#[derive(Debug, Error)]
pub enum CompletionError {
    #[error("failed to connect to completion server: {0}")]
    ConnectionError(String),

    #[error("completion server error: {0}")]
    ServerError(String),

    #[error("completion request failed: {0}")]
    RequestError(#[from] reqwest::Error),

    #[error("invalid completion response: {0}")]
    InvalidResponse(String),

    #[error("completion stream interrupted: {0}")]
    StreamError(String),

    #[error("completion timeout")]
    Timeout,
}

/// Errors related to vector store operations.
#[derive(Debug, Error)]
pub enum VectorStoreError {
    #[error("failed to connect to vector store: {0}")]
    ConnectionError(String),

    #[error("collection error: {0}")]
    CollectionError(String),

    #[error("upsert error: {0}")]
    UpsertError(String),

    #[error("search error: {0}")]
    SearchError(String),

    #[error("delete error: {0}")]
    DeleteError(String),

    #[error("postgres error: {0}")]
    PostgresError(String),

    #[error("pgvector extension error: {0}")]
    PgVectorExtensionError(String),
}

/// Errors related to the system-of-record client.
#[derive(Debug, Error)]
pub enum RecordStoreError {
    #[error("record store request failed: {0}")]
    RequestError(#[from] reqwest::Error),

    #[error("record store rejected the call: status {status}: {body}")]
    MutationError { status: u16, body: String },

    #[error("invalid record store response: {0}")]
    InvalidResponse(String),

    #[error("record not found: {0}")]
    NotFound(String),
}

impl Retryable for RecordStoreError {
    fn is_retryable(&self) -> bool {
        match self {
            RecordStoreError::RequestError(e) => e.is_timeout() || e.is_connect(),
            RecordStoreError::MutationError { status, .. } => {
                matches!(status, 429 | 502 | 503 | 504)
            }
            RecordStoreError::InvalidResponse(_) | RecordStoreError::NotFound(_) => false,
        }
    }
}

/// Errors related to the billing provider.
#[derive(Debug, Error)]
pub enum BillingError {
    #[error("billing request failed: {0}")]
    RequestError(#[from] reqwest::Error),

    #[error("billing provider error: status {status}: {body}")]
    ProviderError { status: u16, body: String },

    #[error("invalid billing response: {0}")]
    InvalidResponse(String),

    #[error("record store error: {0}")]
    RecordStore(#[from] RecordStoreError),
}

/// Errors raised inside the ingestion pipeline. Converted to a well-formed
/// report at the pipeline boundary; they never cross it.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("failed to fetch document: {0}")]
    FetchError(String),

    #[error("document fetch returned status {0}")]
    FetchStatus(u16),

    #[error("text extraction error: {0}")]
    ExtractError(String),

    #[error("document produced no usable text")]
    EmptyDocument,

    #[error("no chunks could be indexed ({failed} chunk(s) failed)")]
    AllChunksFailed { failed: usize },

    #[error("embedding error: {0}")]
    EmbeddingError(#[from] EmbeddingError),

    #[error("vector store error: {0}")]
    VectorStoreError(#[from] VectorStoreError),
}

/// Errors raised by the streaming chat gateway.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("thread {0} does not belong to the requesting account")]
    NotThreadOwner(String),

    #[error("upstream model error: {0}")]
    Upstream(#[from] CompletionError),

    #[error("client disconnected mid-stream")]
    ClientDisconnected,

    #[error("upstream stream stalled past the configured deadline")]
    DeadlineExceeded,

    #[error("record store error: {0}")]
    RecordStore(#[from] RecordStoreError),

    #[error("billing error: {0}")]
    Billing(#[from] BillingError),
}

/// Errors related to configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    TomlParseError(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),

    #[error("path error: {0}")]
    PathError(String),

    #[error("validation error: {0}")]
    ValidationError(String),
}

/// Application-level errors that wrap domain errors.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("completion error: {0}")]
    Completion(#[from] CompletionError),

    #[error("vector store error: {0}")]
    VectorStore(#[from] VectorStoreError),

    #[error("record store error: {0}")]
    RecordStore(#[from] RecordStoreError),

    #[error("billing error: {0}")]
    Billing(#[from] BillingError),

    #[error("chat error: {0}")]
    Chat(#[from] ChatError),

    #[error("{0}")]
    Other(String),
}
