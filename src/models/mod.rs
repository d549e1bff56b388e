mod billing;
mod chat;
mod config;
mod document;
mod search;

pub use billing::{
    current_period_key, period_key, Authorization, CheckoutSession, Subscription,
    SubscriptionItem,
};
pub use chat::{ChatAuthor, ChatRequest, ChatTurn, TokenUsage};
pub use config::{
    BillingConfig, CompletionConfig, Config, EmbeddingConfig, IngestConfig, IngestMode,
    RecordStoreConfig, ServerConfig, VectorDriver, VectorStoreConfig, DEFAULT_COLLECTION,
    DEFAULT_COMPLETION_URL, DEFAULT_EMBEDDING_DIMENSION, DEFAULT_EMBEDDING_URL, DEFAULT_QDRANT_URL,
};
pub use document::{Document, DocumentChunk, IngestionRecord};
pub use search::{ChunkFilter, SearchResult, SearchResults};
