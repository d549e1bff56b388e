mod billing;
mod chunker;
mod completion;
mod embedding;
mod pipeline;
mod record_store;
mod stream;
mod usage;
mod vector_store;

pub use billing::{BillingApi, BillingGate, HttpBillingClient};
pub use chunker::TextChunker;
pub use completion::{ChatMessage, CompletionClient, SummaryExtraction, Summarizer};
pub use embedding::{Embedder, EmbeddingClient};
pub use pipeline::{resolve_file_name, ChunkFailure, IngestPipeline, IngestReport};
pub use record_store::{HttpRecordStore, MemoryRecordStore, RecordStore};
pub use stream::{StreamParser, StreamRecord};
pub use usage::{MemoryUsageMeter, UsageMeter};
pub use vector_store::{
    create_backend, CollectionInfo, MemoryBackend, PgVectorBackend, QdrantBackend, VectorStore,
};
