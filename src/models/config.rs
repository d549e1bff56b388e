use serde::{Deserialize, Serialize};

pub const DEFAULT_EMBEDDING_URL: &str = "http://localhost:11411";
pub const DEFAULT_COMPLETION_URL: &str = "http://localhost:4111";
pub const DEFAULT_QDRANT_URL: &str = "http://localhost:6334";
pub const DEFAULT_COLLECTION: &str = "pdf_chunks";
pub const DEFAULT_EMBEDDING_DIMENSION: u32 = 1024;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub embedding: EmbeddingConfig,

    #[serde(default)]
    pub completion: CompletionConfig,

    #[serde(default)]
    pub vector_store: VectorStoreConfig,

    #[serde(default)]
    pub record_store: RecordStoreConfig,

    #[serde(default)]
    pub ingest: IngestConfig,

    #[serde(default)]
    pub billing: BillingConfig,

    #[serde(default)]
    pub server: ServerConfig,
}

impl Config {
    pub fn config_path() -> Option<std::path::PathBuf> {
        dirs::config_dir().map(|p| p.join("pdfqa").join("config.toml"))
    }

    pub fn load() -> Result<Self, crate::error::ConfigError> {
        if let Some(path) = Self::config_path() {
            if path.exists() {
                let content = std::fs::read_to_string(&path)?;
                let config: Config = toml::from_str(&content)?;
                return Ok(config);
            }
        }
        Ok(Self::default())
    }

    pub fn save(&self) -> Result<(), crate::error::ConfigError> {
        let path = Self::config_path().ok_or_else(|| {
            crate::error::ConfigError::PathError("could not determine config directory".to_string())
        })?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(&path, content)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_url")]
    pub url: String,

    #[serde(default = "default_embedding_dimension")]
    pub dimension: u32,

    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
}

fn default_embedding_url() -> String {
    DEFAULT_EMBEDDING_URL.to_string()
}

fn default_embedding_dimension() -> u32 {
    DEFAULT_EMBEDDING_DIMENSION
}

fn default_timeout() -> u64 {
    120
}

fn default_batch_size() -> u32 {
    8
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            url: default_embedding_url(),
            dimension: default_embedding_dimension(),
            timeout_secs: default_timeout(),
            batch_size: default_batch_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionConfig {
    #[serde(default = "default_completion_url")]
    pub url: String,

    #[serde(default = "default_completion_model")]
    pub model: String,

    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

fn default_completion_url() -> String {
    DEFAULT_COMPLETION_URL.to_string()
}

fn default_completion_model() -> String {
    "default".to_string()
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            url: default_completion_url(),
            model: default_completion_model(),
            timeout_secs: default_timeout(),
            api_key: None,
        }
    }
}

/// Which vector store backend to construct. Business logic never branches on
/// this; it is consumed once by the backend factory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VectorDriver {
    #[default]
    Qdrant,
    #[serde(rename = "postgres")]
    PostgreSQL,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorStoreConfig {
    #[serde(default)]
    pub driver: VectorDriver,

    #[serde(default = "default_qdrant_url")]
    pub url: String,

    #[serde(default = "default_collection")]
    pub collection: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,

    #[serde(default = "default_pool_max")]
    pub pool_max: u32,

    #[serde(default = "default_pool_acquire_timeout")]
    pub pool_acquire_timeout: u32,
}

fn default_qdrant_url() -> String {
    DEFAULT_QDRANT_URL.to_string()
}

fn default_collection() -> String {
    DEFAULT_COLLECTION.to_string()
}

fn default_pool_max() -> u32 {
    5
}

fn default_pool_acquire_timeout() -> u32 {
    30
}

impl VectorStoreConfig {
    /// Table name qualified with the configured schema, for the Postgres backend.
    pub fn qualified_table_name(&self) -> String {
        match &self.schema {
            Some(schema) => format!("{}.{}", schema, self.collection),
            None => self.collection.clone(),
        }
    }
}

impl Default for VectorStoreConfig {
    fn default() -> Self {
        Self {
            driver: VectorDriver::default(),
            url: default_qdrant_url(),
            collection: default_collection(),
            api_key: None,
            schema: None,
            pool_max: default_pool_max(),
            pool_acquire_timeout: default_pool_acquire_timeout(),
        }
    }
}

/// System-of-record connection. When `url` is empty the process-local backend
/// is used instead of the HTTP one.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecordStoreConfig {
    #[serde(default)]
    pub url: String,

    /// Shared service token for service-to-service mutations.
    #[serde(default)]
    pub service_token: String,

    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

/// Ingestion behavior when a document is already present in the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestMode {
    /// Short-circuit when the document is already indexed.
    #[default]
    Cache,
    /// Always re-run every stage and overwrite existing chunks.
    Refresh,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    #[serde(default)]
    pub mode: IngestMode,

    /// Target chunk size in characters.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u32,

    /// Overlap between consecutive chunks in characters.
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: u32,

    /// Degree of per-chunk embed+upsert fan-out. 1 means fully sequential.
    #[serde(default = "default_concurrency")]
    pub concurrency: u32,

    /// Maximum document size accepted from the fetch stage, in bytes.
    #[serde(default = "default_max_document_bytes")]
    pub max_document_bytes: u64,

    /// How many indexed chunks feed the document-level summary.
    #[serde(default = "default_summary_context_chunks")]
    pub summary_context_chunks: u32,
}

fn default_chunk_size() -> u32 {
    2048
}

fn default_chunk_overlap() -> u32 {
    200
}

fn default_concurrency() -> u32 {
    4
}

fn default_max_document_bytes() -> u64 {
    50 * 1024 * 1024
}

fn default_summary_context_chunks() -> u32 {
    8
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            mode: IngestMode::default(),
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            concurrency: default_concurrency(),
            max_document_bytes: default_max_document_bytes(),
            summary_context_chunks: default_summary_context_chunks(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingConfig {
    /// Billing provider API base URL.
    #[serde(default = "default_billing_url")]
    pub url: String,

    #[serde(default)]
    pub api_key: String,

    /// Metered price identifying the subscription plan this service bills.
    #[serde(default)]
    pub metered_price_id: String,

    /// Free-tier ceiling in usage units per billing period.
    #[serde(default = "default_free_tier_units")]
    pub free_tier_units: u64,

    #[serde(default = "default_checkout_success_url")]
    pub checkout_success_url: String,

    #[serde(default = "default_checkout_cancel_url")]
    pub checkout_cancel_url: String,
}

fn default_billing_url() -> String {
    "https://api.stripe.com/v1".to_string()
}

fn default_free_tier_units() -> u64 {
    100_000
}

fn default_checkout_success_url() -> String {
    "http://localhost:3000/dashboard?checkout=success".to_string()
}

fn default_checkout_cancel_url() -> String {
    "http://localhost:3000/dashboard?checkout=cancel".to_string()
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            url: default_billing_url(),
            api_key: String::new(),
            metered_price_id: String::new(),
            free_tier_units: default_free_tier_units(),
            checkout_success_url: default_checkout_success_url(),
            checkout_cancel_url: default_checkout_cancel_url(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Maximum time to wait for the next upstream stream fragment before the
    /// request is failed. Keeps a silent upstream from hanging the gateway.
    #[serde(default = "default_stream_read_timeout")]
    pub stream_read_timeout_secs: u64,

    /// Chat retrieval depth: how many chunks are pulled into the model context.
    #[serde(default = "default_retrieval_top_k")]
    pub retrieval_top_k: u32,
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_stream_read_timeout() -> u64 {
    60
}

fn default_retrieval_top_k() -> u32 {
    5
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            stream_read_timeout_secs: default_stream_read_timeout(),
            retrieval_top_k: default_retrieval_top_k(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.embedding.url, DEFAULT_EMBEDDING_URL);
        assert_eq!(config.vector_store.url, DEFAULT_QDRANT_URL);
        assert_eq!(config.vector_store.collection, DEFAULT_COLLECTION);
        assert_eq!(config.ingest.mode, IngestMode::Cache);
    }

    #[test]
    fn test_config_path() {
        let path = Config::config_path();
        assert!(path.is_some());
    }

    #[test]
    fn test_ingest_mode_parse() {
        let config: IngestConfig = toml::from_str("mode = \"refresh\"").unwrap();
        assert_eq!(config.mode, IngestMode::Refresh);
    }

    #[test]
    fn test_vector_driver_parse() {
        let config: VectorStoreConfig = toml::from_str("driver = \"postgres\"").unwrap();
        assert_eq!(config.driver, VectorDriver::PostgreSQL);
        let config: VectorStoreConfig = toml::from_str("driver = \"memory\"").unwrap();
        assert_eq!(config.driver, VectorDriver::Memory);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[vector_store]\ndriver = \"memory\"\n\n[billing]\nfree_tier_units = 500\n",
        )
        .unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let config: Config = toml::from_str(&content).unwrap();
        assert_eq!(config.vector_store.driver, VectorDriver::Memory);
        assert_eq!(config.billing.free_tier_units, 500);
        assert_eq!(config.embedding.url, DEFAULT_EMBEDDING_URL);
        assert_eq!(config.server.retrieval_top_k, default_retrieval_top_k());
    }

    #[test]
    fn test_qualified_table_name() {
        let mut config = VectorStoreConfig::default();
        assert_eq!(config.qualified_table_name(), DEFAULT_COLLECTION);
        config.schema = Some("rag".to_string());
        assert_eq!(config.qualified_table_name(), format!("rag.{}", DEFAULT_COLLECTION));
    }
}
