//! Subcommand handlers.

use anyhow::{Context as _, Result};
use clap::Args;
use std::sync::Arc;
use std::time::Instant;

use crate::cli::ConfigCommand;
use crate::models::{ChunkFilter, Config, IngestMode, SearchResults};
use crate::server;
use crate::services::{
    create_backend, CompletionClient, Embedder, EmbeddingClient, HttpRecordStore, IngestPipeline,
    MemoryRecordStore, RecordStore, Summarizer, VectorStore,
};

#[derive(Debug, Args)]
pub struct IngestArgs {
    /// Source URL or local PDF file path
    pub source: String,

    /// Document id (defaults to the resolved file name without extension)
    #[arg(long)]
    pub id: Option<String>,

    /// Re-run every stage even if the document is already indexed
    #[arg(long)]
    pub refresh: bool,
}

#[derive(Debug, Args)]
pub struct SearchArgs {
    /// Query text
    pub query: String,

    /// Maximum number of results
    #[arg(long, short = 'l', default_value_t = 5)]
    pub limit: u64,

    /// Restrict to one document id
    #[arg(long)]
    pub document: Option<String>,

    /// Restrict to one file name
    #[arg(long)]
    pub file: Option<String>,
}

struct Clients {
    embedding: Arc<EmbeddingClient>,
    vector_store: Arc<dyn VectorStore>,
    record_store: Arc<dyn RecordStore>,
}

async fn build_clients(config: &Config) -> Result<Clients> {
    let embedding = Arc::new(EmbeddingClient::new(&config.embedding)?);

    let vector_store: Arc<dyn VectorStore> =
        Arc::from(create_backend(&config.vector_store, embedding.dimension()).await?);

    let record_store: Arc<dyn RecordStore> = if config.record_store.url.is_empty() {
        Arc::new(MemoryRecordStore::new())
    } else {
        Arc::new(HttpRecordStore::new(&config.record_store)?)
    };

    Ok(Clients {
        embedding,
        vector_store,
        record_store,
    })
}

pub async fn handle_serve(config: Config) -> Result<()> {
    server::run_server(&config).await
}

pub async fn handle_ingest(args: IngestArgs, mut config: Config, json: bool) -> Result<()> {
    if args.refresh {
        config.ingest.mode = IngestMode::Refresh;
    }

    let clients = build_clients(&config).await?;
    clients.vector_store.create_collection().await?;

    let completion = Arc::new(CompletionClient::new(&config.completion)?);
    let pipeline = IngestPipeline::new(
        Arc::clone(&clients.embedding) as Arc<dyn Embedder>,
        completion as Arc<dyn Summarizer>,
        clients.vector_store,
        clients.record_store,
        config.ingest.clone(),
    );

    let is_url = args.source.starts_with("http://") || args.source.starts_with("https://");
    let report = if is_url {
        let file_name = crate::services::resolve_file_name(&args.source);
        let document_id = args
            .id
            .unwrap_or_else(|| file_name.trim_end_matches(".pdf").to_string());
        pipeline.ingest(&document_id, &args.source).await
    } else {
        let path = std::path::Path::new(&args.source);
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read {}", args.source))?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "document.pdf".to_string());
        let document_id = args
            .id
            .unwrap_or_else(|| file_name.trim_end_matches(".pdf").to_string());

        let document = pipeline.extract(&document_id, &file_name, &args.source, &bytes)?;
        pipeline.ingest_document(document).await
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    if report.already_indexed {
        println!("Already indexed: {}", report.document_id);
    } else {
        println!(
            "Indexed {} chunk(s) ({} failed) for {}",
            report.chunks_indexed, report.chunks_failed, report.document_id
        );
        if !report.persisted {
            println!("Warning: ingestion record was not persisted");
        }
    }
    println!("Summary: {}", report.summary);
    if !report.keywords.is_empty() {
        println!("Keywords: {}", report.keywords.join(", "));
    }

    Ok(())
}

pub async fn handle_search(args: SearchArgs, config: Config, json: bool) -> Result<()> {
    let clients = build_clients(&config).await?;

    let filter = ChunkFilter {
        document_id: args.document,
        file_name: args.file,
    };

    let start = Instant::now();
    let query_vector = clients.embedding.embed_query(&args.query).await?;
    let results = clients
        .vector_store
        .search(query_vector, args.limit, &filter)
        .await?;
    let duration_ms = start.elapsed().as_millis() as u64;

    let results = SearchResults {
        query: args.query,
        results,
        duration_ms,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&results)?);
        return Ok(());
    }

    if results.results.is_empty() {
        println!("No results for \"{}\"", results.query);
        return Ok(());
    }

    println!(
        "{} result(s) for \"{}\" ({} ms)\n",
        results.results.len(),
        results.query,
        results.duration_ms
    );
    for (i, result) in results.results.iter().enumerate() {
        let location = match (result.page, &result.section) {
            (Some(page), Some(section)) => format!("{} p.{} ({})", result.file_name, page, section),
            (Some(page), None) => format!("{} p.{}", result.file_name, page),
            _ => result.file_name.clone(),
        };
        println!("{}. [{:.3}] {}", i + 1, result.score, location);

        let preview: String = result.text.chars().take(200).collect();
        println!("   {}\n", preview.replace('\n', " "));
    }

    Ok(())
}

pub async fn handle_status(config: Config, json: bool) -> Result<()> {
    let clients = build_clients(&config).await?;

    let embedding_ok = clients.embedding.health_check().await.is_ok();
    let index_ok = clients.vector_store.health_check().await.unwrap_or(false);
    let info = if index_ok {
        clients.vector_store.get_collection_info().await?
    } else {
        None
    };

    if json {
        println!(
            "{}",
            serde_json::json!({
                "embeddingServer": embedding_ok,
                "vectorIndex": index_ok,
                "collection": clients.vector_store.collection(),
                "pointsCount": info.as_ref().map(|i| i.points_count),
            })
        );
        return Ok(());
    }

    println!(
        "Embedding server ({}): {}",
        clients.embedding.base_url(),
        if embedding_ok { "ok" } else { "unreachable" }
    );
    match (index_ok, info) {
        (true, Some(info)) => println!(
            "Vector index: ok ({} points in '{}')",
            info.points_count,
            clients.vector_store.collection()
        ),
        (true, None) => println!(
            "Vector index: ok (collection '{}' not created yet)",
            clients.vector_store.collection()
        ),
        (false, _) => println!("Vector index: unreachable"),
    }

    Ok(())
}

pub async fn handle_config(command: ConfigCommand, config: Config, json: bool) -> Result<()> {
    match command {
        ConfigCommand::Init { force } => {
            let path = Config::config_path().context("could not determine config directory")?;
            if path.exists() && !force {
                anyhow::bail!(
                    "configuration file already exists at {} (use --force to overwrite)",
                    path.display()
                );
            }
            Config::default().save()?;
            println!("Wrote {}", path.display());
            Ok(())
        }
        ConfigCommand::Show => {
            if json {
                println!("{}", serde_json::to_string_pretty(&config)?);
            } else {
                print!("{}", toml::to_string_pretty(&config)?);
            }
            Ok(())
        }
        ConfigCommand::Path => {
            let path = Config::config_path().context("could not determine config directory")?;
            println!("{}", path.display());
            Ok(())
        }
    }
}
