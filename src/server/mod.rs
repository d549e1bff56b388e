//! HTTP surface: ingestion trigger, streaming chat, health.
//!
//! | Method | Path      | Description                                |
//! |--------|-----------|--------------------------------------------|
//! | `POST` | `/ingest` | Run the ingestion pipeline for a document  |
//! | `POST` | `/chat`   | One chat turn, answered as an SSE stream   |
//! | `GET`  | `/health` | Health check (returns version)             |
//!
//! Chat requests carry the calling account in the `x-account-id` header;
//! issuing that identity is an upstream concern. A billing-blocked turn
//! answers `402` with a JSON body `{"error", "checkoutUrl"}` instead of a
//! stream.

pub mod gateway;

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::sse::{Event, KeepAlive, Sse},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::error::ChatError;
use crate::models::{Authorization, ChatRequest, Config};
use crate::server::gateway::{ChatGateway, StreamEvent};
use crate::services::{
    create_backend, BillingGate, CompletionClient, Embedder, EmbeddingClient, HttpBillingClient,
    HttpRecordStore, IngestPipeline, MemoryRecordStore, MemoryUsageMeter, RecordStore, Summarizer,
    VectorStore,
};

#[derive(Clone)]
struct AppState {
    gateway: Arc<ChatGateway>,
    pipeline: Arc<IngestPipeline>,
}

/// Build every client and backend from configuration and serve until
/// shutdown. All handles are constructed here and injected; nothing is
/// resolved from ambient state later.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let embedding = Arc::new(EmbeddingClient::new(&config.embedding)?);
    let completion = Arc::new(CompletionClient::new(&config.completion)?);

    let vector_store: Arc<dyn VectorStore> =
        Arc::from(create_backend(&config.vector_store, embedding.dimension()).await?);
    vector_store.create_collection().await?;

    // An empty record store URL selects the in-process store (local mode)
    let record_store: Arc<dyn RecordStore> = if config.record_store.url.is_empty() {
        Arc::new(MemoryRecordStore::new())
    } else {
        Arc::new(HttpRecordStore::new(&config.record_store)?)
    };

    let usage = Arc::new(MemoryUsageMeter::new());
    let billing_api = Arc::new(HttpBillingClient::new(&config.billing)?);
    let gate = Arc::new(BillingGate::new(
        billing_api,
        Arc::clone(&record_store),
        usage.clone(),
        &config.billing,
    ));

    let summarizer = Arc::clone(&completion) as Arc<dyn Summarizer>;

    let gateway = Arc::new(ChatGateway::new(
        completion,
        Arc::clone(&embedding) as Arc<dyn Embedder>,
        Arc::clone(&vector_store),
        Arc::clone(&record_store),
        usage,
        gate,
        u64::from(config.server.retrieval_top_k),
        Duration::from_secs(config.server.stream_read_timeout_secs),
    ));

    let pipeline = Arc::new(IngestPipeline::new(
        embedding as Arc<dyn Embedder>,
        summarizer,
        vector_store,
        record_store,
        config.ingest.clone(),
    ));

    let state = AppState { gateway, pipeline };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/ingest", post(handle_ingest))
        .route("/chat", post(handle_chat))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state);

    let bind_addr = &config.server.bind;
    info!(bind = %bind_addr, "server listening");

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        if let Ok(mut sig) = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            sig.recv().await;
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
}

#[derive(Debug, Deserialize)]
struct IngestRequest {
    #[serde(rename = "documentId")]
    document_id: String,
    #[serde(rename = "sourceURL", alias = "sourceUrl")]
    source_url: String,
}

async fn handle_ingest(
    State(state): State<AppState>,
    Json(request): Json<IngestRequest>,
) -> Response {
    if request.document_id.is_empty() || request.source_url.is_empty() {
        return error_response(
            StatusCode::BAD_REQUEST,
            "documentId and sourceURL are required",
        );
    }

    let report = state
        .pipeline
        .ingest(&request.document_id, &request.source_url)
        .await;

    Json(report).into_response()
}

async fn handle_chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ChatRequest>,
) -> Response {
    let Some(account_id) = headers
        .get("x-account-id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
    else {
        return error_response(StatusCode::UNAUTHORIZED, "missing x-account-id header");
    };

    match state.gateway.gate_check(&account_id, &request).await {
        Ok(Authorization::Allowed { metered_item }) => {
            let (tx, rx) = mpsc::channel::<StreamEvent>(32);
            let gateway = Arc::clone(&state.gateway);
            tokio::spawn(async move {
                gateway
                    .run_turn(&account_id, &request, metered_item.as_deref(), tx)
                    .await;
            });

            let stream = ReceiverStream::new(rx).map(|event| {
                Ok::<_, Infallible>(match event {
                    StreamEvent::Text(fragment) => Event::default().data(fragment),
                    StreamEvent::Error(message) => Event::default().event("error").data(message),
                })
            });
            Sse::new(stream).keep_alive(KeepAlive::default()).into_response()
        }
        Ok(Authorization::Blocked { checkout_url }) => (
            StatusCode::PAYMENT_REQUIRED,
            Json(json!({
                "error": "usage limit reached, subscription required",
                "checkoutUrl": checkout_url,
            })),
        )
            .into_response(),
        Err(e) => {
            warn!(error = %e, "gate check failed");
            chat_error_response(e)
        }
    }
}

async fn handle_health() -> Response {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
    .into_response()
}

fn chat_error_response(error: ChatError) -> Response {
    let status = match &error {
        ChatError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        ChatError::NotThreadOwner(_) => StatusCode::FORBIDDEN,
        ChatError::Upstream(_)
        | ChatError::RecordStore(_)
        | ChatError::Billing(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(status, &error.to_string())
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}
