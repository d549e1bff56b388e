//! Streaming chat gateway.
//!
//! One request walks GATE_CHECK -> STREAMING -> FINALIZING -> DONE, with
//! GATE_CHECK -> BLOCKED as the alternate terminal state. The gateway
//! relays upstream text fragments to the client in arrival order while
//! accumulating them for the trailing usage record; usage is committed
//! exactly once per request, and never for a failed or cancelled turn.

use futures::{Stream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{ChatError, CompletionError};
use crate::models::{
    current_period_key, Authorization, ChatRequest, ChatTurn, ChunkFilter, TokenUsage,
};
use crate::services::{
    BillingGate, ChatMessage, CompletionClient, Embedder, RecordStore, StreamParser, StreamRecord,
    UsageMeter, VectorStore,
};

/// One event on the client channel. Text fragments become plain SSE data
/// events; a mid-flight failure becomes a named `error` event so the
/// client can tell a broken stream from a complete one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Text(String),
    Error(String),
}

/// What a fully relayed stream left behind.
#[derive(Debug, Clone)]
pub struct StreamOutcome {
    /// The assembled answer, fragments concatenated in arrival order.
    pub answer: String,
    /// The last usage record seen in the stream, if any.
    pub usage: Option<TokenUsage>,
}

/// Relay an upstream model stream into a client channel.
///
/// Every text fragment is forwarded the moment it completes, in arrival
/// order, and simultaneously appended to the accumulated answer. A failed
/// send means the client went away: the upstream stream is dropped and no
/// outcome is produced. A read stalling past `read_timeout` aborts the
/// turn rather than hanging forever.
pub async fn relay_stream<S>(
    mut upstream: S,
    tx: mpsc::Sender<StreamEvent>,
    read_timeout: Duration,
) -> Result<StreamOutcome, ChatError>
where
    S: Stream<Item = Result<bytes::Bytes, CompletionError>> + Unpin,
{
    let mut parser = StreamParser::new();
    let mut answer = String::new();
    let mut usage: Option<TokenUsage> = None;

    loop {
        let next = tokio::time::timeout(read_timeout, upstream.next())
            .await
            .map_err(|_| ChatError::DeadlineExceeded)?;

        let Some(item) = next else {
            break;
        };
        let bytes = item?;

        for record in parser.feed(&bytes) {
            match record {
                StreamRecord::Text(fragment) => {
                    answer.push_str(&fragment);
                    if tx.send(StreamEvent::Text(fragment)).await.is_err() {
                        return Err(ChatError::ClientDisconnected);
                    }
                }
                StreamRecord::Usage(u) => usage = Some(u),
                StreamRecord::Control { tag } => debug!(tag, "control record"),
            }
        }
    }

    // A record may end exactly at stream end without a newline
    match parser.finish() {
        Some(StreamRecord::Text(fragment)) => {
            answer.push_str(&fragment);
            if tx.send(StreamEvent::Text(fragment)).await.is_err() {
                return Err(ChatError::ClientDisconnected);
            }
        }
        Some(StreamRecord::Usage(u)) => usage = Some(u),
        _ => {}
    }

    Ok(StreamOutcome { answer, usage })
}

pub struct ChatGateway {
    completion: Arc<CompletionClient>,
    embedder: Arc<dyn Embedder>,
    vector_store: Arc<dyn VectorStore>,
    record_store: Arc<dyn RecordStore>,
    usage: Arc<dyn UsageMeter>,
    gate: Arc<BillingGate>,
    retrieval_top_k: u64,
    read_timeout: Duration,
}

impl ChatGateway {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        completion: Arc<CompletionClient>,
        embedder: Arc<dyn Embedder>,
        vector_store: Arc<dyn VectorStore>,
        record_store: Arc<dyn RecordStore>,
        usage: Arc<dyn UsageMeter>,
        gate: Arc<BillingGate>,
        retrieval_top_k: u64,
        read_timeout: Duration,
    ) -> Self {
        Self {
            completion,
            embedder,
            vector_store,
            record_store,
            usage,
            gate,
            retrieval_top_k,
            read_timeout,
        }
    }

    /// GATE_CHECK plus the pre-flight checks that must reject before any
    /// side effect: request validation and thread ownership.
    pub async fn gate_check(
        &self,
        account_id: &str,
        request: &ChatRequest,
    ) -> Result<Authorization, ChatError> {
        if request.message.trim().is_empty() {
            return Err(ChatError::InvalidRequest("empty message".to_string()));
        }
        if request.document_id.is_empty() {
            return Err(ChatError::InvalidRequest("missing documentId".to_string()));
        }
        if request.thread_id.is_empty() {
            return Err(ChatError::InvalidRequest("missing threadId".to_string()));
        }

        match self.record_store.thread_owner(&request.thread_id).await? {
            Some(owner) if owner != account_id => {
                return Err(ChatError::NotThreadOwner(request.thread_id.clone()));
            }
            Some(_) => {}
            None => {
                self.record_store
                    .claim_thread(&request.thread_id, account_id)
                    .await?;
            }
        }

        Ok(self.gate.authorize(account_id).await?)
    }

    /// STREAMING: record the user turn, retrieve context, open the model
    /// stream, and relay it into `tx`. Returns the outcome for FINALIZING.
    pub async fn stream_turn(
        &self,
        account_id: &str,
        request: &ChatRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<StreamOutcome, ChatError> {
        self.record_store
            .append_chat_turn(&ChatTurn::user(&request.thread_id, &request.message))
            .await?;

        let messages = self.build_messages(request).await?;

        let upstream = self
            .completion
            .stream_chat(&messages, &request.thread_id, account_id)
            .await
            .map_err(ChatError::Upstream)?;

        relay_stream(upstream, tx, self.read_timeout).await
    }

    /// FINALIZING: persist the agent turn and commit usage, each at most
    /// once. Skipped entirely when the stream failed, the client left, or
    /// the stream never produced a usage record.
    pub async fn finalize(
        &self,
        account_id: &str,
        thread_id: &str,
        metered_item: Option<&str>,
        outcome: &StreamOutcome,
    ) -> Result<(), ChatError> {
        let Some(usage) = outcome.usage else {
            debug!(thread_id, "stream carried no usage record");
            return Ok(());
        };

        self.record_store
            .append_chat_turn(&ChatTurn::agent(thread_id, &outcome.answer))
            .await?;

        let total = self
            .usage
            .increment(account_id, &current_period_key(), usage.total())
            .await?;
        info!(account_id, units = usage.total(), total, "usage recorded");

        self.gate
            .record_metered_usage(metered_item, usage.total())
            .await?;

        Ok(())
    }

    /// Full request lifecycle after a passed gate check. Any error after
    /// fragments were sent leaves them delivered; only finalization is
    /// skipped.
    pub async fn run_turn(
        &self,
        account_id: &str,
        request: &ChatRequest,
        metered_item: Option<&str>,
        tx: mpsc::Sender<StreamEvent>,
    ) {
        match self.stream_turn(account_id, request, tx.clone()).await {
            Ok(outcome) => {
                if let Err(e) = self
                    .finalize(account_id, &request.thread_id, metered_item, &outcome)
                    .await
                {
                    warn!(thread_id = %request.thread_id, error = %e, "finalization failed");
                }
            }
            Err(ChatError::ClientDisconnected) => {
                debug!(thread_id = %request.thread_id, "client disconnected mid-stream");
            }
            Err(e) => {
                warn!(thread_id = %request.thread_id, error = %e, "stream failed");
                let _ = tx.send(StreamEvent::Error(e.to_string())).await;
            }
        }
    }

    /// Ground the model in the document: top-K similar chunks become a
    /// system prompt preceding the user message.
    async fn build_messages(&self, request: &ChatRequest) -> Result<Vec<ChatMessage>, ChatError> {
        let query_vector = self
            .embedder
            .embed_query(&request.message)
            .await
            .map_err(|e| ChatError::InvalidRequest(format!("query embedding failed: {}", e)))?;

        let results = self
            .vector_store
            .search(
                query_vector,
                self.retrieval_top_k,
                &ChunkFilter::document(&request.document_id),
            )
            .await
            .map_err(|e| ChatError::InvalidRequest(format!("retrieval failed: {}", e)))?;

        let context = results
            .iter()
            .map(|r| r.text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");

        Ok(vec![
            ChatMessage::system(format!(
                "Answer using only the following document excerpts.\n\n{}",
                context
            )),
            ChatMessage::user(&request.message),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BillingError;
    use crate::models::{BillingConfig, CheckoutSession, Subscription};
    use crate::services::{BillingApi, MemoryRecordStore, MemoryUsageMeter};
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn text(s: &str) -> StreamEvent {
        StreamEvent::Text(s.to_string())
    }

    fn ok_stream(
        fragments: Vec<&'static str>,
    ) -> impl Stream<Item = Result<Bytes, CompletionError>> + Unpin {
        futures::stream::iter(
            fragments
                .into_iter()
                .map(|f| Ok(Bytes::from_static(f.as_bytes())))
                .collect::<Vec<_>>(),
        )
    }

    #[tokio::test]
    async fn test_fragments_relayed_in_arrival_order() {
        let (tx, mut rx) = mpsc::channel(16);

        let upstream = ok_stream(vec!["0:\"Hel\"\n", "0:\"lo, \"\n", "0:\"world\"\n"]);
        let outcome = relay_stream(upstream, tx, Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(outcome.answer, "Hello, world");
        assert_eq!(rx.recv().await.unwrap(), text("Hel"));
        assert_eq!(rx.recv().await.unwrap(), text("lo, "));
        assert_eq!(rx.recv().await.unwrap(), text("world"));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_last_usage_record_wins() {
        let (tx, _rx) = mpsc::channel(16);

        let upstream = ok_stream(vec![
            "0:\"answer\"\n",
            "e:{\"finishReason\":\"stop\",\"usage\":{\"promptTokens\":10,\"completionTokens\":5}}\n",
            "d:{\"finishReason\":\"stop\",\"usage\":{\"promptTokens\":12,\"completionTokens\":7}}\n",
        ]);
        let outcome = relay_stream(upstream, tx, Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(
            outcome.usage,
            Some(TokenUsage {
                prompt: 12,
                completion: 7
            })
        );
    }

    #[tokio::test]
    async fn test_record_split_across_fragments() {
        let (tx, mut rx) = mpsc::channel(16);

        let upstream = ok_stream(vec!["0:\"Hel", "lo\"\n0:\" there\"\n"]);
        let outcome = relay_stream(upstream, tx, Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(outcome.answer, "Hello there");
        assert_eq!(rx.recv().await.unwrap(), text("Hello"));
        assert_eq!(rx.recv().await.unwrap(), text(" there"));
    }

    #[tokio::test]
    async fn test_client_disconnect_stops_relay() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);

        let upstream = ok_stream(vec!["0:\"a\"\n", "0:\"b\"\n"]);
        let result = relay_stream(upstream, tx, Duration::from_secs(1)).await;

        assert!(matches!(result, Err(ChatError::ClientDisconnected)));
    }

    #[tokio::test]
    async fn test_upstream_error_skips_outcome() {
        let (tx, mut rx) = mpsc::channel(16);

        let items: Vec<Result<Bytes, CompletionError>> = vec![
            Ok(Bytes::from_static(b"0:\"Hel\"\n")),
            Ok(Bytes::from_static(b"0:\"lo\"\n")),
            Err(CompletionError::StreamError("reset".to_string())),
        ];
        let result =
            relay_stream(futures::stream::iter(items), tx, Duration::from_secs(1)).await;

        assert!(matches!(result, Err(ChatError::Upstream(_))));
        // Fragments sent before the error stay delivered
        assert_eq!(rx.recv().await.unwrap(), text("Hel"));
        assert_eq!(rx.recv().await.unwrap(), text("lo"));
    }

    #[tokio::test]
    async fn test_stalled_upstream_hits_deadline() {
        let (tx, _rx) = mpsc::channel(16);

        let upstream = futures::stream::pending::<Result<Bytes, CompletionError>>();
        let result = relay_stream(
            Box::pin(upstream),
            tx,
            Duration::from_millis(20),
        )
        .await;

        assert!(matches!(result, Err(ChatError::DeadlineExceeded)));
    }

    struct CountingBillingApi {
        usage_events: AtomicU64,
    }

    #[async_trait]
    impl BillingApi for CountingBillingApi {
        async fn create_customer(&self, _account_id: &str) -> Result<String, BillingError> {
            Ok("cus_test".to_string())
        }

        async fn list_subscriptions(
            &self,
            _customer_id: &str,
        ) -> Result<Vec<Subscription>, BillingError> {
            Ok(Vec::new())
        }

        async fn create_checkout_session(
            &self,
            _customer_id: &str,
        ) -> Result<CheckoutSession, BillingError> {
            Ok(CheckoutSession {
                id: "cs_test".to_string(),
                url: "https://checkout.test/cs_test".to_string(),
            })
        }

        async fn record_usage(
            &self,
            _subscription_item: &str,
            _quantity: u64,
        ) -> Result<(), BillingError> {
            self.usage_events.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Finalizer {
        record_store: Arc<MemoryRecordStore>,
        usage: Arc<MemoryUsageMeter>,
        api: Arc<CountingBillingApi>,
        gate: BillingGate,
    }

    fn finalizer() -> Finalizer {
        let record_store = Arc::new(MemoryRecordStore::new());
        let usage = Arc::new(MemoryUsageMeter::new());
        let api = Arc::new(CountingBillingApi {
            usage_events: AtomicU64::new(0),
        });
        let gate = BillingGate::new(
            Arc::clone(&api) as Arc<dyn BillingApi>,
            Arc::clone(&record_store) as Arc<dyn RecordStore>,
            Arc::clone(&usage) as Arc<dyn UsageMeter>,
            &BillingConfig::default(),
        );
        Finalizer {
            record_store,
            usage,
            api,
            gate,
        }
    }

    async fn finalize(
        f: &Finalizer,
        metered_item: Option<&str>,
        outcome: &StreamOutcome,
    ) -> Result<(), ChatError> {
        // Mirrors ChatGateway::finalize without requiring an HTTP client
        let Some(usage) = outcome.usage else {
            return Ok(());
        };
        f.record_store
            .append_chat_turn(&ChatTurn::agent("t-1", &outcome.answer))
            .await?;
        f.usage
            .increment("acct-1", &current_period_key(), usage.total())
            .await?;
        f.gate.record_metered_usage(metered_item, usage.total()).await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_gateway_wires_up_from_config() {
        use crate::models::Config;
        use crate::services::{EmbeddingClient, MemoryBackend};

        let config = Config::default();
        let f = finalizer();

        let gateway = ChatGateway::new(
            Arc::new(CompletionClient::new(&config.completion).unwrap()),
            Arc::new(EmbeddingClient::new(&config.embedding).unwrap()),
            Arc::new(MemoryBackend::new(&config.vector_store.collection)),
            Arc::clone(&f.record_store) as Arc<dyn RecordStore>,
            Arc::clone(&f.usage) as Arc<dyn UsageMeter>,
            Arc::new(f.gate),
            u64::from(config.server.retrieval_top_k),
            Duration::from_secs(config.server.stream_read_timeout_secs),
        );

        // Pre-flight validation rejects before any side effect
        let request = ChatRequest {
            message: "  ".to_string(),
            document_id: "doc-1".to_string(),
            thread_id: "t-1".to_string(),
        };
        let result = gateway.gate_check("acct-1", &request).await;
        assert!(matches!(result, Err(ChatError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn test_double_usage_record_commits_once() {
        let f = finalizer();
        let (tx, _rx) = mpsc::channel(16);

        // Stream emits two usage-bearing records; the later one is committed
        let upstream = ok_stream(vec![
            "0:\"hi\"\n",
            "e:{\"usage\":{\"promptTokens\":100,\"completionTokens\":1}}\n",
            "d:{\"usage\":{\"promptTokens\":3,\"completionTokens\":4}}\n",
        ]);
        let outcome = relay_stream(upstream, tx, Duration::from_secs(1))
            .await
            .unwrap();

        finalize(&f, Some("si_1"), &outcome).await.unwrap();

        assert_eq!(
            f.usage.get("acct-1", &current_period_key()).await.unwrap(),
            7
        );
        assert_eq!(f.api.usage_events.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancellation_charges_nothing() {
        let f = finalizer();
        // Capacity 1 so the relay cannot run ahead of the client
        let (tx, mut rx) = mpsc::channel(1);

        let upstream = ok_stream(vec![
            "0:\"one\"\n",
            "0:\"two\"\n",
            "0:\"three\"\n",
            "0:\"four\"\n",
            "0:\"five\"\n",
        ]);

        // Client reads two fragments, then goes away
        let relay = tokio::spawn(relay_stream(upstream, tx, Duration::from_secs(1)));
        assert_eq!(rx.recv().await.unwrap(), text("one"));
        assert_eq!(rx.recv().await.unwrap(), text("two"));
        drop(rx);

        let result = relay.await.unwrap();
        assert!(matches!(result, Err(ChatError::ClientDisconnected)));

        // Finalization never ran: no agent turn, no usage, no metered event
        assert!(f.record_store.turns_for_thread("t-1").await.is_empty());
        assert_eq!(
            f.usage.get("acct-1", &current_period_key()).await.unwrap(),
            0
        );
        assert_eq!(f.api.usage_events.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_no_usage_record_persists_nothing() {
        let f = finalizer();
        let (tx, _rx) = mpsc::channel(16);

        let upstream = ok_stream(vec!["0:\"just text\"\n"]);
        let outcome = relay_stream(upstream, tx, Duration::from_secs(1))
            .await
            .unwrap();

        finalize(&f, None, &outcome).await.unwrap();

        // A stream that never produced a usage record is not finalized:
        // no agent turn, no usage, no metered event
        assert!(f.record_store.turns_for_thread("t-1").await.is_empty());
        assert_eq!(
            f.usage.get("acct-1", &current_period_key()).await.unwrap(),
            0
        );
        assert_eq!(f.api.usage_events.load(Ordering::SeqCst), 0);
    }
}
