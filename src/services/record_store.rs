//! System-of-record client.
//!
//! The record store holds durable application state that is not vector
//! data: ingestion records, chat transcripts, thread ownership, and the
//! account-to-billing-customer mapping. The HTTP implementation talks to
//! a document backend exposing query/mutation endpoints; every call is
//! authenticated with a shared service token attached in one place.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::RecordStoreError;
use crate::models::{ChatTurn, IngestionRecord, RecordStoreConfig};
use crate::utils::retry::{with_retry, RetryConfig};

/// Durable state operations used by the pipeline, the gateway, and billing.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Upsert the per-document ingestion record, keyed by document id.
    async fn update_ingestion_record(
        &self,
        record: &IngestionRecord,
    ) -> Result<(), RecordStoreError>;

    /// Fetch the ingestion record for a document, if one exists.
    async fn ingestion_record(
        &self,
        document_id: &str,
    ) -> Result<Option<IngestionRecord>, RecordStoreError>;

    /// Append one turn to a chat thread transcript.
    async fn append_chat_turn(&self, turn: &ChatTurn) -> Result<(), RecordStoreError>;

    /// Account that owns the thread, or None for a new thread.
    async fn thread_owner(&self, thread_id: &str) -> Result<Option<String>, RecordStoreError>;

    /// Claim a thread for an account. No-op if already owned.
    async fn claim_thread(
        &self,
        thread_id: &str,
        account_id: &str,
    ) -> Result<(), RecordStoreError>;

    /// Billing customer id mapped to the account, if any.
    async fn billing_customer(
        &self,
        account_id: &str,
    ) -> Result<Option<String>, RecordStoreError>;

    /// Store the billing customer id for the account unless one is already
    /// stored. Returns the id that ends up persisted, which may differ from
    /// `customer_id` when another writer won the race.
    async fn set_billing_customer_if_absent(
        &self,
        account_id: &str,
        customer_id: &str,
    ) -> Result<String, RecordStoreError>;
}

/// HTTP record store speaking a Convex-style query/mutation protocol.
pub struct HttpRecordStore {
    client: reqwest::Client,
    base_url: String,
    service_token: String,
}

#[derive(serde::Deserialize)]
struct ApiResponse {
    status: String,
    #[serde(default)]
    value: Value,
    #[serde(default, rename = "errorMessage")]
    error_message: Option<String>,
}

impl HttpRecordStore {
    pub fn new(config: &RecordStoreConfig) -> Result<Self, RecordStoreError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            service_token: config.service_token.clone(),
        })
    }

    /// Single chokepoint for outbound calls. The service token is attached
    /// here and nowhere else, so no function can forget it.
    async fn call<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        path: &str,
        mut args: Value,
    ) -> Result<T, RecordStoreError> {
        if let Some(obj) = args.as_object_mut() {
            obj.insert("apiKey".to_string(), json!(self.service_token));
        }

        debug!(path = path, "record store call");

        let response = self
            .client
            .post(format!("{}/api/{}", self.base_url, endpoint))
            .json(&json!({
                "path": path,
                "args": args,
                "format": "json",
            }))
            .send()
            .await?;

        let status = response.status().as_u16();
        if status >= 400 {
            let body = response.text().await.unwrap_or_default();
            return Err(RecordStoreError::MutationError { status, body });
        }

        let api: ApiResponse = response
            .json()
            .await
            .map_err(|e| RecordStoreError::InvalidResponse(e.to_string()))?;

        if api.status != "success" {
            return Err(RecordStoreError::MutationError {
                status,
                body: api.error_message.unwrap_or_else(|| api.status.clone()),
            });
        }

        serde_json::from_value(api.value)
            .map_err(|e| RecordStoreError::InvalidResponse(e.to_string()))
    }

    /// Mutations run exactly once; a transient failure surfaces to the
    /// caller rather than risking a double-applied write.
    async fn mutation<T: DeserializeOwned>(
        &self,
        path: &str,
        args: Value,
    ) -> Result<T, RecordStoreError> {
        self.call("mutation", path, args).await
    }

    /// Queries are read-only, so transient failures get a short retry.
    async fn query<T: DeserializeOwned>(
        &self,
        path: &str,
        args: Value,
    ) -> Result<T, RecordStoreError> {
        let config = RetryConfig::new(2).with_initial_delay(Duration::from_millis(200));
        with_retry(&config, || self.call("query", path, args.clone()))
            .await
            .into_result()
    }
}

#[async_trait]
impl RecordStore for HttpRecordStore {
    async fn update_ingestion_record(
        &self,
        record: &IngestionRecord,
    ) -> Result<(), RecordStoreError> {
        let _: Value = self
            .mutation(
                "documents:updateIngestionRecord",
                serde_json::to_value(record)
                    .map_err(|e| RecordStoreError::InvalidResponse(e.to_string()))?,
            )
            .await?;
        Ok(())
    }

    async fn ingestion_record(
        &self,
        document_id: &str,
    ) -> Result<Option<IngestionRecord>, RecordStoreError> {
        self.query(
            "documents:getIngestionRecord",
            json!({ "documentId": document_id }),
        )
        .await
    }

    async fn append_chat_turn(&self, turn: &ChatTurn) -> Result<(), RecordStoreError> {
        let _: Value = self
            .mutation(
                "chat:appendTurn",
                serde_json::to_value(turn)
                    .map_err(|e| RecordStoreError::InvalidResponse(e.to_string()))?,
            )
            .await?;
        Ok(())
    }

    async fn thread_owner(&self, thread_id: &str) -> Result<Option<String>, RecordStoreError> {
        self.query("chat:threadOwner", json!({ "threadId": thread_id }))
            .await
    }

    async fn claim_thread(
        &self,
        thread_id: &str,
        account_id: &str,
    ) -> Result<(), RecordStoreError> {
        let _: Value = self
            .mutation(
                "chat:claimThread",
                json!({ "threadId": thread_id, "accountId": account_id }),
            )
            .await?;
        Ok(())
    }

    async fn billing_customer(
        &self,
        account_id: &str,
    ) -> Result<Option<String>, RecordStoreError> {
        self.query("billing:customerId", json!({ "accountId": account_id }))
            .await
    }

    async fn set_billing_customer_if_absent(
        &self,
        account_id: &str,
        customer_id: &str,
    ) -> Result<String, RecordStoreError> {
        self.mutation(
            "billing:setCustomerIdIfAbsent",
            json!({ "accountId": account_id, "customerId": customer_id }),
        )
        .await
    }
}

/// In-process record store for local runs and tests.
#[derive(Default)]
pub struct MemoryRecordStore {
    inner: Mutex<MemoryRecordStoreInner>,
}

#[derive(Default)]
struct MemoryRecordStoreInner {
    ingestion_records: HashMap<String, IngestionRecord>,
    turns: Vec<ChatTurn>,
    thread_owners: HashMap<String, String>,
    billing_customers: HashMap<String, String>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn turns_for_thread(&self, thread_id: &str) -> Vec<ChatTurn> {
        let inner = self.inner.lock().await;
        inner
            .turns
            .iter()
            .filter(|t| t.thread_id == thread_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn update_ingestion_record(
        &self,
        record: &IngestionRecord,
    ) -> Result<(), RecordStoreError> {
        let mut inner = self.inner.lock().await;
        inner
            .ingestion_records
            .insert(record.document_id.clone(), record.clone());
        Ok(())
    }

    async fn ingestion_record(
        &self,
        document_id: &str,
    ) -> Result<Option<IngestionRecord>, RecordStoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.ingestion_records.get(document_id).cloned())
    }

    async fn append_chat_turn(&self, turn: &ChatTurn) -> Result<(), RecordStoreError> {
        let mut inner = self.inner.lock().await;
        inner.turns.push(turn.clone());
        Ok(())
    }

    async fn thread_owner(&self, thread_id: &str) -> Result<Option<String>, RecordStoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.thread_owners.get(thread_id).cloned())
    }

    async fn claim_thread(
        &self,
        thread_id: &str,
        account_id: &str,
    ) -> Result<(), RecordStoreError> {
        let mut inner = self.inner.lock().await;
        inner
            .thread_owners
            .entry(thread_id.to_string())
            .or_insert_with(|| account_id.to_string());
        Ok(())
    }

    async fn billing_customer(
        &self,
        account_id: &str,
    ) -> Result<Option<String>, RecordStoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.billing_customers.get(account_id).cloned())
    }

    async fn set_billing_customer_if_absent(
        &self,
        account_id: &str,
        customer_id: &str,
    ) -> Result<String, RecordStoreError> {
        let mut inner = self.inner.lock().await;
        let stored = inner
            .billing_customers
            .entry(account_id.to_string())
            .or_insert_with(|| customer_id.to_string());
        Ok(stored.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChatAuthor;

    #[tokio::test]
    async fn test_ingestion_record_upsert_overwrites() {
        let store = MemoryRecordStore::new();

        let mut record = IngestionRecord {
            document_id: "doc-1".to_string(),
            summary: "first pass".to_string(),
            keywords: vec!["alpha".to_string()],
            embedding: vec![0.1, 0.2],
            last_updated_at: 1,
        };
        store.update_ingestion_record(&record).await.unwrap();

        record.summary = "second pass".to_string();
        record.last_updated_at = 2;
        store.update_ingestion_record(&record).await.unwrap();

        let stored = store.ingestion_record("doc-1").await.unwrap().unwrap();
        assert_eq!(stored.summary, "second pass");
        assert_eq!(stored.last_updated_at, 2);
    }

    #[tokio::test]
    async fn test_claim_thread_first_writer_wins() {
        let store = MemoryRecordStore::new();
        store.claim_thread("t-1", "acct-a").await.unwrap();
        store.claim_thread("t-1", "acct-b").await.unwrap();
        assert_eq!(
            store.thread_owner("t-1").await.unwrap(),
            Some("acct-a".to_string())
        );
    }

    #[tokio::test]
    async fn test_set_billing_customer_existing_wins() {
        let store = MemoryRecordStore::new();
        let first = store
            .set_billing_customer_if_absent("acct-1", "cus_aaa")
            .await
            .unwrap();
        let second = store
            .set_billing_customer_if_absent("acct-1", "cus_bbb")
            .await
            .unwrap();
        assert_eq!(first, "cus_aaa");
        assert_eq!(second, "cus_aaa");
        assert_eq!(
            store.billing_customer("acct-1").await.unwrap(),
            Some("cus_aaa".to_string())
        );
    }

    #[tokio::test]
    async fn test_turns_recorded_in_order() {
        let store = MemoryRecordStore::new();
        store
            .append_chat_turn(&ChatTurn::agent("t-1", "hello"))
            .await
            .unwrap();
        store
            .append_chat_turn(&ChatTurn::agent("t-1", "world"))
            .await
            .unwrap();

        let turns = store.turns_for_thread("t-1").await;
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].text, "hello");
        assert_eq!(turns[1].text, "world");
        assert_eq!(turns[0].author, ChatAuthor::Agent);
    }
}
