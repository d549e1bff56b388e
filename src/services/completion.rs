//! Completion model client: one-shot generation for summaries and keyword
//! extraction, plus the raw chat stream the gateway relays.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::CompletionError;
use crate::models::CompletionConfig;

/// Document summarization capability as seen by the pipeline.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn extract_summary(
        &self,
        file_name: &str,
        context: &str,
    ) -> Result<SummaryExtraction, CompletionError>;
}

/// One message in a chat exchange sent upstream.
#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StreamRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    thread_id: &'a str,
    resource_id: &'a str,
}

/// Summary and keywords extracted by the model, parsed leniently:
/// a non-JSON reply degrades to "whole text is the summary".
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SummaryExtraction {
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub keywords: Vec<String>,
}

impl SummaryExtraction {
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        // Models often wrap JSON in a fenced code block
        let stripped = trimmed
            .strip_prefix("```json")
            .or_else(|| trimmed.strip_prefix("```"))
            .map(|s| s.trim_end_matches("```").trim())
            .unwrap_or(trimmed);

        serde_json::from_str(stripped).unwrap_or_else(|_| Self {
            summary: trimmed.to_string(),
            keywords: Vec::new(),
        })
    }
}

/// Client for the completion/chat model server.
#[derive(Debug, Clone)]
pub struct CompletionClient {
    client: Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
}

impl CompletionClient {
    pub fn new(config: &CompletionConfig) -> Result<Self, CompletionError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| CompletionError::ConnectionError(e.to_string()))?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key: config.api_key.clone(),
        })
    }

    /// One-shot text generation.
    pub async fn generate(&self, prompt: &str) -> Result<String, CompletionError> {
        let url = format!("{}/generate", self.base_url);
        let request = GenerateRequest {
            model: &self.model,
            prompt,
        };

        let mut builder = self.client.post(&url).json(&request);
        if let Some(ref key) = self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                CompletionError::Timeout
            } else {
                CompletionError::RequestError(e)
            }
        })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(CompletionError::ServerError(format!(
                "status {}: {}",
                status, body
            )));
        }

        let generated: GenerateResponse = response
            .json()
            .await
            .map_err(|e| CompletionError::InvalidResponse(e.to_string()))?;

        Ok(generated.text)
    }

    /// Ask the model for a summary and keyword list over the given context.
    pub async fn extract_summary(
        &self,
        file_name: &str,
        context: &str,
    ) -> Result<SummaryExtraction, CompletionError> {
        let prompt = format!(
            "Summarize the document {file_name} from the excerpts below, then list at \
             least 5 keywords. Reply as JSON: {{\"summary\": \"...\", \"keywords\": [\"...\"]}}.\n\n{context}"
        );
        let raw = self.generate(&prompt).await?;
        Ok(SummaryExtraction::parse(&raw))
    }

    /// Open a chat stream. The body is the model server's raw tagged-record
    /// stream; callers parse it with
    /// [`StreamParser`](crate::services::stream::StreamParser).
    pub async fn stream_chat(
        &self,
        messages: &[ChatMessage],
        thread_id: &str,
        resource_id: &str,
    ) -> Result<BoxStream<'static, Result<Bytes, CompletionError>>, CompletionError> {
        let url = format!("{}/chat/stream", self.base_url);
        let request = StreamRequest {
            model: &self.model,
            messages,
            thread_id,
            resource_id,
        };

        let mut builder = self.client.post(&url).json(&request);
        if let Some(ref key) = self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                CompletionError::Timeout
            } else {
                CompletionError::RequestError(e)
            }
        })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(CompletionError::ServerError(format!(
                "status {}: {}",
                status, body
            )));
        }

        let stream = response
            .bytes_stream()
            .map(|item| item.map_err(|e| CompletionError::StreamError(e.to_string())));

        Ok(stream.boxed())
    }
}

#[async_trait]
impl Summarizer for CompletionClient {
    async fn extract_summary(
        &self,
        file_name: &str,
        context: &str,
    ) -> Result<SummaryExtraction, CompletionError> {
        CompletionClient::extract_summary(self, file_name, context).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_creation() {
        let config = CompletionConfig::default();
        assert!(CompletionClient::new(&config).is_ok());
    }

    #[test]
    fn test_summary_extraction_json() {
        let parsed =
            SummaryExtraction::parse(r#"{"summary": "a paper", "keywords": ["a", "b"]}"#);
        assert_eq!(parsed.summary, "a paper");
        assert_eq!(parsed.keywords, vec!["a", "b"]);
    }

    #[test]
    fn test_summary_extraction_fenced() {
        let parsed = SummaryExtraction::parse(
            "```json\n{\"summary\": \"fenced\", \"keywords\": []}\n```",
        );
        assert_eq!(parsed.summary, "fenced");
    }

    #[test]
    fn test_summary_extraction_plain_text_fallback() {
        let parsed = SummaryExtraction::parse("just a plain sentence");
        assert_eq!(parsed.summary, "just a plain sentence");
        assert!(parsed.keywords.is_empty());
    }
}
