//! Embedding client for semantic discovery.

use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;

use crate::error::{LlmError, Result};
use crate::types::{BatchEmbedRequest, BatchEmbedResponse, EmbedContent, EmbedRequest, Part};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const DEFAULT_EMBED_MODEL: &str = "gemini-embedding-001";

/// Batch text embedding. The corpus is embedded once per process
/// lifetime at startup; queries are embedded one at a time afterwards.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    async fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed_batch(&[text.to_string()]).await?;
        vectors.pop().ok_or(LlmError::EmptyResponse)
    }
}

/// Gemini batchEmbedContents implementation.
pub struct GeminiEmbedder {
    api_key: String,
    model: String,
    base_url: String,
    client: Client,
}

impl GeminiEmbedder {
    pub fn new(api_key: String) -> Result<Self> {
        Self::with_model(api_key, DEFAULT_EMBED_MODEL.to_string(), None)
    }

    pub fn with_model(api_key: String, model: String, base_url: Option<String>) -> Result<Self> {
        if api_key.is_empty() {
            return Err(LlmError::MissingApiKey);
        }
        let client = Client::builder().timeout(Duration::from_secs(60)).build()?;
        Ok(Self {
            api_key,
            model,
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            client,
        })
    }
}

#[async_trait]
impl Embedder for GeminiEmbedder {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let model_path = format!("models/{}", self.model);
        let request = BatchEmbedRequest {
            requests: texts
                .iter()
                .map(|t| EmbedRequest {
                    model: model_path.clone(),
                    content: EmbedContent {
                        parts: vec![Part::text(t)],
                    },
                })
                .collect(),
        };

        let url = format!("{}/{}:batchEmbedContents", self.base_url, model_path);
        let resp = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(LlmError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let parsed = resp.json::<BatchEmbedResponse>().await?;
        if parsed.embeddings.len() != texts.len() {
            return Err(LlmError::SchemaParse {
                message: format!(
                    "expected {} embeddings, got {}",
                    texts.len(),
                    parsed.embeddings.len()
                ),
                raw: String::new(),
            });
        }

        Ok(parsed.embeddings.into_iter().map(|e| e.values).collect())
    }
}
