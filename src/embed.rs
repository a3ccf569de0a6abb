use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::OpenAiConfig;

const MAX_RETRIES: usize = 3;

/// Text-to-vector endpoint.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// Embeddings client for OpenAI-compatible endpoints.
pub struct OpenAiEmbedder {
    client: Client,
    endpoint: String,
    model: String,
    dimensions: Option<usize>,
}

impl OpenAiEmbedder {
    pub fn new(config: &OpenAiConfig) -> Result<Self> {
        anyhow::ensure!(
            !config.embedding_model.trim().is_empty(),
            "missing OpenAI embedding model name"
        );
        let mut headers = HeaderMap::new();
        let auth = format!("Bearer {}", config.api_key.trim());
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&auth).context("invalid OpenAI API key")?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .default_headers(headers)
            .build()
            .context("failed to build OpenAI HTTP client")?;
        Ok(Self {
            client,
            endpoint: format!("{}/embeddings", config.base_url),
            model: config.embedding_model.clone(),
            dimensions: config.dimensions,
        })
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let request = EmbeddingRequest {
            model: &self.model,
            input: text,
            dimensions: self.dimensions,
        };

        let mut attempt = 0usize;
        loop {
            let resp = self.client.post(&self.endpoint).json(&request).send().await;
            match resp {
                Ok(resp) if resp.status().is_success() => {
                    let parsed: EmbeddingResponse = resp
                        .json()
                        .await
                        .context("failed to parse OpenAI embedding response")?;
                    return first_embedding(parsed, self.dimensions);
                }
                Ok(resp) => {
                    let status = resp.status();
                    let body = resp
                        .text()
                        .await
                        .unwrap_or_else(|_| "<body unavailable>".to_string());
                    if should_retry(status) && attempt + 1 < MAX_RETRIES {
                        attempt += 1;
                        warn!("Embedding request returned {}, retrying", status);
                        tokio::time::sleep(retry_backoff(attempt)).await;
                        continue;
                    }
                    anyhow::bail!("OpenAI embeddings request failed ({}): {}", status, body);
                }
                Err(err) => {
                    if (err.is_timeout() || err.is_connect()) && attempt + 1 < MAX_RETRIES {
                        attempt += 1;
                        tokio::time::sleep(retry_backoff(attempt)).await;
                        continue;
                    }
                    return Err(err).context("failed to call OpenAI embeddings");
                }
            }
        }
    }
}

fn should_retry(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn retry_backoff(attempt: usize) -> Duration {
    let capped = attempt.min(5) as u32;
    Duration::from_millis(500 * (1 << capped))
}

fn first_embedding(parsed: EmbeddingResponse, expected: Option<usize>) -> Result<Vec<f32>> {
    let embedding = parsed
        .data
        .into_iter()
        .min_by_key(|entry| entry.index)
        .map(|entry| entry.embedding)
        .context("OpenAI returned no embeddings")?;
    if let Some(dims) = expected {
        anyhow::ensure!(
            embedding.len() == dims,
            "embedding has {} dimensions, expected {}",
            embedding.len(),
            dims
        );
    }
    Ok(embedding)
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}
