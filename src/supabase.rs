use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::config::SupabaseConfig;
use crate::download::ObjectSink;
use crate::records::UpsertRecord;

/// Destination table for assembled records.
#[async_trait]
pub trait RecordSink: Send + Sync {
    async fn upsert(&self, table: &str, rows: &[UpsertRecord]) -> Result<()>;
}

/// One entry of a storage bucket listing.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageObject {
    pub name: String,
}

/// PostgREST and storage client for a hosted Supabase project.
pub struct SupabaseClient {
    client: Client,
    base: String,
}

impl SupabaseClient {
    pub fn new(config: &SupabaseConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            "apikey",
            HeaderValue::from_str(config.key.trim()).context("invalid Supabase key")?,
        );
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", config.key.trim()))
                .context("invalid Supabase key")?,
        );
        let client = Client::builder()
            .timeout(Duration::from_secs(300))
            .default_headers(headers)
            .build()
            .context("failed to build Supabase HTTP client")?;
        Ok(Self {
            client,
            base: config.url.clone(),
        })
    }

    fn rest(&self, path: &str) -> String {
        format!("{}/rest/v1/{}", self.base, path)
    }

    fn storage(&self, path: &str) -> String {
        format!("{}/storage/v1/{}", self.base, path)
    }

    async fn post_upsert<T: Serialize + Sync>(
        &self,
        table: &str,
        rows: &[T],
        on_conflict: Option<&str>,
    ) -> Result<()> {
        info!("Upserting {} rows to {}", rows.len(), table);
        let mut request = self
            .client
            .post(self.rest(table))
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(rows);
        if let Some(columns) = on_conflict {
            request = request.query(&[("on_conflict", columns)]);
        }
        let resp = request
            .send()
            .await
            .with_context(|| format!("Failed to upsert embeddings to {}", table))?;
        ensure_success(resp)
            .await
            .with_context(|| format!("Failed to upsert embeddings to {}", table))?;
        Ok(())
    }

    /// Upsert rows that are already in the table's shape.
    pub async fn upsert_json(&self, table: &str, rows: &[Value]) -> Result<()> {
        self.post_upsert(table, rows, None).await
    }

    /// Server-side similarity search through the `match_documents` function.
    pub async fn match_embeddings(
        &self,
        table: &str,
        query_embedding: &[f32],
        match_count: usize,
    ) -> Result<Vec<Value>> {
        let resp = self
            .client
            .post(self.rest("rpc/match_documents"))
            .json(&serde_json::json!({
                "query_embedding": query_embedding,
                "match_count": match_count,
                "table_name": table,
            }))
            .send()
            .await
            .with_context(|| format!("Failed to match embeddings in {}", table))?;
        let resp = ensure_success(resp)
            .await
            .with_context(|| format!("Failed to match embeddings in {}", table))?;
        resp.json().await.context("malformed match_documents response")
    }

    /// Upload (or replace) an object and return its path inside the bucket.
    pub async fn upload_object(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String> {
        info!("Uploading {} ({:.2} MB) to {}", path, bytes.len() as f64 / (1024.0 * 1024.0), bucket);
        let resp = self
            .client
            .post(self.storage(&format!("object/{}/{}", bucket, path)))
            .header("content-type", content_type)
            .header("x-upsert", "true")
            .body(bytes)
            .send()
            .await
            .with_context(|| format!("Failed to upload {} to bucket {}", path, bucket))?;
        ensure_success(resp)
            .await
            .with_context(|| format!("Failed to upload {} to bucket {}", path, bucket))?;
        Ok(path.to_string())
    }

    pub async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        limit: usize,
    ) -> Result<Vec<StorageObject>> {
        let resp = self
            .client
            .post(self.storage(&format!("object/list/{}", bucket)))
            .json(&serde_json::json!({ "prefix": prefix, "limit": limit, "offset": 0 }))
            .send()
            .await
            .with_context(|| format!("Failed to list bucket {}", bucket))?;
        let resp = ensure_success(resp)
            .await
            .with_context(|| format!("Failed to list bucket {}", bucket))?;
        resp.json().await.context("malformed storage listing")
    }
}

#[async_trait]
impl RecordSink for SupabaseClient {
    async fn upsert(&self, table: &str, rows: &[UpsertRecord]) -> Result<()> {
        self.post_upsert(table, rows, conflict_key(rows)).await
    }
}

#[async_trait]
impl ObjectSink for SupabaseClient {
    async fn put_object(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String> {
        self.upload_object(bucket, path, bytes, content_type).await
    }
}

/// Rows carrying an external id merge on the primary key; anything else
/// merges on its URL.
fn conflict_key(rows: &[UpsertRecord]) -> Option<&'static str> {
    if rows.iter().all(|r| r.id.is_some()) {
        None
    } else {
        Some("url")
    }
}

async fn ensure_success(resp: Response) -> Result<Response> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status();
    let text = resp
        .text()
        .await
        .unwrap_or_else(|_| "<body unavailable>".to_string());
    bail!("{}: {}", status, text)
}
