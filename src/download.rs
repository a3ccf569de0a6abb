use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Url};
use tokio::io::AsyncWriteExt;
use tracing::info;
use uuid::Uuid;

use crate::error::DownloadError;

const ALLOWED_EXTENSIONS: &[&str] = &["csv", "xlsx"];

/// Bucket storage that accepts uploaded dataset files.
#[async_trait]
pub trait ObjectSink: Send + Sync {
    /// Store `bytes` at `path` in `bucket`, replacing any existing object.
    async fn put_object(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String>;
}

/// Lowercased extension of a dataset link, checked against the allowed set.
/// Falls back to a `filename` query parameter for API-style links.
pub fn dataset_extension(url: &str) -> Result<String, DownloadError> {
    let parsed = Url::parse(url).ok();
    let candidates = [
        parsed.as_ref().map(|u| u.path().to_string()),
        parsed.as_ref().and_then(|u| {
            u.query_pairs()
                .find(|(k, _)| k == "filename")
                .map(|(_, v)| v.into_owned())
        }),
        Some(url.to_string()),
    ];
    let mut last = String::new();
    for name in candidates.into_iter().flatten() {
        let Some((_, ext)) = name.rsplit_once('.') else {
            continue;
        };
        let ext = ext.to_lowercase();
        if ALLOWED_EXTENSIONS.contains(&ext.as_str()) {
            return Ok(ext);
        }
        if last.is_empty() {
            last = ext;
        }
    }
    Err(DownloadError::UnsupportedExtension(last))
}

/// `<normalized title>_<uuid>.<ext>`
pub fn storage_file_name(title: &str, extension: &str) -> String {
    let normalized = title
        .to_lowercase()
        .replace(' ', "_")
        .replace('/', "_")
        .replace('.', "_");
    format!("{}_{}.{}", normalized, Uuid::new_v4(), extension)
}

/// Download a `.csv`/`.xlsx` file into memory.
pub async fn download_file(client: &Client, url: &str) -> Result<(Vec<u8>, String)> {
    let extension = dataset_extension(url)?;
    let resp = client
        .get(url)
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .with_context(|| format!("Failed to download {}", url))?;
    let bytes = resp.bytes().await.with_context(|| format!("Failed to read {}", url))?;
    info!("Downloaded {} ({} bytes)", url, bytes.len());
    Ok((bytes.to_vec(), extension))
}

pub fn content_type(extension: &str) -> &'static str {
    match extension {
        "csv" => "text/csv",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        _ => "application/octet-stream",
    }
}

/// Download a dataset file and store it as
/// `<folder>/<normalized title>_<uuid>.<ext>` in `bucket`.
pub async fn upload_to_bucket(
    client: &Client,
    sink: &dyn ObjectSink,
    bucket: &str,
    folder: &str,
    url: &str,
    title: &str,
) -> Result<String> {
    let (bytes, extension) = download_file(client, url).await?;
    let path = match folder.trim_matches('/') {
        "" => storage_file_name(title, &extension),
        folder => format!("{}/{}", folder, storage_file_name(title, &extension)),
    };
    sink.put_object(bucket, &path, bytes, content_type(&extension))
        .await
        .with_context(|| format!("failed to store {} in {}", url, bucket))
}

/// Stream a `.csv`/`.xlsx` file into `folder` under a unique normalized name.
pub async fn download_to_local(
    client: &Client,
    url: &str,
    folder: &Path,
    title: &str,
) -> Result<PathBuf> {
    let extension = dataset_extension(url)?;
    let mut resp = client
        .get(url)
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .with_context(|| format!("Failed to download {}", url))?;

    tokio::fs::create_dir_all(folder)
        .await
        .with_context(|| format!("failed to create {}", folder.display()))?;
    let path = folder.join(storage_file_name(title, &extension));
    let mut file = tokio::fs::File::create(&path)
        .await
        .with_context(|| format!("failed to create {}", path.display()))?;
    while let Some(chunk) = resp.chunk().await.context("download interrupted")? {
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    info!("Saved {} to {}", url, path.display());
    Ok(path)
}
