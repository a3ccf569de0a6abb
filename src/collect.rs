use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::Value;
use tracing::{info, warn};

use crate::browser::{download_links, PageSource};
use crate::config::FailurePolicy;
use crate::embed::Embedder;
use crate::llm::{analyze_page, LanguageModel};
use crate::records::{FailedPage, TargetPage, UpsertRecord};
use crate::supabase::{RecordSink, SupabaseClient};

/// Wires the external collaborators of the collection pipeline together.
/// Every step is one blocking call; pages are handled strictly in order.
/// Only live pages need a browser; checkpointed records already carry text.
pub struct Collector<'a> {
    pub browser: Option<&'a dyn PageSource>,
    pub model: &'a dyn LanguageModel,
    pub embedder: &'a dyn Embedder,
    pub sink: &'a dyn RecordSink,
    pub table: String,
}

/// What the batch driver uploaded and what it gave up on.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub uploaded: Vec<UpsertRecord>,
    pub errors: Vec<FailedPage>,
}

impl<'a> Collector<'a> {
    /// Capture a live page, let the model pick its primary data file,
    /// embed and upsert the result.
    pub async fn process_page(&self, url: &str, with_screenshot: bool) -> Result<UpsertRecord> {
        info!("Processing URL: {}", url);
        let browser = self
            .browser
            .context("processing a live page needs a browser session")?;
        let capture = browser
            .capture(url)
            .await
            .with_context(|| format!("failed to capture {}", url))?;
        info!("Retrieved page text: {} characters", capture.text.len());

        let links = download_links(&capture.links);
        info!("Found download links: {} links", links.len());

        let screenshot = if with_screenshot {
            Some(
                browser
                    .screenshot(url)
                    .await
                    .with_context(|| format!("failed to screenshot {}", url))?,
            )
        } else {
            None
        };

        let analysis = analyze_page(self.model, &capture.text, &links, screenshot.as_deref())
            .await
            .with_context(|| format!("failed to analyze {}", url))?;
        info!("Primary data link: {}", analysis.primary_data_link);

        let title_vector = self.embedder.embed(&analysis.title).await?;
        let description_vector = self.embedder.embed(&analysis.description).await?;

        let record = UpsertRecord {
            id: None,
            url: url.to_string(),
            title: analysis.title,
            llm_enhanced_title: None,
            description: analysis.description,
            csv_url: Some(analysis.primary_data_link),
            title_vector,
            description_vector,
        };
        self.sink.upsert(&self.table, std::slice::from_ref(&record)).await?;
        Ok(record)
    }

    /// Build and upsert a record from a page scraped earlier: the catalog
    /// title is kept, the model supplies a description and a second title.
    pub async fn process_preprocessed(&self, page: &TargetPage) -> Result<UpsertRecord> {
        let text = page
            .text
            .as_deref()
            .with_context(|| format!("{} has no scraped text", page.url))?;
        let title = page
            .title
            .as_deref()
            .with_context(|| format!("{} has no title", page.url))?;
        info!("Processing {} ({} characters)", page.url, text.len());

        let summary = self.model.summarize(text).await?;
        info!("Received analysis with title: {}", summary.title);

        let title_vector = self.embedder.embed(title).await?;
        let description_vector = self.embedder.embed(&summary.description).await?;

        let record = UpsertRecord {
            id: page.id.clone(),
            url: page.url.clone(),
            title: title.to_string(),
            llm_enhanced_title: Some(summary.title),
            description: summary.description,
            csv_url: page.download_url.clone(),
            title_vector,
            description_vector,
        };
        self.sink.upsert(&self.table, std::slice::from_ref(&record)).await?;
        Ok(record)
    }

    /// Run [`Self::process_preprocessed`] over `pages`. Under `Abort` the first
    /// failure ends the batch; under `Skip` failures are collected.
    pub async fn upsert_batch(
        &self,
        pages: &[TargetPage],
        policy: FailurePolicy,
    ) -> Result<BatchReport> {
        let pb = ProgressBar::new(pages.len() as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] {bar:40} {pos}/{len} ({per_sec}, eta {eta})")?
                .progress_chars("=> "),
        );

        let mut report = BatchReport::default();
        for page in pages {
            match self.process_preprocessed(page).await {
                Ok(record) => report.uploaded.push(record),
                Err(err) if policy == FailurePolicy::Skip => {
                    warn!("Error processing {}: {:#}", page.label(), err);
                    report.errors.push(FailedPage {
                        url: page.url.clone(),
                        error: format!("{:#}", err),
                    });
                }
                Err(err) => {
                    pb.finish_and_clear();
                    return Err(err.context(format!("failed to process {}", page.url)));
                }
            }
            pb.inc(1);
        }
        pb.finish_and_clear();
        Ok(report)
    }
}

/// Write `errors.json` and `uploaded_data.json` into `dir`.
pub fn write_report(dir: &Path, report: &BatchReport) -> Result<(PathBuf, PathBuf)> {
    fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
    let errors = dir.join("errors.json");
    let uploaded = dir.join("uploaded_data.json");
    fs::write(&errors, serde_json::to_vec_pretty(&report.errors)?)
        .with_context(|| format!("failed to write {}", errors.display()))?;
    fs::write(&uploaded, serde_json::to_vec_pretty(&report.uploaded)?)
        .with_context(|| format!("failed to write {}", uploaded.display()))?;
    Ok((errors, uploaded))
}

/// Read a JSON array of target pages.
pub fn load_pages(path: &Path) -> Result<Vec<TargetPage>> {
    let raw = fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("{} is not a JSON array of pages", path.display()))
}

/// Read a JSON array of rows already shaped for the destination table.
pub fn load_rows(path: &Path) -> Result<Vec<Value>> {
    let raw = fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    let rows: Vec<Value> = serde_json::from_str(&raw)
        .with_context(|| format!("{} is not a JSON array", path.display()))?;
    anyhow::ensure!(
        rows.iter().all(Value::is_object),
        "{} must contain only JSON objects",
        path.display()
    );
    Ok(rows)
}

/// Embed `query` and return the closest rows of `table`.
pub async fn search(
    embedder: &dyn Embedder,
    client: &SupabaseClient,
    table: &str,
    query: &str,
    count: usize,
) -> Result<Vec<Value>> {
    let vector = embedder.embed(query).await?;
    client.match_embeddings(table, &vector, count).await
}
