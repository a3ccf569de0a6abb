use std::collections::HashSet;
use std::sync::OnceLock;

use anyhow::anyhow;
use async_trait::async_trait;
use regex::Regex;
use reqwest::Url;
use spider_client::shapes::request::{ReturnFormat, ReturnFormatHandling};
use spider_client::{RequestParams, Spider};
use tracing::debug;

use crate::config::SpiderConfig;
use crate::error::FetchError;

/// Text and links of one rendered page.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageCapture {
    pub text: String,
    pub links: Vec<String>,
}

/// A remote browser session.
#[async_trait]
pub trait PageSource: Send + Sync {
    /// Navigate to `url` and return the visible text.
    async fn page_text(&self, url: &str) -> Result<String, FetchError> {
        Ok(self.capture(url).await?.text)
    }

    /// Navigate to `url` and return its text and every link on the page.
    async fn capture(&self, url: &str) -> Result<PageCapture, FetchError>;

    /// Full-page screenshot, base64 encoded.
    async fn screenshot(&self, url: &str) -> Result<String, FetchError>;
}

/// Remote browser backed by the spider.cloud rendering API.
pub struct SpiderBrowser {
    spider: Spider,
    http: reqwest::Client,
    config: SpiderConfig,
}

impl SpiderBrowser {
    pub fn new(config: SpiderConfig) -> anyhow::Result<Self> {
        let spider = Spider::new(Some(config.api_key.clone()))
            .map_err(|e| anyhow!("Failed to create Spider client: {}", e))?;
        Ok(Self {
            spider,
            http: reqwest::Client::new(),
            config,
        })
    }

    async fn fetch_markdown(&self, url: &str) -> Result<String, FetchError> {
        let params = RequestParams {
            return_format: Some(ReturnFormatHandling::Single(ReturnFormat::Markdown)),
            ..Default::default()
        };
        let response = self
            .spider
            .scrape_url(url, Some(params), "application/json")
            .await
            .map_err(|e| FetchError::from_message(e.to_string()))?;
        first_content(response)
    }
}

#[async_trait]
impl PageSource for SpiderBrowser {
    async fn capture(&self, url: &str) -> Result<PageCapture, FetchError> {
        let markdown = self.fetch_markdown(url).await?;
        let text = strip_images(&markdown);
        let links = markdown_links(&text, url);
        debug!("Captured {} ({} chars, {} links)", url, text.len(), links.len());
        Ok(PageCapture { text, links })
    }

    async fn screenshot(&self, url: &str) -> Result<String, FetchError> {
        let response = self
            .http
            .post(format!("{}/screenshot", self.config.api_url))
            .bearer_auth(&self.config.api_key)
            .json(&serde_json::json!({ "url": url, "limit": 1, "full_page": true }))
            .send()
            .await?
            .error_for_status()?;
        let body: serde_json::Value = response.json().await?;
        first_content(body)
    }
}

/// Pull the first page's `content` out of a spider response, surfacing
/// per-page failures as errors.
fn first_content(response: serde_json::Value) -> Result<String, FetchError> {
    let parsed: serde_json::Value = match response.as_str() {
        Some(s) => serde_json::from_str(s).unwrap_or(response.clone()),
        None => response,
    };
    let first = parsed
        .as_array()
        .and_then(|arr| arr.first())
        .ok_or_else(|| FetchError::Failed("empty response from browser backend".into()))?;

    let status = first.get("status").and_then(|s| s.as_i64());
    let error = first.get("error").and_then(|e| e.as_str()).filter(|e| !e.is_empty());
    match (status, error) {
        (Some(429), detail) => {
            return Err(FetchError::RateLimited(
                detail.unwrap_or("429 Too Many Requests").to_string(),
            ))
        }
        (Some(code), detail) if code >= 400 => {
            return Err(FetchError::from_message(format!(
                "status {}: {}",
                code,
                detail.unwrap_or("page load failed")
            )))
        }
        (_, Some(detail)) => return Err(FetchError::from_message(detail)),
        _ => {}
    }

    first
        .get("content")
        .and_then(|c| c.as_str())
        .map(str::to_string)
        .ok_or_else(|| FetchError::Failed("no content in browser response".into()))
}

/// Remove markdown image syntax: ![alt](url) and [![alt](url)](link)
pub fn strip_images(md: &str) -> String {
    static IMAGES: OnceLock<Regex> = OnceLock::new();
    static BLANKS: OnceLock<Regex> = OnceLock::new();
    let images = IMAGES.get_or_init(|| Regex::new(r"!\[[^\]]*\]\([^)]*\)").unwrap());
    let blanks = BLANKS.get_or_init(|| Regex::new(r"\n{3,}").unwrap());
    let cleaned = images.replace_all(md, "");
    blanks.replace_all(&cleaned, "\n\n").to_string()
}

/// Absolute http(s) targets of every markdown link, in page order, deduplicated.
pub fn markdown_links(md: &str, base: &str) -> Vec<String> {
    static LINK: OnceLock<Regex> = OnceLock::new();
    let re = LINK.get_or_init(|| Regex::new(r"\[[^\]]*\]\(<?([^)\s>]+)>?[^)]*\)").unwrap());
    let base = Url::parse(base).ok();

    let mut seen = HashSet::new();
    let mut links = Vec::new();
    for cap in re.captures_iter(md) {
        let href = &cap[1];
        let resolved = match &base {
            Some(b) => b.join(href),
            None => Url::parse(href),
        };
        let Ok(url) = resolved else { continue };
        if (url.scheme() == "http" || url.scheme() == "https") && seen.insert(url.to_string()) {
            links.push(url.to_string());
        }
    }
    links
}

/// True for links to `.csv` or `.xlsx` files.
pub fn is_download_link(link: &str) -> bool {
    static EXT: OnceLock<Regex> = OnceLock::new();
    let re = EXT.get_or_init(|| Regex::new(r"(?i)\.(xlsx|csv)$").unwrap());
    if re.is_match(link) {
        return true;
    }
    Url::parse(link)
        .map(|u| re.is_match(u.path()))
        .unwrap_or(false)
}

pub fn download_links(links: &[String]) -> Vec<String> {
    links.iter().filter(|l| is_download_link(l)).cloned().collect()
}
