use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use config::{Config, Environment};
use serde::Deserialize;

/// What the scrape loop does when a record stays rate limited after every attempt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Fail the whole run.
    #[default]
    Abort,
    /// Keep the record without text, record the failure, move on.
    #[serde(alias = "skip-and-record")]
    #[value(alias = "skip-and-record")]
    Skip,
}

/// Flat view of the process environment. Built once in `main` and turned
/// into per-component configs by the accessors below.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub spider_api_key: Option<String>,
    #[serde(default = "default_spider_api_url")]
    pub spider_api_url: String,

    pub openai_api_key: Option<String>,
    #[serde(default = "default_openai_base_url")]
    pub openai_base_url: String,
    #[serde(default = "default_chat_model")]
    pub openai_chat_model: String,
    #[serde(default = "default_embedding_model")]
    pub openai_embedding_model: String,
    pub embedding_dimensions: Option<usize>,

    pub supabase_url: Option<String>,
    pub supabase_service_key: Option<String>,
    pub supabase_key: Option<String>,
    #[serde(default = "default_table")]
    pub supabase_table: String,
    #[serde(default = "default_bucket")]
    pub supabase_bucket: String,

    pub postgres_host: Option<String>,
    pub postgres_port: Option<String>,
    pub postgres_database: Option<String>,
    pub postgres_username: Option<String>,
    pub postgres_password: Option<String>,

    pub aws_access_key_id: Option<String>,
    pub aws_secret_access_key: Option<String>,
    pub aws_region: Option<String>,
    pub bucket_url: Option<String>,
    pub endpoint_url: Option<String>,

    #[serde(default = "default_max_retries")]
    pub scrape_max_retries: u32,
    #[serde(default = "default_retry_delay_secs")]
    pub scrape_retry_delay_secs: u64,
    #[serde(default = "default_checkpoint_every")]
    pub checkpoint_every: usize,
    #[serde(default = "default_checkpoint_dir")]
    pub checkpoint_dir: PathBuf,
    #[serde(default)]
    pub failure_policy: FailurePolicy,
}

fn default_spider_api_url() -> String {
    "https://api.spider.cloud".into()
}
fn default_openai_base_url() -> String {
    "https://api.openai.com/v1".into()
}
fn default_chat_model() -> String {
    "gpt-4o-2024-08-06".into()
}
fn default_embedding_model() -> String {
    "text-embedding-3-small".into()
}
fn default_table() -> String {
    "sf_csv_data".into()
}
fn default_bucket() -> String {
    "data".into()
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_delay_secs() -> u64 {
    5
}
fn default_checkpoint_every() -> usize {
    25
}
fn default_checkpoint_dir() -> PathBuf {
    PathBuf::from("data/checkpoints")
}

#[derive(Debug, Clone)]
pub struct SpiderConfig {
    pub api_key: String,
    pub api_url: String,
}

#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub api_key: String,
    pub base_url: String,
    pub chat_model: String,
    pub embedding_model: String,
    pub dimensions: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct SupabaseConfig {
    pub url: String,
    pub key: String,
    pub table: String,
    pub bucket: String,
}

#[derive(Debug, Clone)]
pub struct PostgresConfig {
    pub host: String,
    pub port: String,
    pub database: String,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct ObjectStoreConfig {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub region: String,
    pub endpoint_url: String,
    pub bucket_url: String,
}

/// Fixed-delay retry for rate-limited fetches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_retries(),
            delay: Duration::from_secs(default_retry_delay_secs()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScrapeConfig {
    pub retry: RetryPolicy,
    pub checkpoint_every: usize,
    pub checkpoint_dir: PathBuf,
    pub failure_policy: FailurePolicy,
}

impl Settings {
    /// Read settings from the process environment.
    pub fn load() -> Result<Self> {
        let cfg = Config::builder()
            .add_source(Environment::default())
            .build()
            .context("failed to read environment")?;
        Self::from_config(cfg)
    }

    pub fn from_config(cfg: Config) -> Result<Self> {
        cfg.try_deserialize().context("invalid configuration")
    }

    pub fn spider(&self) -> Result<SpiderConfig> {
        Ok(SpiderConfig {
            api_key: required(&self.spider_api_key, "SPIDER_API_KEY")?,
            api_url: self.spider_api_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn openai(&self) -> Result<OpenAiConfig> {
        Ok(OpenAiConfig {
            api_key: required(&self.openai_api_key, "OPENAI_API_KEY")?,
            base_url: self.openai_base_url.trim_end_matches('/').to_string(),
            chat_model: self.openai_chat_model.clone(),
            embedding_model: self.openai_embedding_model.clone(),
            dimensions: self.embedding_dimensions,
        })
    }

    pub fn supabase(&self) -> Result<SupabaseConfig> {
        let key = match required(&self.supabase_service_key, "SUPABASE_SERVICE_KEY") {
            Ok(key) => key,
            Err(_) => required(&self.supabase_key, "SUPABASE_SERVICE_KEY or SUPABASE_KEY")?,
        };
        Ok(SupabaseConfig {
            url: required(&self.supabase_url, "SUPABASE_URL")?
                .trim_end_matches('/')
                .to_string(),
            key,
            table: self.supabase_table.clone(),
            bucket: self.supabase_bucket.clone(),
        })
    }

    pub fn postgres(&self) -> Result<PostgresConfig> {
        Ok(PostgresConfig {
            host: required(&self.postgres_host, "POSTGRES_HOST")?,
            port: self
                .postgres_port
                .clone()
                .filter(|p| !p.trim().is_empty())
                .unwrap_or_else(|| "5432".into()),
            database: required(&self.postgres_database, "POSTGRES_DATABASE")?,
            username: required(&self.postgres_username, "POSTGRES_USERNAME")?,
            password: required(&self.postgres_password, "POSTGRES_PASSWORD")?,
        })
    }

    pub fn object_store(&self) -> Result<ObjectStoreConfig> {
        Ok(ObjectStoreConfig {
            access_key_id: required(&self.aws_access_key_id, "AWS_ACCESS_KEY_ID")?,
            secret_access_key: required(&self.aws_secret_access_key, "AWS_SECRET_ACCESS_KEY")?,
            region: required(&self.aws_region, "AWS_REGION")?,
            endpoint_url: required(&self.endpoint_url, "ENDPOINT_URL")?,
            bucket_url: required(&self.bucket_url, "BUCKET_URL")?
                .trim_end_matches('/')
                .to_string(),
        })
    }

    pub fn scrape(&self) -> Result<ScrapeConfig> {
        anyhow::ensure!(self.scrape_max_retries >= 1, "SCRAPE_MAX_RETRIES must be at least 1");
        anyhow::ensure!(self.checkpoint_every >= 1, "CHECKPOINT_EVERY must be at least 1");
        Ok(ScrapeConfig {
            retry: RetryPolicy {
                max_attempts: self.scrape_max_retries,
                delay: Duration::from_secs(self.scrape_retry_delay_secs),
            },
            checkpoint_every: self.checkpoint_every,
            checkpoint_dir: self.checkpoint_dir.clone(),
            failure_policy: self.failure_policy,
        })
    }
}

fn required(value: &Option<String>, name: &str) -> Result<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .with_context(|| format!("{} environment variable must be set", name))
}
