mod browser;
mod catalog;
mod checkpoint;
mod collect;
mod config;
mod download;
mod embed;
mod error;
mod etl;
mod llm;
mod records;
mod scrape;
mod supabase;

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::Context;
use clap::{Parser, Subcommand};

use crate::browser::SpiderBrowser;
use crate::checkpoint::CheckpointStore;
use crate::collect::Collector;
use crate::config::{FailurePolicy, Settings};
use crate::embed::OpenAiEmbedder;
use crate::etl::engine::{ScriptEngine, SqlEngine};
use crate::etl::statements::FileFormat;
use crate::llm::OpenAiModel;
use crate::supabase::SupabaseClient;

#[derive(Parser)]
#[command(name = "sfdata", about = "SF open-data collection and extraction pipelines")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build and maintain the dataset catalog of data.sfgov.org
    Catalog {
        #[command(subcommand)]
        command: CatalogCommand,
    },
    /// Fetch page text for every record of a JSON file, with checkpoints
    Scrape {
        /// JSON array of target pages
        input: PathBuf,
        /// Checkpoint directory (default: CHECKPOINT_DIR)
        #[arg(long)]
        checkpoint_dir: Option<PathBuf>,
        /// What to do with a record whose retries run out (default: FAILURE_POLICY)
        #[arg(long, value_enum)]
        on_exhausted: Option<FailurePolicy>,
    },
    /// Capture one live page, extract its data link with the model and upsert it
    Process {
        url: String,
        /// Send a screenshot along with the page text
        #[arg(long)]
        screenshot: bool,
    },
    /// Summarize, embed and upsert the records of the merged checkpoints
    UpsertCheckpoints {
        /// Checkpoint directory (default: CHECKPOINT_DIR)
        #[arg(long)]
        checkpoint_dir: Option<PathBuf>,
        /// Where errors.json and uploaded_data.json are written
        #[arg(short, long, default_value = "data")]
        output: PathBuf,
        #[arg(long, value_enum)]
        on_error: Option<FailurePolicy>,
    },
    /// Upsert a JSON array of rows as-is
    UpsertJson {
        path: PathBuf,
        /// Destination table (default: SUPABASE_TABLE)
        #[arg(short, long)]
        table: Option<String>,
    },
    /// Similarity search over the uploaded records
    Search {
        query: String,
        #[arg(short = 'n', long, default_value = "5")]
        count: usize,
    },
    /// Download a .csv/.xlsx file into a local folder
    Download {
        url: String,
        #[arg(short, long, default_value = "downloads")]
        folder: PathBuf,
        #[arg(short, long, default_value = "dataset")]
        title: String,
    },
    /// Download a .csv/.xlsx file and store it in the storage bucket
    Upload {
        url: String,
        #[arg(short, long, default_value = "dataset")]
        title: String,
        /// Folder inside the bucket
        #[arg(long, default_value = "csv")]
        folder: String,
        /// Bucket (default: SUPABASE_BUCKET)
        #[arg(short, long)]
        bucket: Option<String>,
    },
    /// Copy the relational source to object storage and read it back
    Etl {
        #[command(subcommand)]
        command: EtlCommand,
        /// Print the SQL instead of running it
        #[arg(long, global = true)]
        dry_run: bool,
    },
}

#[derive(Subcommand)]
enum CatalogCommand {
    /// Walk the browse listing and save every dataset link
    Crawl {
        #[arg(short, long, default_value = "data/datasets.json")]
        output: PathBuf,
        #[arg(short = 'n', long, default_value_t = catalog::MAX_BROWSE_PAGES)]
        max_pages: usize,
    },
    /// Add ids and CSV export URLs to a crawled catalog
    Annotate {
        input: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
        /// Also write the export URLs, one per line
        #[arg(long)]
        urls: Option<PathBuf>,
    },
    /// Upload every annotated dataset missing from the storage bucket
    Backfill { input: PathBuf },
}

#[derive(Subcommand)]
enum EtlCommand {
    /// Export customers, orders and payments as dated files
    Export {
        #[arg(long = "format", value_enum, default_values_t = [FileFormat::Parquet])]
        formats: Vec<FileFormat>,
        /// Also write a copy partitioned by load date
        #[arg(long)]
        partitioned: bool,
        /// Show a few rows of each projection first
        #[arg(long)]
        preview: bool,
    },
    /// Per-file record counts and the orders join
    Report {
        #[arg(long, default_value = "orders")]
        table: String,
        /// Max joined rows to display
        #[arg(short = 'n', long, default_value = "50")]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();
    let settings = Settings::load()?;

    let result = match cli.command {
        Commands::Catalog { command } => run_catalog(&settings, command).await,
        Commands::Scrape {
            input,
            checkpoint_dir,
            on_exhausted,
        } => {
            let mut config = settings.scrape()?;
            if let Some(dir) = checkpoint_dir {
                config.checkpoint_dir = dir;
            }
            if let Some(policy) = on_exhausted {
                config.failure_policy = policy;
            }
            let pages = collect::load_pages(&input)?;
            if pages.is_empty() {
                println!("{} has no pages.", input.display());
                return Ok(());
            }
            let browser = SpiderBrowser::new(settings.spider()?)?;
            let store = CheckpointStore::new(&config.checkpoint_dir);
            println!("Scraping {} pages...", pages.len());
            let outcome = scrape::scrape_pages(&browser, &store, pages, &config).await?;
            if outcome.resumed_from > 0 {
                println!("Resumed after record {}", outcome.resumed_from);
            }
            println!(
                "Done: {} records ({} with text, {} skipped), {} checkpoints written.",
                outcome.pages.len(),
                outcome.with_text(),
                outcome.failures.len(),
                outcome.checkpoints.len()
            );
            if !outcome.failures.is_empty() {
                let path = store.dir().join("scrape_errors.json");
                write_json(&path, &outcome.failures)?;
                println!("Skipped records listed in {}", path.display());
            }
            Ok(())
        }
        Commands::Process { url, screenshot } => {
            let supabase = settings.supabase()?;
            let openai = settings.openai()?;
            let browser = SpiderBrowser::new(settings.spider()?)?;
            let model = OpenAiModel::new(&openai)?;
            let embedder = OpenAiEmbedder::new(&openai)?;
            let sink = SupabaseClient::new(&supabase)?;
            let collector = Collector {
                browser: Some(&browser),
                model: &model,
                embedder: &embedder,
                sink: &sink,
                table: supabase.table.clone(),
            };
            let record = collector.process_page(&url, screenshot).await?;
            println!("Title:       {}", record.title);
            println!("Description: {}", truncate(&record.description, 120));
            println!("Data link:   {}", record.csv_url.as_deref().unwrap_or("-"));
            Ok(())
        }
        Commands::UpsertCheckpoints {
            checkpoint_dir,
            output,
            on_error,
        } => {
            let scrape_config = settings.scrape()?;
            let dir = checkpoint_dir.unwrap_or(scrape_config.checkpoint_dir);
            let policy = on_error.unwrap_or(scrape_config.failure_policy);
            let pages = CheckpointStore::new(&dir).load_merged()?;
            if pages.is_empty() {
                println!("No checkpoints in {}. Run 'scrape' first.", dir.display());
                return Ok(());
            }

            let supabase = settings.supabase()?;
            let openai = settings.openai()?;
            let model = OpenAiModel::new(&openai)?;
            let embedder = OpenAiEmbedder::new(&openai)?;
            let sink = SupabaseClient::new(&supabase)?;
            let collector = Collector {
                browser: None,
                model: &model,
                embedder: &embedder,
                sink: &sink,
                table: supabase.table.clone(),
            };
            println!("Upserting {} records to {}...", pages.len(), supabase.table);
            let report = collector.upsert_batch(&pages, policy).await?;
            let (errors, uploaded) = collect::write_report(&output, &report)?;
            println!(
                "Uploaded {} records, {} errors ({}, {}).",
                report.uploaded.len(),
                report.errors.len(),
                uploaded.display(),
                errors.display()
            );
            Ok(())
        }
        Commands::UpsertJson { path, table } => {
            let supabase = settings.supabase()?;
            let table = table.unwrap_or_else(|| supabase.table.clone());
            let rows = collect::load_rows(&path)?;
            SupabaseClient::new(&supabase)?.upsert_json(&table, &rows).await?;
            println!("Upserted {} rows to {}.", rows.len(), table);
            Ok(())
        }
        Commands::Search { query, count } => {
            let supabase = settings.supabase()?;
            let embedder = OpenAiEmbedder::new(&settings.openai()?)?;
            let client = SupabaseClient::new(&supabase)?;
            let rows = collect::search(&embedder, &client, &supabase.table, &query, count).await?;
            if rows.is_empty() {
                println!("No matches.");
                return Ok(());
            }
            for (i, row) in rows.iter().enumerate() {
                let field = |name: &str| row.get(name).and_then(|v| v.as_str()).unwrap_or("-");
                println!("{:>2}. {}", i + 1, truncate(field("title"), 80));
                println!("    {}", field("url"));
            }
            Ok(())
        }
        Commands::Download { url, folder, title } => {
            let client = reqwest::Client::new();
            let path = download::download_to_local(&client, &url, &folder, &title).await?;
            println!("Saved {}", path.display());
            Ok(())
        }
        Commands::Upload {
            url,
            title,
            folder,
            bucket,
        } => {
            let supabase = settings.supabase()?;
            let bucket = bucket.unwrap_or_else(|| supabase.bucket.clone());
            let storage = SupabaseClient::new(&supabase)?;
            let path = download::upload_to_bucket(
                &reqwest::Client::new(),
                &storage,
                &bucket,
                &folder,
                &url,
                &title,
            )
            .await?;
            println!("Stored {} as {}/{}", url, bucket, path);
            Ok(())
        }
        Commands::Etl { command, dry_run } => run_etl(&settings, command, dry_run),
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

async fn run_catalog(settings: &Settings, command: CatalogCommand) -> anyhow::Result<()> {
    match command {
        CatalogCommand::Crawl { output, max_pages } => {
            let client = reqwest::Client::new();
            let datasets = catalog::crawl(&client, catalog::PORTAL_URL, max_pages).await?;
            write_json(&output, &datasets)?;
            println!("Saved {} datasets to {}", datasets.len(), output.display());
        }
        CatalogCommand::Annotate { input, output, urls } => {
            let pages = catalog::annotate(collect::load_pages(&input)?);
            write_json(&output, &pages)?;
            println!("Annotated {} datasets into {}", pages.len(), output.display());
            if let Some(urls) = urls {
                std::fs::write(&urls, catalog::download_url_lines(&pages))
                    .with_context(|| format!("failed to write {}", urls.display()))?;
                println!("Export URLs written to {}", urls.display());
            }
        }
        CatalogCommand::Backfill { input } => {
            let supabase = settings.supabase()?;
            let storage = SupabaseClient::new(&supabase)?;
            let pages = collect::load_pages(&input)?;
            let report =
                catalog::backfill(&storage, &reqwest::Client::new(), &supabase.bucket, &pages).await?;
            println!(
                "{} missing: {} uploaded, {} failed.",
                report.missing, report.uploaded, report.failed
            );
        }
    }
    Ok(())
}

fn run_etl(settings: &Settings, command: EtlCommand, dry_run: bool) -> anyhow::Result<()> {
    let store = settings.object_store()?;
    let postgres = match &command {
        EtlCommand::Export { .. } => Some(settings.postgres()?),
        EtlCommand::Report { .. } => None,
    };
    let mut script = ScriptEngine::default();
    script.redact(&store.access_key_id);
    script.redact(&store.secret_access_key);
    if let Some(pg) = &postgres {
        script.redact(&pg.password);
    }
    #[cfg(feature = "duckdb")]
    let mut duck = if dry_run {
        None
    } else {
        Some(etl::engine::DuckDbEngine::open_in_memory()?)
    };
    #[cfg(feature = "duckdb")]
    let engine: &mut dyn SqlEngine = match duck.as_mut() {
        Some(duck) => duck as &mut dyn SqlEngine,
        None => &mut script,
    };
    #[cfg(not(feature = "duckdb"))]
    let engine: &mut dyn SqlEngine = {
        anyhow::ensure!(
            dry_run,
            "built without the `duckdb` feature; pass --dry-run or rebuild with --features duckdb"
        );
        &mut script
    };

    etl::connect_storage(engine, &store)?;
    match command {
        EtlCommand::Export {
            formats,
            partitioned,
            preview,
        } => {
            if let Some(pg) = &postgres {
                etl::attach_source(engine, pg)?;
            }
            let options = etl::ExportOptions {
                formats,
                partitioned,
                preview,
                date: chrono::Local::now().date_naive(),
            };
            let tables = etl::statements::extract_tables();
            let written = etl::export(engine, &store.bucket_url, &tables, &options)?;
            if !dry_run {
                println!("Wrote {} exports:", written.len());
                for path in &written {
                    println!("  {}", path);
                }
            }
        }
        EtlCommand::Report { table, limit } => {
            let mut report = etl::report(engine, &store.bucket_url, &table)?;
            if !dry_run {
                println!("--- {} files ---\n{}\n", table, report.file_counts.render());
                report.joined.rows.truncate(limit);
                println!("--- orders ---\n{}", report.joined.render());
            }
        }
    }

    if dry_run {
        println!("{}", script.script());
    }
    Ok(())
}

fn write_json<T: serde::Serialize + ?Sized>(path: &Path, value: &T) -> anyhow::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    std::fs::write(path, serde_json::to_vec_pretty(value)?)
        .with_context(|| format!("failed to write {}", path.display()))
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max).collect();
        format!("{}...", truncated)
    }
}

fn format_duration(d: std::time::Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
