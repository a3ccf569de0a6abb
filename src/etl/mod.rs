pub mod engine;
pub mod statements;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use tracing::info;

use crate::config::{ObjectStoreConfig, PostgresConfig};
use engine::{QueryTable, SqlEngine};
use statements::{ExtractTable, FileFormat};

const PREVIEW_ROWS: usize = 5;

#[derive(Debug, Clone)]
pub struct ExportOptions {
    pub formats: Vec<FileFormat>,
    pub partitioned: bool,
    pub preview: bool,
    /// Date stamped into the file names.
    pub date: NaiveDate,
}

/// Register the object-store secret on the engine.
pub fn connect_storage(engine: &mut dyn SqlEngine, store: &ObjectStoreConfig) -> Result<()> {
    engine
        .execute(&statements::create_secret(store))
        .context("failed to create storage secret")
}

/// Load the postgres extension and attach the source database read-only.
pub fn attach_source(engine: &mut dyn SqlEngine, pg: &PostgresConfig) -> Result<()> {
    engine
        .execute(&statements::install_postgres())
        .context("failed to load the postgres extension")?;
    engine
        .execute(&statements::attach_postgres(pg))
        .with_context(|| format!("failed to attach {}@{}", pg.database, pg.host))
}

/// Copy each table to `<bucket>/<table>/<date>.<ext>` for every format,
/// plus a date-partitioned parquet copy when asked. Returns the written
/// destinations in order.
pub fn export(
    engine: &mut dyn SqlEngine,
    bucket_url: &str,
    tables: &[ExtractTable],
    options: &ExportOptions,
) -> Result<Vec<String>> {
    let mut written = Vec::new();
    for table in tables {
        if options.preview {
            let sample = engine
                .query(&statements::preview(&table.select, PREVIEW_ROWS))
                .with_context(|| format!("failed to preview {}", table.name))?;
            if !sample.columns.is_empty() {
                println!("--- {} ---\n{}\n", table.name, sample.render());
            }
        }

        for &format in &options.formats {
            let destination = statements::dated_path(bucket_url, table.name, options.date, format);
            engine
                .execute(&statements::copy_to(&table.select, &destination, format))
                .with_context(|| format!("failed to export {} to {}", table.name, destination))?;
            info!("Exported {} to {}", table.name, destination);
            written.push(destination);
        }

        if options.partitioned {
            let directory = statements::partition_dir(bucket_url, table.name);
            engine
                .execute(&statements::copy_partitioned(&table.select, &directory))
                .with_context(|| format!("failed to export {} to {}", table.name, directory))?;
            info!("Exported {} partitioned by load date to {}", table.name, directory);
            written.push(directory);
        }
    }
    Ok(written)
}

#[derive(Debug, Default)]
pub struct Report {
    pub file_counts: QueryTable,
    pub joined: QueryTable,
}

/// Read the exported files back: per-file record counts of `table` and
/// the orders/customers/payments join.
pub fn report(engine: &mut dyn SqlEngine, bucket_url: &str, table: &str) -> Result<Report> {
    let file_counts = engine
        .query(&statements::file_counts(bucket_url, table))
        .with_context(|| format!("failed to count exported {} files", table))?;
    let joined = engine
        .query(&statements::joined_orders(bucket_url))
        .context("failed to join exported tables")?;
    Ok(Report { file_counts, joined })
}
