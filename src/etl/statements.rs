use chrono::NaiveDate;

use crate::config::{ObjectStoreConfig, PostgresConfig};

/// Alias the relational source is attached under.
pub const SOURCE_ALIAS: &str = "postgres_db";
const SECRET_NAME: &str = "supabase_storage";

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum FileFormat {
    Parquet,
    Csv,
}

impl FileFormat {
    pub fn extension(self) -> &'static str {
        match self {
            FileFormat::Parquet => "parquet",
            FileFormat::Csv => "csv",
        }
    }

    fn copy_options(self) -> &'static str {
        match self {
            FileFormat::Parquet => "FORMAT PARQUET",
            FileFormat::Csv => "FORMAT CSV, HEADER true",
        }
    }
}

/// A source table and the projection that renames its columns.
#[derive(Debug, Clone)]
pub struct ExtractTable {
    pub name: &'static str,
    pub select: String,
}

/// Quote a value as a SQL string literal.
pub fn sql_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

pub fn create_secret(store: &ObjectStoreConfig) -> String {
    let endpoint = store
        .endpoint_url
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .trim_end_matches('/');
    format!(
        "DROP SECRET IF EXISTS {name};
CREATE SECRET {name} (
    TYPE S3,
    KEY_ID {key},
    SECRET {secret},
    ENDPOINT {endpoint},
    REGION {region},
    URL_STYLE 'path'
)",
        name = SECRET_NAME,
        key = sql_literal(&store.access_key_id),
        secret = sql_literal(&store.secret_access_key),
        endpoint = sql_literal(endpoint),
        region = sql_literal(&store.region),
    )
}

pub fn install_postgres() -> String {
    "INSTALL postgres;\nLOAD postgres".to_string()
}

pub fn attach_postgres(pg: &PostgresConfig) -> String {
    let conninfo = format!(
        "dbname={} user={} host={} password={} port={}",
        pg.database, pg.username, pg.host, pg.password, pg.port
    );
    format!(
        "ATTACH {} AS {} (TYPE POSTGRES, READ_ONLY)",
        sql_literal(&conninfo),
        SOURCE_ALIAS
    )
}

/// The three projections copied out of the source database.
pub fn extract_tables() -> Vec<ExtractTable> {
    vec![
        ExtractTable {
            name: "customers",
            select: format!(
                "SELECT
    id                              AS user_id,
    first_name                      AS user_first_name,
    last_name                       AS user_last_name,
    first_name || ' ' || last_name  AS user_full_name,
    CURRENT_DATE                    AS loaded_at_date,
    CURRENT_TIMESTAMP               AS loaded_at_ts_utc
FROM
    {}.customers",
                SOURCE_ALIAS
            ),
        },
        ExtractTable {
            name: "orders",
            select: format!(
                "SELECT
    id                  AS order_id,
    user_id             AS user_id,
    order_date          AS order_date,
    status              AS order_status,
    CURRENT_DATE        AS loaded_at_date,
    CURRENT_TIMESTAMP   AS loaded_at_ts_utc
FROM
    {}.orders",
                SOURCE_ALIAS
            ),
        },
        ExtractTable {
            name: "payments",
            select: format!(
                "SELECT
    id                  AS payment_id,
    order_id            AS order_id,
    payment_method      AS payment_method,
    amount              AS order_amount_usd,
    CURRENT_DATE        AS loaded_at_date,
    CURRENT_TIMESTAMP   AS loaded_at_ts_utc
FROM
    {}.payments",
                SOURCE_ALIAS
            ),
        },
    ]
}

pub fn preview(select: &str, limit: usize) -> String {
    format!("SELECT * FROM (\n{}\n) LIMIT {}", select, limit)
}

/// `<bucket>/<table>/<YYYY-MM-DD>.<ext>`
pub fn dated_path(bucket_url: &str, table: &str, date: NaiveDate, format: FileFormat) -> String {
    format!(
        "{}/{}/{}.{}",
        bucket_url.trim_end_matches('/'),
        table,
        date.format("%Y-%m-%d"),
        format.extension()
    )
}

/// `<bucket>/partitioned/<table>`
pub fn partition_dir(bucket_url: &str, table: &str) -> String {
    format!("{}/partitioned/{}", bucket_url.trim_end_matches('/'), table)
}

pub fn copy_to(select: &str, destination: &str, format: FileFormat) -> String {
    format!(
        "COPY (\n{}\n) TO {} ({})",
        select,
        sql_literal(destination),
        format.copy_options()
    )
}

pub fn copy_partitioned(select: &str, directory: &str) -> String {
    format!(
        "COPY (\n{}\n) TO {} (\n    FORMAT PARQUET,\n    PARTITION_BY (loaded_at_date),\n    OVERWRITE_OR_IGNORE true\n)",
        select,
        sql_literal(directory)
    )
}

fn parquet_glob(bucket_url: &str, table: &str) -> String {
    sql_literal(&format!("{}/{}/*.parquet", bucket_url.trim_end_matches('/'), table))
}

/// Record count per exported file of `table`.
pub fn file_counts(bucket_url: &str, table: &str) -> String {
    format!(
        "SELECT
    filename,
    count(*) AS record_count
FROM
    read_parquet({}, filename = true)
GROUP BY
    ALL
ORDER BY
    filename",
        parquet_glob(bucket_url, table)
    )
}

/// Orders joined with their customer and payment.
pub fn joined_orders(bucket_url: &str) -> String {
    format!(
        "SELECT
    orders.order_date,
    orders.order_id,
    customers.user_full_name,
    orders.order_status,
    payments.payment_method,
    payments.order_amount_usd,
    customers.user_id,
    payments.payment_id
FROM
    read_parquet({orders}) AS orders
    LEFT JOIN read_parquet({customers}) AS customers
        ON orders.user_id = customers.user_id
    LEFT JOIN read_parquet({payments}) AS payments
        ON orders.order_id = payments.order_id",
        orders = parquet_glob(bucket_url, "orders"),
        customers = parquet_glob(bucket_url, "customers"),
        payments = parquet_glob(bucket_url, "payments"),
    )
}
