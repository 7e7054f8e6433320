//! Local SQLite store, idempotent writer and HTTP fetch utilities.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use fxetl_core::{CanonicalRate, InsertOutcome, StoredRate, TableSpec};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{QueryBuilder, Row};
use thiserror::Error;
use tracing::{info, info_span, warn};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("creating database directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("undecodable stored row: {0}")]
    Decode(String),
}

/// Connection to the embedded store, scoped to one pipeline run:
/// open, operate, close.
#[derive(Debug, Clone)]
pub struct LocalStore {
    pool: SqlitePool,
}

impl LocalStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|source| StoreError::CreateDir {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(self) {
        self.pool.close().await;
    }

    /// Create the target table if absent. Never alters an existing schema.
    pub async fn ensure_table(&self, spec: &TableSpec) -> Result<(), StoreError> {
        let currency_name_column = if spec.has_currency_name {
            "currency_name TEXT,\n            "
        } else {
            ""
        };
        let ddl = format!(
            r#"
        CREATE TABLE IF NOT EXISTS {table} (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            {entity} TEXT NOT NULL,
            base_currency TEXT NOT NULL,
            {currency_name_column}exchange_rate REAL NOT NULL,
            date TEXT NOT NULL,
            timestamp_utc TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            UNIQUE({entity}, timestamp_utc)
        )
        "#,
            table = spec.name,
            entity = spec.entity_column,
        );
        sqlx::query(&ddl).execute(&self.pool).await?;
        Ok(())
    }

    /// Upsert a batch of canonical rows under the `(entity, timestamp_utc)`
    /// uniqueness constraint.
    ///
    /// Tries a single bulk insert-or-ignore statement first; if the storage
    /// layer rejects the batch as a whole, replays the rows one at a time so
    /// a single bad row cannot take down the rest. Inserted counts come from
    /// the engine's change counter in both paths. Existing key pairs are
    /// left untouched.
    pub async fn write_rates(
        &self,
        spec: &TableSpec,
        rows: &[CanonicalRate],
    ) -> Result<InsertOutcome, StoreError> {
        self.ensure_table(spec).await?;

        let valid: Vec<&CanonicalRate> = rows.iter().filter(|r| r.is_insertable()).collect();
        let invalid = (rows.len() - valid.len()) as u64;
        if invalid > 0 {
            warn!(table = spec.name, dropped = invalid, "dropping malformed rows before insert");
        }
        if valid.is_empty() {
            return Ok(InsertOutcome::BulkSucceeded {
                inserted: 0,
                skipped: invalid,
            });
        }

        match self.bulk_insert(spec, &valid).await {
            Ok(inserted) => {
                let skipped = invalid + (valid.len() as u64 - inserted);
                info!(table = spec.name, inserted, skipped, "bulk insert committed");
                Ok(InsertOutcome::BulkSucceeded { inserted, skipped })
            }
            Err(err) => {
                warn!(
                    table = spec.name,
                    error = %err,
                    "bulk insert failed, falling back to row-by-row"
                );
                let (inserted, skipped) = self.insert_one_by_one(spec, &valid).await;
                info!(table = spec.name, inserted, skipped, "fallback insert finished");
                Ok(InsertOutcome::FallbackUsed {
                    inserted,
                    skipped: invalid + skipped,
                })
            }
        }
    }

    async fn bulk_insert(
        &self,
        spec: &TableSpec,
        rows: &[&CanonicalRate],
    ) -> Result<u64, sqlx::Error> {
        let mut builder: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new(format!(
            "INSERT OR IGNORE INTO {} ({}) ",
            spec.name,
            insert_columns(spec)
        ));
        builder.push_values(rows.iter(), |mut b, row| {
            b.push_bind(row.entity_key.as_str());
            b.push_bind(row.base_currency.as_str());
            if spec.has_currency_name {
                b.push_bind(row.currency_name.as_deref());
            }
            b.push_bind(row.exchange_rate);
            b.push_bind(row.date.to_string());
            b.push_bind(row.timestamp_utc.to_rfc3339());
        });
        let result = builder.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    /// Robust path: each row is its own statement, so one failure never
    /// aborts the remainder of the batch.
    async fn insert_one_by_one(&self, spec: &TableSpec, rows: &[&CanonicalRate]) -> (u64, u64) {
        let sql = format!(
            "INSERT OR IGNORE INTO {} ({}) VALUES ({})",
            spec.name,
            insert_columns(spec),
            if spec.has_currency_name {
                "?, ?, ?, ?, ?, ?"
            } else {
                "?, ?, ?, ?, ?"
            }
        );

        let mut inserted = 0u64;
        let mut skipped = 0u64;
        for row in rows {
            let mut query = sqlx::query(&sql)
                .bind(row.entity_key.as_str())
                .bind(row.base_currency.as_str());
            if spec.has_currency_name {
                query = query.bind(row.currency_name.as_deref());
            }
            let query = query
                .bind(row.exchange_rate)
                .bind(row.date.to_string())
                .bind(row.timestamp_utc.to_rfc3339());

            match query.execute(&self.pool).await {
                Ok(result) => {
                    let changes = result.rows_affected();
                    inserted += changes;
                    if changes == 0 {
                        skipped += 1;
                    }
                }
                Err(err) => {
                    skipped += 1;
                    warn!(
                        table = spec.name,
                        entity = row.entity_key.as_str(),
                        error = %err,
                        "row insert failed, continuing"
                    );
                }
            }
        }
        (inserted, skipped)
    }

    /// Rows whose `created_at` falls inside the trailing window, oldest
    /// first. This is the "recently changed" query the remote sync feeds
    /// from; the window is a tuning knob, not an exactness guarantee.
    pub async fn fetch_recent(
        &self,
        spec: &TableSpec,
        window_minutes: i64,
    ) -> Result<Vec<StoredRate>, StoreError> {
        self.ensure_table(spec).await?;
        let sql = format!(
            "SELECT {columns} FROM {table} \
             WHERE created_at >= datetime('now', ?) \
             ORDER BY created_at ASC, {entity} ASC",
            columns = select_columns(spec),
            table = spec.name,
            entity = spec.entity_column,
        );
        let rows = sqlx::query(&sql)
            .bind(format!("-{window_minutes} minutes"))
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(|row| decode_stored_row(spec, row)).collect()
    }
}

fn insert_columns(spec: &TableSpec) -> String {
    if spec.has_currency_name {
        format!(
            "{}, base_currency, currency_name, exchange_rate, date, timestamp_utc",
            spec.entity_column
        )
    } else {
        format!(
            "{}, base_currency, exchange_rate, date, timestamp_utc",
            spec.entity_column
        )
    }
}

fn select_columns(spec: &TableSpec) -> String {
    format!("{}, created_at", insert_columns(spec))
}

fn decode_stored_row(spec: &TableSpec, row: &sqlx::sqlite::SqliteRow) -> Result<StoredRate, StoreError> {
    let entity_key: String = row.try_get(0)?;
    let base_currency: String = row.try_get(1)?;
    let (currency_name, offset) = if spec.has_currency_name {
        (row.try_get::<Option<String>, _>(2)?, 1usize)
    } else {
        (None, 0usize)
    };
    let exchange_rate: f64 = row.try_get(2 + offset)?;
    let date_text: String = row.try_get(3 + offset)?;
    let timestamp_text: String = row.try_get(4 + offset)?;
    let created_text: String = row.try_get(5 + offset)?;

    let date = NaiveDate::parse_from_str(&date_text, "%Y-%m-%d")
        .map_err(|e| StoreError::Decode(format!("date {date_text:?}: {e}")))?;
    let timestamp_utc = DateTime::parse_from_rfc3339(&timestamp_text)
        .map_err(|e| StoreError::Decode(format!("timestamp_utc {timestamp_text:?}: {e}")))?
        .with_timezone(&Utc);
    // SQLite's CURRENT_TIMESTAMP is UTC wall-clock without an offset marker.
    let created_at = NaiveDateTime::parse_from_str(&created_text, "%Y-%m-%d %H:%M:%S")
        .map_err(|e| StoreError::Decode(format!("created_at {created_text:?}: {e}")))?
        .and_utc();

    Ok(StoredRate {
        rate: CanonicalRate {
            entity_key,
            base_currency,
            currency_name,
            exchange_rate,
            date,
            timestamp_utc,
        },
        created_at,
    })
}

/// Append canonical rows to the per-source processed CSV, creating the file
/// (and its header) on first use. Best-effort from the pipeline's point of
/// view; callers log failures and move on.
pub fn append_processed_csv(
    path: impl AsRef<Path>,
    spec: &TableSpec,
    rows: &[CanonicalRate],
) -> anyhow::Result<usize> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
    }
    let is_new = !path.exists();
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("opening {}", path.display()))?;
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(file);

    if is_new {
        let mut header = vec![spec.entity_column, "base_currency"];
        if spec.has_currency_name {
            header.push("currency_name");
        }
        header.extend(["exchange_rate", "date", "timestamp_utc"]);
        writer.write_record(&header).context("writing csv header")?;
    }

    let mut written = 0usize;
    for row in rows {
        let mut record = vec![row.entity_key.clone(), row.base_currency.clone()];
        if spec.has_currency_name {
            record.push(row.currency_name.clone().unwrap_or_default());
        }
        record.push(row.exchange_rate.to_string());
        record.push(row.date.to_string());
        record.push(row.timestamp_utc.to_rfc3339());
        writer.write_record(&record).context("writing csv row")?;
        written += 1;
    }
    writer.flush().context("flushing csv")?;
    Ok(written)
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Thin fetch wrapper with a bounded timeout. One attempt per invocation;
/// retry policy belongs to whatever schedules the pipelines.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    pub async fn fetch_text(&self, url: &str) -> Result<String, FetchError> {
        let span = info_span!("http_fetch", url);
        let _guard = span.enter();

        let response = self.client.get(url).send().await?;
        let status = response.status();
        let final_url = response.url().to_string();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }
        Ok(response.text().await?)
    }
}
