//! Remote sync, alerting and per-pipeline orchestration.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use fxetl_adapters::{
    AdapterError, ApiAdapter, HistoryCsvAdapter, ScrapeAdapter, SourceAdapter,
};
use fxetl_core::{InsertOutcome, SourceKind, StoredRate, TableSpec};
use fxetl_storage::{
    append_processed_csv, HttpClientConfig, HttpFetcher, LocalStore,
};
use lettre::message::{header, Mailbox, Message};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Tokio1Executor};
use serde::Serialize;
use serde_json::{json, Value as JsonValue};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Process-wide configuration, loaded once at startup and passed by
/// reference into every component. Every knob has a default.
#[derive(Debug, Clone)]
pub struct EtlConfig {
    pub db_path: PathBuf,
    pub processed_dir: PathBuf,
    pub history_csv_path: PathBuf,
    pub base_currency: String,
    pub api_url: String,
    pub scrape_url: String,
    pub sync_window_minutes: i64,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub remote_url: Option<String>,
    pub remote_key: Option<String>,
    pub remote_table: String,
    pub smtp: Option<SmtpConfig>,
}

#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub user: String,
    pub pass: String,
    pub from: String,
    pub to: String,
}

impl EtlConfig {
    pub fn from_env() -> Self {
        let base_currency =
            std::env::var("FXETL_BASE_CURRENCY").unwrap_or_else(|_| "EUR".to_string());
        Self {
            db_path: std::env::var("FXETL_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("database/forex_data.db")),
            processed_dir: std::env::var("FXETL_PROCESSED_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("data/processed")),
            history_csv_path: std::env::var("FXETL_HISTORY_CSV")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("data/raw/daily_forex_rates.csv")),
            api_url: std::env::var("FXETL_API_URL")
                .unwrap_or_else(|_| "https://api.frankfurter.app/latest".to_string()),
            scrape_url: std::env::var("FXETL_SCRAPE_URL").unwrap_or_else(|_| {
                format!("https://www.x-rates.com/table/?from={base_currency}&amount=1")
            }),
            sync_window_minutes: std::env::var("FXETL_SYNC_WINDOW_MINUTES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            http_timeout_secs: std::env::var("FXETL_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            user_agent: std::env::var("FXETL_USER_AGENT")
                .unwrap_or_else(|_| "fxetl-bot/0.1".to_string()),
            remote_url: std::env::var("SUPABASE_URL").ok(),
            remote_key: std::env::var("SUPABASE_KEY").ok(),
            remote_table: std::env::var("FXETL_REMOTE_TABLE")
                .unwrap_or_else(|_| "forex_rates".to_string()),
            smtp: SmtpConfig::from_env(),
            base_currency,
        }
    }

    pub fn processed_csv_path(&self, kind: SourceKind) -> PathBuf {
        self.processed_dir
            .join(format!("forex_{}.csv", kind.source_tag()))
    }
}

impl SmtpConfig {
    fn from_env() -> Option<Self> {
        Some(Self {
            host: std::env::var("SMTP_HOST").ok()?,
            user: std::env::var("SMTP_USER").ok()?,
            pass: std::env::var("SMTP_PASS").ok()?,
            from: std::env::var("ALERT_EMAIL_FROM").ok()?,
            to: std::env::var("ALERT_EMAIL_TO").ok()?,
        })
    }
}

/// Remote hosted store. The only interface the core consumes is a batch
/// insert; the remote side is expected to tolerate re-submission (see the
/// trailing-window note on [`sync_recent`]).
#[async_trait]
pub trait RemoteSink: Send + Sync {
    async fn insert(&self, table: &str, records: &[JsonValue]) -> Result<()>;
}

/// PostgREST-style client: one POST per batch, JSON array body.
pub struct PostgrestSink {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl PostgrestSink {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building remote store client")?;
        Ok(Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            client,
        })
    }
}

#[async_trait]
impl RemoteSink for PostgrestSink {
    async fn insert(&self, table: &str, records: &[JsonValue]) -> Result<()> {
        let url = format!("{}/rest/v1/{}", self.base_url.trim_end_matches('/'), table);
        let response = self
            .client
            .post(&url)
            .header("apikey", &self.api_key)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Prefer", "return=minimal")
            .json(records)
            .send()
            .await
            .with_context(|| format!("submitting {} records to {url}", records.len()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("remote store returned {status}: {body}");
        }
        Ok(())
    }
}

/// Stand-in used when no remote store is configured; keeps the pipelines
/// locally durable without a network dependency.
pub struct DisabledSink;

#[async_trait]
impl RemoteSink for DisabledSink {
    async fn insert(&self, table: &str, records: &[JsonValue]) -> Result<()> {
        warn!(table, count = records.len(), "remote sync disabled, records not submitted");
        Ok(())
    }
}

/// Fire-and-forget operator alerting. Implementations never propagate an
/// error; the return value only says whether the alert went out.
#[async_trait]
pub trait Alerter: Send + Sync {
    async fn alert(&self, subject: &str, message: &str) -> bool;
}

pub struct EmailAlerter {
    mailer: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    to: Mailbox,
}

impl EmailAlerter {
    pub fn new(config: &SmtpConfig) -> Result<Self> {
        let creds = Credentials::new(config.user.clone(), config.pass.clone());
        let mailer = AsyncSmtpTransport::<Tokio1Executor>::relay(&config.host)
            .context("invalid SMTP host")?
            .credentials(creds)
            .build();
        let from = config.from.parse().context("invalid alert sender address")?;
        let to = config.to.parse().context("invalid alert recipient address")?;
        Ok(Self { mailer, from, to })
    }
}

#[async_trait]
impl Alerter for EmailAlerter {
    async fn alert(&self, subject: &str, message: &str) -> bool {
        error!(subject, message, "operator alert raised");
        let email = Message::builder()
            .from(self.from.clone())
            .to(self.to.clone())
            .subject(subject)
            .header(header::ContentType::TEXT_PLAIN)
            .body(message.to_string());
        let email = match email {
            Ok(email) => email,
            Err(err) => {
                error!(error = %err, "failed to build alert email");
                return false;
            }
        };
        match self.mailer.send(email).await {
            Ok(_) => {
                info!("alert email sent");
                true
            }
            Err(err) => {
                error!(error = %err, "failed to send alert email");
                false
            }
        }
    }
}

/// Used when SMTP is not configured: the alert still lands in the log.
pub struct LogOnlyAlerter;

#[async_trait]
impl Alerter for LogOnlyAlerter {
    async fn alert(&self, subject: &str, message: &str) -> bool {
        error!(subject, message, "operator alert raised (no SMTP configured)");
        false
    }
}

/// Shape stored rows for the remote store: all canonical columns plus the
/// insertion time and the provenance tag. The local surrogate id stays home.
pub fn remote_records(spec: &TableSpec, source_tag: &str, stored: &[StoredRate]) -> Vec<JsonValue> {
    stored
        .iter()
        .map(|row| {
            let mut record = serde_json::Map::new();
            record.insert(
                spec.entity_column.to_string(),
                json!(row.rate.entity_key),
            );
            record.insert("base_currency".to_string(), json!(row.rate.base_currency));
            if spec.has_currency_name {
                record.insert("currency_name".to_string(), json!(row.rate.currency_name));
            }
            record.insert("exchange_rate".to_string(), json!(row.rate.exchange_rate));
            record.insert("date".to_string(), json!(row.rate.date.to_string()));
            record.insert(
                "timestamp_utc".to_string(),
                json!(row.rate.timestamp_utc.to_rfc3339()),
            );
            record.insert("created_at".to_string(), json!(row.created_at.to_rfc3339()));
            record.insert("source".to_string(), json!(source_tag));
            JsonValue::Object(record)
        })
        .collect()
}

/// Push rows created inside the trailing window to the remote store.
///
/// Best-effort by contract: any failure is alerted and swallowed, because
/// the rows are already durable locally and sync failure is staleness, not
/// data loss. Window-based selection can re-submit rows a previous run
/// already pushed; the remote key absorbs that.
pub async fn sync_recent(
    store: &LocalStore,
    kind: SourceKind,
    window_minutes: i64,
    remote_table: &str,
    remote: &dyn RemoteSink,
    alerter: &dyn Alerter,
) -> bool {
    let spec = kind.table_spec();
    let result: Result<usize> = async {
        let stored = store.fetch_recent(&spec, window_minutes).await?;
        if stored.is_empty() {
            return Ok(0);
        }
        let records = remote_records(&spec, kind.source_tag(), &stored);
        remote.insert(remote_table, &records).await?;
        Ok(records.len())
    }
    .await;

    match result {
        Ok(0) => {
            info!(source = %kind, "no recent rows to sync");
            true
        }
        Ok(count) => {
            info!(source = %kind, count, "recent rows synced to remote store");
            true
        }
        Err(err) => {
            alerter
                .alert(
                    "[Sync] remote store sync failed",
                    &format!("Failed to sync {kind} rows to the remote store: {err:#}"),
                )
                .await;
            false
        }
    }
}

/// Outcome of one pipeline run, for logs and the CLI.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub kind: SourceKind,
    pub normalized_rows: usize,
    pub outcome: Option<InsertOutcome>,
    pub synced: bool,
}

/// One generic pipeline: adapter fetch, source-specific normalization,
/// idempotent local write, processed-CSV mirror, trailing-window remote
/// sync. Short-circuits on stage failure; remote sync fires only after a
/// write that made durable progress.
pub struct Pipeline<'a> {
    pub config: &'a EtlConfig,
    pub http: &'a HttpFetcher,
    pub remote: &'a dyn RemoteSink,
    pub alerter: &'a dyn Alerter,
}

impl Pipeline<'_> {
    pub async fn run(&self, adapter: &dyn SourceAdapter) -> Result<RunSummary> {
        let kind = adapter.kind();
        let run_id = Uuid::new_v4();
        let span = info_span!("pipeline", source = %kind, %run_id);
        self.run_inner(adapter, kind, run_id).instrument(span).await
    }

    async fn run_inner(
        &self,
        adapter: &dyn SourceAdapter,
        kind: SourceKind,
        run_id: Uuid,
    ) -> Result<RunSummary> {
        info!("pipeline starting");

        let raw = match adapter.fetch(self.http).await {
            Ok(raw) => raw,
            Err(err) => return Err(self.stage_failure(kind, "fetch", err).await),
        };
        let rows = match adapter.normalize(&raw) {
            Ok(rows) => rows,
            Err(err) => return Err(self.stage_failure(kind, "normalize", err).await),
        };
        if rows.is_empty() {
            warn!("no usable rows after normalization, nothing to persist");
            return Ok(RunSummary {
                run_id,
                kind,
                normalized_rows: 0,
                outcome: None,
                synced: false,
            });
        }

        let spec = kind.table_spec();
        let store = LocalStore::open(&self.config.db_path)
            .await
            .context("opening local store")?;
        let outcome = store
            .write_rates(&spec, &rows)
            .await
            .context("writing rows to local store")?;
        info!(
            inserted = outcome.inserted(),
            skipped = outcome.skipped(),
            "local write finished"
        );

        let mirror_path = self.config.processed_csv_path(kind);
        if let Err(err) = append_processed_csv(&mirror_path, &spec, &rows) {
            warn!(error = %err, path = %mirror_path.display(), "processed csv mirror failed");
        }

        // An all-duplicates write is a successful no-op; there is nothing
        // new for the remote side, so the sync stage is skipped.
        let synced = if outcome.inserted() == 0 {
            warn!("write made no durable progress, skipping remote sync");
            false
        } else {
            sync_recent(
                &store,
                kind,
                self.config.sync_window_minutes,
                &self.config.remote_table,
                self.remote,
                self.alerter,
            )
            .await
        };
        store.close().await;

        Ok(RunSummary {
            run_id,
            kind,
            normalized_rows: rows.len(),
            outcome: Some(outcome),
            synced,
        })
    }

    /// Stage-level failure: aborts this pipeline only. Malformed markup
    /// from the scrape source additionally pages the operator, since a
    /// silent scrape breakage would otherwise look like a quiet day.
    async fn stage_failure(&self, kind: SourceKind, stage: &str, err: AdapterError) -> anyhow::Error {
        error!(source = %kind, stage, error = %err, "pipeline stage failed");
        if kind == SourceKind::Scrape && err.is_malformed() {
            self.alerter
                .alert(
                    "[Scrape] rates page parse failure",
                    &format!("Scrape pipeline failed during {stage}: {err}"),
                )
                .await;
        }
        anyhow::Error::new(err).context(format!("{kind} pipeline {stage} stage"))
    }
}

/// Facade wiring config, HTTP client, remote sink and alerter together.
pub struct Etl {
    config: EtlConfig,
    http: HttpFetcher,
    remote: Box<dyn RemoteSink>,
    alerter: Box<dyn Alerter>,
}

impl Etl {
    pub fn new(config: EtlConfig) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
        })?;
        let remote: Box<dyn RemoteSink> = match (&config.remote_url, &config.remote_key) {
            (Some(url), Some(key)) => Box::new(PostgrestSink::new(
                url.clone(),
                key.clone(),
                Duration::from_secs(config.http_timeout_secs),
            )?),
            _ => Box::new(DisabledSink),
        };
        let alerter: Box<dyn Alerter> = match &config.smtp {
            Some(smtp) => Box::new(EmailAlerter::new(smtp)?),
            None => Box::new(LogOnlyAlerter),
        };
        Ok(Self {
            config,
            http,
            remote,
            alerter,
        })
    }

    pub fn config(&self) -> &EtlConfig {
        &self.config
    }

    fn adapter_for(&self, kind: SourceKind) -> Box<dyn SourceAdapter> {
        match kind {
            SourceKind::Api => Box::new(ApiAdapter::new(
                self.config.api_url.clone(),
                self.config.base_currency.clone(),
            )),
            SourceKind::History => Box::new(HistoryCsvAdapter::new(
                self.config.history_csv_path.clone(),
                self.config.base_currency.clone(),
            )),
            SourceKind::Scrape => Box::new(ScrapeAdapter::new(
                self.config.scrape_url.clone(),
                self.config.base_currency.clone(),
            )),
        }
    }

    pub async fn run(&self, kind: SourceKind) -> Result<RunSummary> {
        let adapter = self.adapter_for(kind);
        let pipeline = Pipeline {
            config: &self.config,
            http: &self.http,
            remote: self.remote.as_ref(),
            alerter: self.alerter.as_ref(),
        };
        pipeline.run(adapter.as_ref()).await
    }

    /// Run every pipeline in sequence. Each is independent: a failure is
    /// reported in its slot and never stops the others.
    pub async fn run_all(&self) -> Vec<(SourceKind, Result<RunSummary>)> {
        let mut results = Vec::new();
        for kind in [SourceKind::Api, SourceKind::History, SourceKind::Scrape] {
            let result = self.run(kind).await;
            if let Err(err) = &result {
                error!(source = %kind, error = %err, "pipeline failed");
            }
            results.push((kind, result));
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone, Utc};
    use fxetl_adapters::{ApiSnapshot, RawRecord};
    use fxetl_core::CanonicalRate;
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use tempfile::tempdir;

    struct CollectingSink {
        batches: Mutex<Vec<(String, Vec<JsonValue>)>>,
    }

    impl CollectingSink {
        fn new() -> Self {
            Self {
                batches: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl RemoteSink for CollectingSink {
        async fn insert(&self, table: &str, records: &[JsonValue]) -> Result<()> {
            self.batches
                .lock()
                .expect("sink lock")
                .push((table.to_string(), records.to_vec()));
            Ok(())
        }
    }

    struct FailingSink;

    #[async_trait]
    impl RemoteSink for FailingSink {
        async fn insert(&self, _table: &str, _records: &[JsonValue]) -> Result<()> {
            anyhow::bail!("remote store unreachable")
        }
    }

    struct CollectingAlerter {
        subjects: Mutex<Vec<String>>,
    }

    impl CollectingAlerter {
        fn new() -> Self {
            Self {
                subjects: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Alerter for CollectingAlerter {
        async fn alert(&self, subject: &str, _message: &str) -> bool {
            self.subjects
                .lock()
                .expect("alerter lock")
                .push(subject.to_string());
            true
        }
    }

    struct FixtureAdapter {
        kind: SourceKind,
        raw: Result<RawRecord, String>,
        inner: ApiAdapter,
    }

    #[async_trait]
    impl SourceAdapter for FixtureAdapter {
        fn kind(&self) -> SourceKind {
            self.kind
        }

        async fn fetch(&self, _http: &HttpFetcher) -> Result<RawRecord, AdapterError> {
            match &self.raw {
                Ok(raw) => Ok(raw.clone()),
                Err(message) => Err(AdapterError::Malformed(message.clone())),
            }
        }

        fn normalize(&self, raw: &RawRecord) -> Result<Vec<CanonicalRate>, AdapterError> {
            self.inner.normalize(raw)
        }
    }

    fn api_fixture(rates: &[(&str, f64)]) -> FixtureAdapter {
        FixtureAdapter {
            kind: SourceKind::Api,
            raw: Ok(RawRecord::Api(ApiSnapshot {
                base: "EUR".to_string(),
                date: "2025-01-10".to_string(),
                rates: rates
                    .iter()
                    .map(|(code, rate)| (code.to_string(), *rate))
                    .collect::<BTreeMap<_, _>>(),
            })),
            inner: ApiAdapter::new("https://rates.example/latest", "EUR"),
        }
    }

    fn test_config(dir: &tempfile::TempDir) -> EtlConfig {
        EtlConfig {
            db_path: dir.path().join("forex.db"),
            processed_dir: dir.path().join("processed"),
            history_csv_path: dir.path().join("history.csv"),
            base_currency: "EUR".to_string(),
            api_url: "https://rates.example/latest".to_string(),
            scrape_url: "https://rates.example/table".to_string(),
            sync_window_minutes: 20,
            http_timeout_secs: 5,
            user_agent: "fxetl-test/0".to_string(),
            remote_url: None,
            remote_key: None,
            remote_table: "forex_rates".to_string(),
            smtp: None,
        }
    }

    fn stored(key: &str, name: Option<&str>) -> StoredRate {
        StoredRate {
            rate: CanonicalRate {
                entity_key: key.to_string(),
                base_currency: "EUR".to_string(),
                currency_name: name.map(str::to_string),
                exchange_rate: 1.05,
                date: NaiveDate::from_ymd_opt(2025, 1, 10).expect("valid date"),
                timestamp_utc: Utc.with_ymd_and_hms(2025, 1, 10, 15, 0, 0).single().expect("valid instant"),
            },
            created_at: Utc.with_ymd_and_hms(2025, 1, 10, 15, 1, 0).single().expect("valid instant"),
        }
    }

    #[test]
    fn remote_records_carry_source_tag_and_entity_column() {
        let api = remote_records(
            &SourceKind::Api.table_spec(),
            SourceKind::Api.source_tag(),
            &[stored("USD", None)],
        );
        assert_eq!(api[0]["currency"], "USD");
        assert_eq!(api[0]["source"], "api");
        assert!(api[0].get("currency_name").is_none());
        assert!(api[0].get("id").is_none());

        let scraped = remote_records(
            &SourceKind::Scrape.table_spec(),
            SourceKind::Scrape.source_tag(),
            &[stored("US Dollar", None)],
        );
        assert_eq!(scraped[0]["currency_name"], "US Dollar");
        assert_eq!(scraped[0]["source"], "scraper");

        let history = remote_records(
            &SourceKind::History.table_spec(),
            SourceKind::History.source_tag(),
            &[stored("USD", Some("US Dollar"))],
        );
        assert_eq!(history[0]["currency"], "USD");
        assert_eq!(history[0]["currency_name"], "US Dollar");
        assert_eq!(history[0]["source"], "csv");
    }

    #[tokio::test]
    async fn pipeline_persists_syncs_and_mirrors() {
        let dir = tempdir().expect("tempdir");
        let config = test_config(&dir);
        let http = HttpFetcher::new(Default::default()).expect("fetcher");
        let sink = CollectingSink::new();
        let alerter = CollectingAlerter::new();
        let pipeline = Pipeline {
            config: &config,
            http: &http,
            remote: &sink,
            alerter: &alerter,
        };

        let adapter = api_fixture(&[("USD", 1.05), ("GBP", -0.5)]);
        let summary = pipeline.run(&adapter).await.expect("run");

        assert_eq!(summary.normalized_rows, 1);
        let outcome = summary.outcome.expect("outcome");
        assert_eq!(outcome.inserted(), 1);
        assert!(summary.synced);

        let batches = sink.batches.lock().expect("sink lock");
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].0, "forex_rates");
        assert_eq!(batches[0].1.len(), 1);
        assert_eq!(batches[0].1[0]["currency"], "USD");
        assert_eq!(batches[0].1[0]["timestamp_utc"], "2025-01-10T15:00:00+00:00");

        assert!(config.processed_csv_path(SourceKind::Api).exists());
        assert!(alerter.subjects.lock().expect("alerter lock").is_empty());
    }

    #[tokio::test]
    async fn rerun_over_same_window_inserts_nothing_and_skips_sync() {
        let dir = tempdir().expect("tempdir");
        let config = test_config(&dir);
        let http = HttpFetcher::new(Default::default()).expect("fetcher");
        let sink = CollectingSink::new();
        let alerter = CollectingAlerter::new();
        let pipeline = Pipeline {
            config: &config,
            http: &http,
            remote: &sink,
            alerter: &alerter,
        };

        let adapter = api_fixture(&[("USD", 1.05)]);
        pipeline.run(&adapter).await.expect("first run");
        let second = pipeline.run(&adapter).await.expect("second run");

        let outcome = second.outcome.expect("outcome");
        assert_eq!(outcome.inserted(), 0);
        assert_eq!(outcome.skipped(), 1);
        assert!(!second.synced);
        assert_eq!(sink.batches.lock().expect("sink lock").len(), 1);
    }

    #[tokio::test]
    async fn empty_normalization_is_a_warning_not_a_failure() {
        let dir = tempdir().expect("tempdir");
        let config = test_config(&dir);
        let http = HttpFetcher::new(Default::default()).expect("fetcher");
        let sink = CollectingSink::new();
        let alerter = CollectingAlerter::new();
        let pipeline = Pipeline {
            config: &config,
            http: &http,
            remote: &sink,
            alerter: &alerter,
        };

        let adapter = api_fixture(&[]);
        let summary = pipeline.run(&adapter).await.expect("run");
        assert_eq!(summary.normalized_rows, 0);
        assert!(summary.outcome.is_none());
        assert!(!summary.synced);
        assert!(sink.batches.lock().expect("sink lock").is_empty());
    }

    #[tokio::test]
    async fn scrape_parse_failure_raises_an_alert_and_aborts() {
        let dir = tempdir().expect("tempdir");
        let config = test_config(&dir);
        let http = HttpFetcher::new(Default::default()).expect("fetcher");
        let sink = CollectingSink::new();
        let alerter = CollectingAlerter::new();
        let pipeline = Pipeline {
            config: &config,
            http: &http,
            remote: &sink,
            alerter: &alerter,
        };

        let adapter = FixtureAdapter {
            kind: SourceKind::Scrape,
            raw: Err("timestamp marker not found".to_string()),
            inner: ApiAdapter::new("https://rates.example/latest", "EUR"),
        };
        let err = pipeline.run(&adapter).await.expect_err("must abort");
        assert!(err.to_string().contains("scraper pipeline fetch stage"));

        let subjects = alerter.subjects.lock().expect("alerter lock");
        assert_eq!(subjects.len(), 1);
        assert!(subjects[0].contains("[Scrape]"));
    }

    #[tokio::test]
    async fn sync_failure_alerts_and_is_swallowed() {
        let dir = tempdir().expect("tempdir");
        let config = test_config(&dir);
        let http = HttpFetcher::new(Default::default()).expect("fetcher");
        let sink = FailingSink;
        let alerter = CollectingAlerter::new();
        let pipeline = Pipeline {
            config: &config,
            http: &http,
            remote: &sink,
            alerter: &alerter,
        };

        let adapter = api_fixture(&[("USD", 1.05)]);
        let summary = pipeline.run(&adapter).await.expect("run succeeds locally");

        // Local write is durable even though sync failed.
        assert_eq!(summary.outcome.expect("outcome").inserted(), 1);
        assert!(!summary.synced);

        let subjects = alerter.subjects.lock().expect("alerter lock");
        assert_eq!(subjects.len(), 1);
        assert!(subjects[0].contains("[Sync]"));
    }
}
