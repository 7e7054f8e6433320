//! Source adapter contracts and per-source normalization rules.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use fxetl_core::{CanonicalRate, SourceKind};
use fxetl_storage::{FetchError, HttpFetcher};
use scraper::{Html, Selector};
use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("transport failure: {0}")]
    Transport(#[from] FetchError),
    #[error("reading {}: {source}", .path.display())]
    File {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("source file not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl AdapterError {
    /// Malformed-input failures from the scrape pipeline escalate to
    /// operator alerting; the orchestrator uses this to tell them apart.
    pub fn is_malformed(&self) -> bool {
        matches!(self, AdapterError::Malformed(_))
    }
}

/// Source-native payload, one variant per adapter.
#[derive(Debug, Clone, PartialEq)]
pub enum RawRecord {
    Api(ApiSnapshot),
    History(Vec<HistoryRow>),
    Scrape(ScrapedPage),
}

/// Rates-by-base JSON response: one as-of date, one rate per currency code.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ApiSnapshot {
    pub base: String,
    pub date: String,
    pub rates: BTreeMap<String, f64>,
}

/// One line of the historical CSV. Fields are optional so a hole in the
/// file surfaces as a dropped row, not a failed load.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct HistoryRow {
    pub currency: Option<String>,
    pub base_currency: Option<String>,
    pub currency_name: Option<String>,
    pub exchange_rate: Option<f64>,
    pub date: Option<String>,
}

/// Rates table lifted off the live page, plus the page-level timestamp
/// marker shared by every row.
#[derive(Debug, Clone, PartialEq)]
pub struct ScrapedPage {
    /// e.g. "Apr 12, 2025 18:28 UTC"
    pub timestamp_text: String,
    pub rows: Vec<ScrapedRow>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScrapedRow {
    pub currency_name: String,
    pub exchange_rate: f64,
}

/// One fetch attempt per invocation, no internal retries. Normalization is
/// pure and returns an empty batch (not an error) when every row drops out.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn kind(&self) -> SourceKind;

    async fn fetch(&self, http: &HttpFetcher) -> Result<RawRecord, AdapterError>;

    fn normalize(&self, raw: &RawRecord) -> Result<Vec<CanonicalRate>, AdapterError>;
}

/// The upstream publishes once a day at 16:00 Central European wall-clock
/// time. Rates carry no intra-day instant of their own, so every row of a
/// given date is stamped with that publish instant converted to UTC.
pub fn publish_instant_utc(date: NaiveDate) -> DateTime<Utc> {
    let publish_time = NaiveTime::from_hms_opt(16, 0, 0).expect("valid publish time");
    let local = date.and_time(publish_time);
    let offset = central_europe_offset_on(date);
    offset
        .from_local_datetime(&local)
        .single()
        .expect("fixed offset is unambiguous")
        .with_timezone(&Utc)
}

/// Offset in force in Central Europe on the given date: CEST (+02:00) from
/// the last Sunday of March up to, not including, the last Sunday of
/// October, CET (+01:00) otherwise. Transitions happen in the early
/// morning, so this is exact for the afternoon publish hour.
pub fn central_europe_offset_on(date: NaiveDate) -> FixedOffset {
    let dst_start = last_sunday(date.year(), 3);
    let dst_end = last_sunday(date.year(), 10);
    let seconds = if date >= dst_start && date < dst_end {
        2 * 3600
    } else {
        3600
    };
    FixedOffset::east_opt(seconds).expect("valid offset")
}

fn last_sunday(year: i32, month: u32) -> NaiveDate {
    let first_of_next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)
    }
    .expect("valid month start");
    let last_day = first_of_next.pred_opt().expect("month has a last day");
    last_day - chrono::Days::new(u64::from(last_day.weekday().num_days_from_sunday()))
}

fn parse_iso_date(text: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(text.trim(), "%Y-%m-%d").ok()
}

/// Daily rates endpoint returning JSON keyed by currency code.
#[derive(Debug, Clone)]
pub struct ApiAdapter {
    url: String,
    base_currency: String,
}

impl ApiAdapter {
    pub fn new(url: impl Into<String>, base_currency: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            base_currency: base_currency.into(),
        }
    }
}

#[async_trait]
impl SourceAdapter for ApiAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::Api
    }

    async fn fetch(&self, http: &HttpFetcher) -> Result<RawRecord, AdapterError> {
        let url = format!("{}?base={}", self.url, self.base_currency);
        let body = http.fetch_text(&url).await?;
        let snapshot: ApiSnapshot = serde_json::from_str(&body)
            .map_err(|e| AdapterError::Malformed(format!("rates JSON: {e}")))?;
        info!(rates = snapshot.rates.len(), date = %snapshot.date, "api snapshot fetched");
        Ok(RawRecord::Api(snapshot))
    }

    fn normalize(&self, raw: &RawRecord) -> Result<Vec<CanonicalRate>, AdapterError> {
        let RawRecord::Api(snapshot) = raw else {
            return Err(AdapterError::Malformed("expected API snapshot".to_string()));
        };
        // The as-of date applies to the whole snapshot; if it does not
        // parse, there is nothing usable in the payload.
        let date = parse_iso_date(&snapshot.date).ok_or_else(|| {
            AdapterError::Malformed(format!("unparseable as-of date {:?}", snapshot.date))
        })?;
        let timestamp_utc = publish_instant_utc(date);

        let mut dropped = 0usize;
        let rows: Vec<CanonicalRate> = snapshot
            .rates
            .iter()
            .filter_map(|(code, rate)| {
                if code.trim().is_empty() || !rate.is_finite() || *rate <= 0.0 {
                    dropped += 1;
                    return None;
                }
                Some(CanonicalRate {
                    entity_key: code.trim().to_string(),
                    base_currency: self.base_currency.clone(),
                    currency_name: None,
                    exchange_rate: *rate,
                    date,
                    timestamp_utc,
                })
            })
            .collect();
        if dropped > 0 {
            warn!(dropped, "dropped invalid api rates during normalization");
        }
        Ok(rows)
    }
}

/// Historical rates file already close to canonical shape, but with
/// duplicates, holes and non-positive rates to weed out.
#[derive(Debug, Clone)]
pub struct HistoryCsvAdapter {
    path: PathBuf,
    base_currency: String,
}

impl HistoryCsvAdapter {
    pub fn new(path: impl Into<PathBuf>, base_currency: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            base_currency: base_currency.into(),
        }
    }
}

#[async_trait]
impl SourceAdapter for HistoryCsvAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::History
    }

    async fn fetch(&self, _http: &HttpFetcher) -> Result<RawRecord, AdapterError> {
        if !self.path.exists() {
            return Err(AdapterError::NotFound(self.path.clone()));
        }
        let file = std::fs::File::open(&self.path).map_err(|source| AdapterError::File {
            path: self.path.clone(),
            source,
        })?;
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(file);

        let mut rows = Vec::new();
        let mut unreadable = 0usize;
        for result in reader.deserialize::<HistoryRow>() {
            match result {
                Ok(row) => rows.push(row),
                Err(err) => {
                    unreadable += 1;
                    warn!(error = %err, "skipping unreadable csv line");
                }
            }
        }
        info!(
            path = %self.path.display(),
            loaded = rows.len(),
            unreadable,
            "history csv loaded"
        );
        Ok(RawRecord::History(rows))
    }

    fn normalize(&self, raw: &RawRecord) -> Result<Vec<CanonicalRate>, AdapterError> {
        let RawRecord::History(rows) = raw else {
            return Err(AdapterError::Malformed("expected history rows".to_string()));
        };

        let mut seen: HashSet<(String, Option<String>, Option<String>, u64, String)> =
            HashSet::new();
        let mut dropped = 0usize;
        let mut out = Vec::new();
        for row in rows {
            let (Some(currency), Some(rate), Some(date_text)) =
                (row.currency.as_deref(), row.exchange_rate, row.date.as_deref())
            else {
                dropped += 1;
                continue;
            };
            let dedup_key = (
                currency.to_string(),
                row.base_currency.clone(),
                row.currency_name.clone(),
                rate.to_bits(),
                date_text.to_string(),
            );
            if !seen.insert(dedup_key) {
                dropped += 1;
                continue;
            }
            let Some(date) = parse_iso_date(date_text) else {
                dropped += 1;
                continue;
            };
            if currency.is_empty() || !rate.is_finite() || rate <= 0.0 {
                dropped += 1;
                continue;
            }
            out.push(CanonicalRate {
                entity_key: currency.to_string(),
                base_currency: row
                    .base_currency
                    .clone()
                    .unwrap_or_else(|| self.base_currency.clone()),
                currency_name: row.currency_name.clone(),
                exchange_rate: rate,
                date,
                // Historical dates carry no time of day; the nominal daily
                // publish hour is assigned uniformly, per-date offset aware.
                timestamp_utc: publish_instant_utc(date),
            });
        }
        if dropped > 0 {
            warn!(dropped, kept = out.len(), "history rows dropped during normalization");
        }
        Ok(out)
    }
}

/// Live rates table scrape keyed on currency display names.
#[derive(Debug, Clone)]
pub struct ScrapeAdapter {
    url: String,
    base_currency: String,
}

impl ScrapeAdapter {
    pub fn new(url: impl Into<String>, base_currency: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            base_currency: base_currency.into(),
        }
    }
}

/// Lift the timestamp marker and the rates table out of the page. A missing
/// timestamp marker is malformed markup; a missing table just yields zero
/// rows, matching the empty-input-is-not-an-error contract.
pub fn parse_scraped_page(html: &str) -> Result<ScrapedPage, AdapterError> {
    let document = Html::parse_document(html);

    let timestamp_selector = Selector::parse("span.ratesTimestamp")
        .map_err(|e| AdapterError::Malformed(e.to_string()))?;
    let timestamp_text = document
        .select(&timestamp_selector)
        .next()
        .map(|node| node.text().collect::<String>().trim().to_string())
        .ok_or_else(|| AdapterError::Malformed("timestamp marker not found".to_string()))?;

    let table_selector = Selector::parse("table.tablesorter.ratesTable")
        .map_err(|e| AdapterError::Malformed(e.to_string()))?;
    let row_selector = Selector::parse("tr").map_err(|e| AdapterError::Malformed(e.to_string()))?;
    let cell_selector = Selector::parse("td").map_err(|e| AdapterError::Malformed(e.to_string()))?;

    let mut rows = Vec::new();
    if let Some(table) = document.select(&table_selector).next() {
        // First row is the header.
        for row in table.select(&row_selector).skip(1) {
            let cells: Vec<String> = row
                .select(&cell_selector)
                .map(|cell| cell.text().collect::<String>().trim().to_string())
                .collect();
            if cells.len() < 2 {
                continue;
            }
            let currency_name = cells[0].clone();
            let Ok(exchange_rate) = cells[1].parse::<f64>() else {
                warn!(name = %currency_name, cell = %cells[1], "skipping row with unparseable rate");
                continue;
            };
            rows.push(ScrapedRow {
                currency_name,
                exchange_rate,
            });
        }
    }
    Ok(ScrapedPage {
        timestamp_text,
        rows,
    })
}

fn parse_page_timestamp(text: &str) -> Result<DateTime<Utc>, AdapterError> {
    NaiveDateTime::parse_from_str(text.trim(), "%b %d, %Y %H:%M UTC")
        .map(|naive| naive.and_utc())
        .map_err(|e| AdapterError::Malformed(format!("page timestamp {text:?}: {e}")))
}

#[async_trait]
impl SourceAdapter for ScrapeAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::Scrape
    }

    async fn fetch(&self, http: &HttpFetcher) -> Result<RawRecord, AdapterError> {
        let html = http.fetch_text(&self.url).await?;
        let page = parse_scraped_page(&html)?;
        info!(rows = page.rows.len(), timestamp = %page.timestamp_text, "rates page scraped");
        Ok(RawRecord::Scrape(page))
    }

    fn normalize(&self, raw: &RawRecord) -> Result<Vec<CanonicalRate>, AdapterError> {
        let RawRecord::Scrape(page) = raw else {
            return Err(AdapterError::Malformed("expected scraped page".to_string()));
        };
        // The page prints an explicit UTC instant; no localization needed.
        let timestamp_utc = parse_page_timestamp(&page.timestamp_text)?;
        let date = timestamp_utc.date_naive();

        let mut dropped = 0usize;
        let rows: Vec<CanonicalRate> = page
            .rows
            .iter()
            .filter_map(|row| {
                if row.currency_name.is_empty()
                    || !row.exchange_rate.is_finite()
                    || row.exchange_rate <= 0.0
                {
                    dropped += 1;
                    return None;
                }
                Some(CanonicalRate {
                    entity_key: row.currency_name.clone(),
                    base_currency: self.base_currency.clone(),
                    currency_name: None,
                    exchange_rate: row.exchange_rate,
                    date,
                    timestamp_utc,
                })
            })
            .collect();
        if dropped > 0 {
            warn!(dropped, "dropped invalid scraped rates during normalization");
        }
        Ok(rows)
    }
}
