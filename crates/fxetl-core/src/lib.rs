//! Core domain model for the forex batch ETL.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// The three ingest pipelines. Each writes to its own logical table and
/// carries its own normalization rule; they never share rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourceKind {
    Api,
    History,
    Scrape,
}

impl SourceKind {
    /// Tag attached to records pushed to the remote store.
    pub fn source_tag(&self) -> &'static str {
        match self {
            SourceKind::Api => "api",
            SourceKind::History => "csv",
            SourceKind::Scrape => "scraper",
        }
    }

    pub fn table_spec(&self) -> TableSpec {
        match self {
            SourceKind::Api => TableSpec {
                name: "rates_api",
                entity_column: "currency",
                has_currency_name: false,
            },
            SourceKind::History => TableSpec {
                name: "rates_history",
                entity_column: "currency",
                has_currency_name: true,
            },
            // The scrape source only exposes display names, so the display
            // name *is* the entity key. It lives in a separate table and is
            // never merged with the ISO-code keyed tables.
            SourceKind::Scrape => TableSpec {
                name: "rates_scraped",
                entity_column: "currency_name",
                has_currency_name: false,
            },
        }
    }
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.source_tag())
    }
}

/// Shape of one local table: its name, which column holds the entity key,
/// and whether it carries the optional display-name column.
///
/// `(entity_column, timestamp_utc)` is the uniqueness constraint on every
/// table; repeated ingest runs over the same window insert nothing new.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableSpec {
    pub name: &'static str,
    pub entity_column: &'static str,
    pub has_currency_name: bool,
}

/// One normalized rate, produced fresh on every pipeline run and immutable
/// after construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRate {
    /// Currency code for the API/history pipelines, display name for the
    /// scrape pipeline.
    pub entity_key: String,
    pub base_currency: String,
    /// Display name, persisted only by the history table.
    pub currency_name: Option<String>,
    pub exchange_rate: f64,
    /// Calendar date the rate applies to.
    pub date: NaiveDate,
    /// The instant the rate is considered valid, already converted to UTC
    /// by the source-specific normalization rule.
    pub timestamp_utc: DateTime<Utc>,
}

impl CanonicalRate {
    /// Row-level validity the writer re-checks before binding: normalization
    /// already drops bad rows, but the writer must absorb a malformed row
    /// without aborting the rest of its batch.
    pub fn is_insertable(&self) -> bool {
        !self.entity_key.trim().is_empty()
            && !self.base_currency.trim().is_empty()
            && self.exchange_rate.is_finite()
            && self.exchange_rate > 0.0
    }
}

/// A row read back from local storage: the canonical fields plus the
/// server-side insertion time used by the trailing-window sync query.
/// The surrogate id never leaves the local store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRate {
    pub rate: CanonicalRate,
    pub created_at: DateTime<Utc>,
}

/// Outcome of one idempotent write, tagged with the insertion path taken.
///
/// `inserted` always reflects rows the storage engine actually persisted
/// (its change counter), never an assumed batch size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InsertOutcome {
    /// The single bulk insert-or-ignore statement succeeded.
    BulkSucceeded { inserted: u64, skipped: u64 },
    /// The bulk statement failed and rows were replayed one at a time.
    FallbackUsed { inserted: u64, skipped: u64 },
}

impl InsertOutcome {
    pub fn inserted(&self) -> u64 {
        match self {
            InsertOutcome::BulkSucceeded { inserted, .. }
            | InsertOutcome::FallbackUsed { inserted, .. } => *inserted,
        }
    }

    pub fn skipped(&self) -> u64 {
        match self {
            InsertOutcome::BulkSucceeded { skipped, .. }
            | InsertOutcome::FallbackUsed { skipped, .. } => *skipped,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn rate(key: &str, value: f64) -> CanonicalRate {
        CanonicalRate {
            entity_key: key.to_string(),
            base_currency: "EUR".to_string(),
            currency_name: None,
            exchange_rate: value,
            date: NaiveDate::from_ymd_opt(2025, 4, 12).unwrap(),
            timestamp_utc: Utc.with_ymd_and_hms(2025, 4, 12, 14, 0, 0).unwrap(),
        }
    }

    #[test]
    fn table_specs_key_on_distinct_entity_columns() {
        assert_eq!(SourceKind::Api.table_spec().entity_column, "currency");
        assert_eq!(SourceKind::Scrape.table_spec().entity_column, "currency_name");
        assert!(SourceKind::History.table_spec().has_currency_name);
        assert_ne!(
            SourceKind::Api.table_spec().name,
            SourceKind::Scrape.table_spec().name
        );
    }

    #[test]
    fn insertable_rejects_empty_key_and_nonpositive_rate() {
        assert!(rate("USD", 1.05).is_insertable());
        assert!(!rate("", 1.05).is_insertable());
        assert!(!rate("GBP", -0.5).is_insertable());
        assert!(!rate("GBP", 0.0).is_insertable());
        assert!(!rate("GBP", f64::NAN).is_insertable());
    }

    #[test]
    fn outcome_accessors_cover_both_paths() {
        let bulk = InsertOutcome::BulkSucceeded { inserted: 3, skipped: 1 };
        let fallback = InsertOutcome::FallbackUsed { inserted: 2, skipped: 2 };
        assert_eq!(bulk.inserted(), 3);
        assert_eq!(bulk.skipped(), 1);
        assert_eq!(fallback.inserted(), 2);
        assert_eq!(fallback.skipped(), 2);
    }
}
