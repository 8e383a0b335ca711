//! Core domain model for the AutoPrice daily summary.

mod sql;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

pub use sql::{quote_ident, quote_literal, Statement};

pub const CRATE_NAME: &str = "autoprice-core";

/// Column the summary table is partitioned by.
pub const PARTITION_COLUMN: &str = "ingest_date";

const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid ingest date {0:?}, expected YYYY-MM-DD")]
pub struct DateError(pub String);

/// Partition key of the summary table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IngestDate(NaiveDate);

impl IngestDate {
    pub fn new(date: NaiveDate) -> Self {
        Self(date)
    }

    pub fn from_ymd(year: i32, month: u32, day: u32) -> Option<Self> {
        NaiveDate::from_ymd_opt(year, month, day).map(Self)
    }

    pub fn today() -> Self {
        Self(Utc::now().date_naive())
    }

    pub fn as_naive(&self) -> NaiveDate {
        self.0
    }
}

impl fmt::Display for IngestDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format(DATE_FORMAT))
    }
}

impl FromStr for IngestDate {
    type Err = DateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NaiveDate::parse_from_str(s.trim(), DATE_FORMAT)
            .map(Self)
            .map_err(|_| DateError(s.to_string()))
    }
}

impl Serialize for IngestDate {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for IngestDate {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// One row of the append-only raw dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub make: String,
    pub country: String,
    pub price: f64,
}

/// One `(make, country)` group of a dated summary partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryRow {
    pub make: String,
    pub country: String,
    pub avg_price: f64,
    pub ingest_date: IngestDate,
}

/// Day-over-day comparison of one group. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonRow {
    pub make: String,
    pub country: String,
    pub avg_price_today: Option<f64>,
    pub avg_price_prev: Option<f64>,
    pub pct_change: Option<f64>,
}

/// Mean price per `(make, country)` group, ordered by group key.
pub fn summarize(records: &[SourceRecord], day: IngestDate) -> Vec<SummaryRow> {
    let mut groups: BTreeMap<(&str, &str), (f64, usize)> = BTreeMap::new();
    for record in records {
        let entry = groups
            .entry((record.make.as_str(), record.country.as_str()))
            .or_default();
        entry.0 += record.price;
        entry.1 += 1;
    }

    groups
        .into_iter()
        .map(|((make, country), (sum, count))| SummaryRow {
            make: make.to_string(),
            country: country.to_string(),
            avg_price: sum / count as f64,
            ingest_date: day,
        })
        .collect()
}

/// Percent change rounded to two decimals; undefined without a non-zero previous value.
pub fn pct_change(today: Option<f64>, prev: Option<f64>) -> Option<f64> {
    match (today, prev) {
        (Some(today), Some(prev)) if prev != 0.0 => {
            let raw = (today - prev) / prev * 100.0;
            Some((raw * 100.0).round() / 100.0)
        }
        _ => None,
    }
}

/// Full outer join of two partitions on `(make, country)`.
pub fn compare_partitions(today: &[SummaryRow], prev: &[SummaryRow]) -> Vec<ComparisonRow> {
    let mut joined: BTreeMap<(&str, &str), (Option<f64>, Option<f64>)> = BTreeMap::new();
    for row in today {
        joined
            .entry((row.make.as_str(), row.country.as_str()))
            .or_default()
            .0 = Some(row.avg_price);
    }
    for row in prev {
        joined
            .entry((row.make.as_str(), row.country.as_str()))
            .or_default()
            .1 = Some(row.avg_price);
    }

    joined
        .into_iter()
        .map(|((make, country), (today, prev))| ComparisonRow {
            make: make.to_string(),
            country: country.to_string(),
            avg_price_today: today,
            avg_price_prev: prev,
            pct_change: pct_change(today, prev),
        })
        .collect()
}

/// Lifecycle state of a submitted statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueryState {
    Submitted,
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl QueryState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Submitted => "SUBMITTED",
            Self::Queued => "QUEUED",
            Self::Running => "RUNNING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for QueryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown query state {0:?}")]
pub struct UnknownQueryState(pub String);

impl FromStr for QueryState {
    type Err = UnknownQueryState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "SUBMITTED" => Ok(Self::Submitted),
            "QUEUED" => Ok(Self::Queued),
            "RUNNING" => Ok(Self::Running),
            "SUCCEEDED" => Ok(Self::Succeeded),
            "FAILED" => Ok(Self::Failed),
            "CANCELLED" => Ok(Self::Cancelled),
            _ => Err(UnknownQueryState(s.to_string())),
        }
    }
}

/// Engine-assigned identifier of a submitted statement.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueryHandle(String);

impl QueryHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableRef {
    pub namespace: String,
    pub name: String,
}

impl TableRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.namespace, self.name)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LocationError {
    #[error("storage location {0:?} must be an s3:// URI")]
    MissingScheme(String),
    #[error("storage location {0:?} has no bucket")]
    EmptyBucket(String),
    #[error("storage location {0:?} has an invalid bucket name")]
    InvalidBucket(String),
}

/// Object-store location backing the summary table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageLocation {
    pub bucket: String,
    pub prefix: String,
}

impl StorageLocation {
    /// Splits `s3://bucket/prefix` into bucket and raw prefix; the bucket only has to be non-empty.
    pub fn split_uri(uri: &str) -> Result<(&str, &str), LocationError> {
        let Some(rest) = uri.trim().strip_prefix("s3://") else {
            return Err(LocationError::MissingScheme(uri.to_string()));
        };
        let (bucket, prefix) = rest.split_once('/').unwrap_or((rest, ""));
        if bucket.is_empty() {
            return Err(LocationError::EmptyBucket(uri.to_string()));
        }
        Ok((bucket, prefix))
    }

    /// Parses a location the pipeline writes to, so the bucket must also be a valid bucket name.
    pub fn parse(uri: &str) -> Result<Self, LocationError> {
        let (bucket, prefix) = Self::split_uri(uri)?;
        let bucket_ok = (3..=63).contains(&bucket.len())
            && bucket
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.');
        if !bucket_ok {
            return Err(LocationError::InvalidBucket(uri.to_string()));
        }

        Ok(Self {
            bucket: bucket.to_string(),
            prefix: prefix.trim_matches('/').to_string(),
        })
    }

    /// `s3://bucket/prefix/`, always with a trailing slash.
    pub fn uri(&self) -> String {
        if self.prefix.is_empty() {
            format!("s3://{}/", self.bucket)
        } else {
            format!("s3://{}/{}/", self.bucket, self.prefix)
        }
    }

    /// Key prefix holding the physical objects of one partition.
    pub fn partition_prefix(&self, day: IngestDate) -> String {
        if self.prefix.is_empty() {
            format!("{PARTITION_COLUMN}={day}/")
        } else {
            format!("{}/{PARTITION_COLUMN}={day}/", self.prefix)
        }
    }
}

impl fmt::Display for StorageLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.uri())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(s: &str) -> IngestDate {
        s.parse().expect("date")
    }

    fn row(make: &str, country: &str, avg_price: f64, d: &str) -> SummaryRow {
        SummaryRow {
            make: make.into(),
            country: country.into(),
            avg_price,
            ingest_date: day(d),
        }
    }

    #[test]
    fn ingest_date_round_trips_through_text_and_json() {
        let d = day("2026-10-17");
        assert_eq!(d.to_string(), "2026-10-17");
        assert_eq!(serde_json::to_string(&d).unwrap(), "\"2026-10-17\"");
        assert!("17/10/2026".parse::<IngestDate>().is_err());
        assert!(day("2026-10-16") < d);
    }

    #[test]
    fn summarize_groups_by_make_and_country() {
        let records = vec![
            SourceRecord { make: "Toyota".into(), country: "JP".into(), price: 100.0 },
            SourceRecord { make: "Toyota".into(), country: "JP".into(), price: 200.0 },
            SourceRecord { make: "Ford".into(), country: "US".into(), price: 50.0 },
            SourceRecord { make: "Toyota".into(), country: "US".into(), price: 80.0 },
        ];
        let rows = summarize(&records, day("2026-10-17"));
        assert_eq!(
            rows,
            vec![
                row("Ford", "US", 50.0, "2026-10-17"),
                row("Toyota", "JP", 150.0, "2026-10-17"),
                row("Toyota", "US", 80.0, "2026-10-17"),
            ]
        );
    }

    #[test]
    fn pct_change_is_undefined_without_nonzero_previous() {
        assert_eq!(pct_change(Some(100.0), Some(80.0)), Some(25.0));
        assert_eq!(pct_change(Some(90.0), Some(100.0)), Some(-10.0));
        assert_eq!(pct_change(Some(1.0), Some(3.0)), Some(-66.67));
        assert_eq!(pct_change(Some(100.0), Some(0.0)), None);
        assert_eq!(pct_change(Some(100.0), None), None);
        assert_eq!(pct_change(None, Some(100.0)), None);
    }

    #[test]
    fn compare_partitions_is_a_full_outer_join() {
        let today = vec![
            row("A", "US", 100.0, "2026-10-17"),
            row("B", "DE", 10.0, "2026-10-17"),
        ];
        let prev = vec![
            row("A", "US", 80.0, "2026-10-16"),
            row("C", "FR", 5.0, "2026-10-16"),
        ];
        let rows = compare_partitions(&today, &prev);
        assert_eq!(rows.len(), 3);

        assert_eq!(rows[0].make, "A");
        assert_eq!(rows[0].pct_change, Some(25.0));

        assert_eq!(rows[1].make, "B");
        assert_eq!(rows[1].avg_price_today, Some(10.0));
        assert_eq!(rows[1].avg_price_prev, None);
        assert_eq!(rows[1].pct_change, None);

        assert_eq!(rows[2].make, "C");
        assert_eq!(rows[2].avg_price_today, None);
        assert_eq!(rows[2].avg_price_prev, Some(5.0));
        assert_eq!(rows[2].pct_change, None);
    }

    #[test]
    fn storage_location_parsing_and_partition_prefix() {
        let loc = StorageLocation::parse("s3://autoprice-curated/summary").unwrap();
        assert_eq!(loc.uri(), "s3://autoprice-curated/summary/");
        assert_eq!(
            loc.partition_prefix(day("2026-10-17")),
            "summary/ingest_date=2026-10-17/"
        );

        let root = StorageLocation::parse("s3://autoprice-curated/").unwrap();
        assert_eq!(root.uri(), "s3://autoprice-curated/");
        assert_eq!(root.partition_prefix(day("2026-10-17")), "ingest_date=2026-10-17/");

        assert!(matches!(
            StorageLocation::parse("/tmp/summary"),
            Err(LocationError::MissingScheme(_))
        ));
        assert!(matches!(
            StorageLocation::parse("s3:///summary"),
            Err(LocationError::EmptyBucket(_))
        ));
        assert!(matches!(
            StorageLocation::parse("s3://Bad Bucket/summary"),
            Err(LocationError::InvalidBucket(_))
        ));
        assert_eq!(
            StorageLocation::split_uri("s3://Bad_Bucket/athena/").unwrap(),
            ("Bad_Bucket", "athena/")
        );
    }

    #[test]
    fn query_state_terminality() {
        assert!(QueryState::Succeeded.is_terminal());
        assert!(QueryState::Cancelled.is_terminal());
        assert!(!QueryState::Running.is_terminal());
        assert!(!QueryState::Submitted.is_terminal());
        assert_eq!("failed".parse::<QueryState>(), Ok(QueryState::Failed));
        assert!("PAUSED".parse::<QueryState>().is_err());
    }
}
