//! Day-over-day change detection against the latest earlier partition.

use std::sync::Arc;

use autoprice_core::{ComparisonRow, DateError, IngestDate, Statement};
use autoprice_storage::{QueryError, QueryGateway};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum DetectError {
    #[error(transparent)]
    Query(#[from] QueryError),
    #[error("previous partition lookup returned {0}")]
    BadDate(#[from] DateError),
}

pub struct ChangeDetector {
    gateway: Arc<QueryGateway>,
    summary: String,
}

impl ChangeDetector {
    pub fn new(gateway: Arc<QueryGateway>, summary: impl Into<String>) -> Self {
        Self {
            gateway,
            summary: summary.into(),
        }
    }

    /// Latest partition strictly before `today`, if any.
    pub async fn find_previous_partition(&self, today: IngestDate) -> Result<Option<IngestDate>, DetectError> {
        let result = self
            .gateway
            .query(&Statement::PreviousPartition {
                summary: self.summary.clone(),
                before: today,
            })
            .await?;
        match result.value(0, "prev_day") {
            Some(raw) => Ok(Some(raw.parse()?)),
            None => Ok(None),
        }
    }

    pub async fn compare(&self, today: IngestDate, previous: IngestDate) -> Result<Vec<ComparisonRow>, DetectError> {
        let result = self
            .gateway
            .query(&Statement::ComparePartitions {
                summary: self.summary.clone(),
                today,
                previous,
            })
            .await?;

        let rows: Vec<ComparisonRow> = (0..result.rows.len())
            .map(|i| ComparisonRow {
                make: result.value(i, "make").unwrap_or_default().to_string(),
                country: result.value(i, "country").unwrap_or_default().to_string(),
                avg_price_today: number(result.value(i, "avg_price")),
                avg_price_prev: number(result.value(i, "prev_avg_price")),
                pct_change: number(result.value(i, "pct_change")),
            })
            .collect();
        debug!(%today, %previous, rows = rows.len(), "partitions compared");
        Ok(rows)
    }
}

fn number(raw: Option<&str>) -> Option<f64> {
    raw?.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Replaces control characters and the `|` column separator.
fn sanitize(value: &str) -> String {
    value
        .chars()
        .map(|c| match c {
            '|' => '/',
            c if c.is_control() => ' ',
            c => c,
        })
        .collect()
}

fn price(value: Option<f64>) -> String {
    value.map_or_else(|| "null".to_string(), |v| format!("{v:.2}"))
}

/// Alert lines for rows whose defined `pct_change` is at least `threshold_pct` in magnitude.
pub fn select_alerts(rows: &[ComparisonRow], threshold_pct: f64) -> Vec<String> {
    rows.iter()
        .filter_map(|row| {
            let pct = row.pct_change?;
            (pct.abs() >= threshold_pct).then(|| {
                format!(
                    "{} | {} | today={} | prev={} | Δ%={pct:.2}",
                    sanitize(&row.make),
                    sanitize(&row.country),
                    price(row.avg_price_today),
                    price(row.avg_price_prev),
                )
            })
        })
        .collect()
}

pub fn alert_subject(day: IngestDate, threshold_pct: f64, affected: usize) -> String {
    format!("[AutoPrice Trend] {day} change >= {threshold_pct}% ({affected} affected)")
}

pub fn alert_body(lines: &[String]) -> String {
    format!("Significant price change:\n{}", lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use autoprice_adapters::LocalWarehouse;
    use autoprice_core::{SummaryRow, TableRef};
    use autoprice_storage::{CatalogEnsurer, PollPolicy, QueryContext};

    use super::*;
    use crate::lifecycle::PartitionLifecycle;

    fn row(make: &str, country: &str, pct: Option<f64>) -> ComparisonRow {
        ComparisonRow {
            make: make.to_string(),
            country: country.to_string(),
            avg_price_today: Some(110.0),
            avg_price_prev: Some(100.0),
            pct_change: pct,
        }
    }

    fn day(d: u32) -> IngestDate {
        IngestDate::from_ymd(2025, 3, d).unwrap()
    }

    #[test]
    fn threshold_is_inclusive_on_magnitude() {
        let rows = vec![
            row("A", "US", Some(9.99)),
            row("B", "US", Some(-10.01)),
            row("C", "US", Some(10.0)),
            row("D", "US", None),
        ];
        let alerts = select_alerts(&rows, 10.0);
        assert_eq!(alerts.len(), 2);
        assert!(alerts[0].starts_with("B | US |"));
        assert!(alerts[0].ends_with("Δ%=-10.01"));
        assert!(alerts[1].starts_with("C | US |"));
    }

    #[test]
    fn alert_lines_cannot_forge_columns_or_lines() {
        let alerts = select_alerts(&[row("Evil | X\nFAKE", "US\r", Some(50.0))], 10.0);
        assert_eq!(
            alerts,
            vec!["Evil / X FAKE | US  | today=110.00 | prev=100.00 | Δ%=50.00".to_string()]
        );
    }

    #[test]
    fn subject_and_body_follow_the_alert_format() {
        assert_eq!(
            alert_subject(day(2), 10.0, 3),
            "[AutoPrice Trend] 2025-03-02 change >= 10% (3 affected)"
        );
        assert_eq!(
            alert_body(&["a".to_string(), "b".to_string()]),
            "Significant price change:\na\nb"
        );
    }

    #[test]
    fn non_numeric_cells_become_undefined() {
        assert_eq!(number(Some("25.0")), Some(25.0));
        assert_eq!(number(Some("NaN")), None);
        assert_eq!(number(Some("n/a")), None);
        assert_eq!(number(None), None);
    }

    async fn detector_with(days: &[(u32, f64)]) -> ChangeDetector {
        let warehouse = LocalWarehouse::new();
        let ns = "autoprice_db";
        let gateway = Arc::new(QueryGateway::new(
            warehouse.clone(),
            QueryContext {
                namespace: ns.to_string(),
                workgroup: None,
                output_location: "s3://results-bucket/".to_string(),
            },
            PollPolicy {
                interval: Duration::from_millis(1),
                timeout: Some(Duration::from_secs(5)),
            },
        ));
        let lifecycle = PartitionLifecycle::new(
            gateway.clone(),
            Arc::new(CatalogEnsurer::new(warehouse.clone(), Duration::from_millis(1))),
            warehouse.clone(),
            TableRef::new(ns, "autoprice_upload"),
            TableRef::new(ns, "autoprice_summary"),
            Some("s3://curated-bucket/summary/".to_string()),
        );
        warehouse.register_source(ns, "autoprice_upload", Vec::new()).await;
        for (d, price) in days {
            warehouse
                .replace_source_records(
                    ns,
                    "autoprice_upload",
                    vec![autoprice_core::SourceRecord {
                        make: "A".to_string(),
                        country: "US".to_string(),
                        price: *price,
                    }],
                )
                .await;
            lifecycle.ensure_summary_table(day(*d)).await.unwrap();
            lifecycle.drop_and_purge_partition(day(*d)).await;
            lifecycle.insert_snapshot(day(*d)).await.unwrap();
        }
        ChangeDetector::new(gateway, "autoprice_summary")
    }

    #[tokio::test]
    async fn previous_partition_is_the_latest_strictly_earlier_day() {
        let detector = detector_with(&[(1, 70.0), (3, 80.0), (5, 100.0)]).await;
        assert_eq!(detector.find_previous_partition(day(5)).await.unwrap(), Some(day(3)));
        assert_eq!(detector.find_previous_partition(day(4)).await.unwrap(), Some(day(3)));
        assert_eq!(detector.find_previous_partition(day(1)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn comparison_reports_percent_change() {
        let detector = detector_with(&[(1, 80.0), (2, 100.0)]).await;
        let rows = detector.compare(day(2), day(1)).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].avg_price_today, Some(100.0));
        assert_eq!(rows[0].avg_price_prev, Some(80.0));
        assert_eq!(rows[0].pct_change, Some(25.0));
    }

    #[tokio::test]
    async fn zero_previous_price_leaves_change_undefined() {
        let detector = detector_with(&[(1, 0.0), (2, 100.0)]).await;
        let rows = detector.compare(day(2), day(1)).await.unwrap();
        assert_eq!(rows[0].pct_change, None);
        assert!(select_alerts(&rows, 10.0).is_empty());
    }

    #[test]
    fn summary_rows_compare_like_the_statement() {
        let today = [SummaryRow {
            make: "A".into(),
            country: "US".into(),
            avg_price: 100.0,
            ingest_date: day(2),
        }];
        let rows = autoprice_core::compare_partitions(&today, &[]);
        assert_eq!(rows[0].avg_price_prev, None);
        assert!(select_alerts(&rows, 0.0).is_empty());
    }
}
