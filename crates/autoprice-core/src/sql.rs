//! Statements issued against the query engine.
//!
//! Every identifier and literal is escaped on the way out; table names and
//! dates are the only values ever interpolated.

use crate::{IngestDate, StorageLocation, PARTITION_COLUMN};

/// Double-quoted identifier with embedded quotes doubled.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Single-quoted string literal with embedded quotes doubled.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn date_literal(day: IngestDate) -> String {
    format!("DATE {}", quote_literal(&day.to_string()))
}

#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    /// Defines the partitioned summary table and fills its first partition.
    CreateSummaryAs {
        summary: String,
        source: String,
        location: StorageLocation,
        day: IngestDate,
    },
    DropPartition {
        summary: String,
        day: IngestDate,
    },
    InsertSnapshot {
        summary: String,
        source: String,
        day: IngestDate,
    },
    /// `prev_day`: latest partition strictly before `before`, NULL when none.
    PreviousPartition {
        summary: String,
        before: IngestDate,
    },
    ComparePartitions {
        summary: String,
        today: IngestDate,
        previous: IngestDate,
    },
}

impl Statement {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CreateSummaryAs { .. } => "create_summary_as",
            Self::DropPartition { .. } => "drop_partition",
            Self::InsertSnapshot { .. } => "insert_snapshot",
            Self::PreviousPartition { .. } => "previous_partition",
            Self::ComparePartitions { .. } => "compare_partitions",
        }
    }

    pub fn to_sql(&self) -> String {
        match self {
            Self::CreateSummaryAs {
                summary,
                source,
                location,
                day,
            } => format!(
                "CREATE TABLE {table}\n\
                 WITH (\n  \
                   format = 'PARQUET',\n  \
                   external_location = {location},\n  \
                   partitioned_by = ARRAY[{partition}]\n\
                 ) AS\n{select}",
                table = quote_ident(summary),
                location = quote_literal(&location.uri()),
                partition = quote_literal(PARTITION_COLUMN),
                select = snapshot_select(source, *day),
            ),
            Self::DropPartition { summary, day } => format!(
                "ALTER TABLE {} DROP PARTITION ({PARTITION_COLUMN} = {})",
                quote_ident(summary),
                date_literal(*day),
            ),
            Self::InsertSnapshot {
                summary,
                source,
                day,
            } => format!(
                "INSERT INTO {}\n{}",
                quote_ident(summary),
                snapshot_select(source, *day)
            ),
            Self::PreviousPartition { summary, before } => format!(
                "SELECT MAX({PARTITION_COLUMN}) AS prev_day\n\
                 FROM {}\n\
                 WHERE {PARTITION_COLUMN} < {}",
                quote_ident(summary),
                date_literal(*before),
            ),
            Self::ComparePartitions {
                summary,
                today,
                previous,
            } => {
                let table = quote_ident(summary);
                format!(
                    "WITH cur AS (\n  \
                       SELECT make, country, avg_price FROM {table} WHERE {PARTITION_COLUMN} = {today}\n\
                     ), prev AS (\n  \
                       SELECT make, country, avg_price AS prev_avg_price FROM {table} WHERE {PARTITION_COLUMN} = {previous}\n\
                     )\n\
                     SELECT\n  \
                       COALESCE(cur.make, prev.make) AS make,\n  \
                       COALESCE(cur.country, prev.country) AS country,\n  \
                       cur.avg_price,\n  \
                       prev.prev_avg_price,\n  \
                       CASE\n    \
                         WHEN prev.prev_avg_price IS NULL OR prev.prev_avg_price = 0 THEN NULL\n    \
                         ELSE ROUND((cur.avg_price - prev.prev_avg_price) / prev.prev_avg_price * 100, 2)\n  \
                       END AS pct_change\n\
                     FROM cur\n\
                     FULL OUTER JOIN prev\n  \
                       ON cur.make = prev.make AND cur.country = prev.country",
                    today = date_literal(*today),
                    previous = date_literal(*previous),
                )
            }
        }
    }
}

fn snapshot_select(source: &str, day: IngestDate) -> String {
    format!(
        "SELECT\n  \
           make,\n  \
           country,\n  \
           CAST(AVG(price) AS DOUBLE) AS avg_price,\n  \
           {date} AS {PARTITION_COLUMN}\n\
         FROM {source}\n\
         GROUP BY make, country",
        date = date_literal(day),
        source = quote_ident(source),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(s: &str) -> IngestDate {
        s.parse().unwrap()
    }

    #[test]
    fn quoting_doubles_embedded_delimiters() {
        assert_eq!(quote_ident("autoprice_summary"), "\"autoprice_summary\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(quote_literal("O'Brien"), "'O''Brien'");
    }

    #[test]
    fn ctas_carries_location_partitioning_and_snapshot_select() {
        let stmt = Statement::CreateSummaryAs {
            summary: "autoprice_summary".into(),
            source: "autoprice_upload".into(),
            location: StorageLocation::parse("s3://curated-bucket/summary").unwrap(),
            day: day("2026-10-17"),
        };
        let sql = stmt.to_sql();
        assert!(sql.starts_with("CREATE TABLE \"autoprice_summary\""));
        assert!(sql.contains("external_location = 's3://curated-bucket/summary/'"));
        assert!(sql.contains("partitioned_by = ARRAY['ingest_date']"));
        assert!(sql.contains("DATE '2026-10-17' AS ingest_date"));
        assert!(sql.contains("FROM \"autoprice_upload\""));
        assert!(sql.contains("GROUP BY make, country"));
    }

    #[test]
    fn drop_partition_targets_a_single_date() {
        let stmt = Statement::DropPartition {
            summary: "autoprice_summary".into(),
            day: day("2026-10-17"),
        };
        assert_eq!(
            stmt.to_sql(),
            "ALTER TABLE \"autoprice_summary\" DROP PARTITION (ingest_date = DATE '2026-10-17')"
        );
        assert_eq!(stmt.kind(), "drop_partition");
    }

    #[test]
    fn compare_statement_nulls_pct_change_for_missing_or_zero_previous() {
        let sql = Statement::ComparePartitions {
            summary: "autoprice_summary".into(),
            today: day("2026-10-17"),
            previous: day("2026-10-15"),
        }
        .to_sql();
        assert!(sql.contains("ingest_date = DATE '2026-10-17'"));
        assert!(sql.contains("ingest_date = DATE '2026-10-15'"));
        assert!(sql.contains("prev.prev_avg_price IS NULL OR prev.prev_avg_price = 0 THEN NULL"));
        assert!(sql.contains("FULL OUTER JOIN prev"));
    }

    #[test]
    fn table_names_cannot_break_out_of_identifiers() {
        let sql = Statement::InsertSnapshot {
            summary: "s\"; DROP TABLE x; --".into(),
            source: "src".into(),
            day: day("2026-10-17"),
        }
        .to_sql();
        assert!(sql.starts_with("INSERT INTO \"s\"\"; DROP TABLE x; --\"\n"));
    }
}
