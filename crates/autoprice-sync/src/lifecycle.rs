//! Summary table bootstrap, same-day partition purge and snapshot append.
//!
//! The catalog and the object store are not transactionally linked, so a
//! rerun for the same day drops the partition metadata and then deletes the
//! objects under the partition prefix before appending again.

use std::sync::Arc;

use autoprice_core::{IngestDate, LocationError, Statement, StorageLocation, TableRef};
use autoprice_storage::{
    purge_prefix, CatalogEnsurer, ObjectStore, PurgeStats, QueryError, QueryGateway, ServiceError,
    MAX_DELETE_BATCH,
};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("SUMMARY_S3 must be set to create {table}")]
    MissingLocation { table: String },
    #[error("summary location for {table} is invalid: {source}")]
    InvalidLocation {
        table: String,
        #[source]
        source: LocationError,
    },
    #[error("looking up {table}: {source}")]
    Catalog {
        table: String,
        #[source]
        source: ServiceError,
    },
    #[error(transparent)]
    Query(#[from] QueryError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BootstrapOutcome {
    Existed,
    Created,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome", content = "detail")]
pub enum DropOutcome {
    Dropped,
    NotFound,
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome", content = "detail")]
pub enum ObjectPurgeOutcome {
    Purged(PurgeStats),
    Skipped(String),
    Error(String),
}

/// Result of both purge phases. Neither phase aborts the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PurgeReport {
    pub metadata: DropOutcome,
    pub objects: ObjectPurgeOutcome,
}

/// Engine reasons that mean the partition was never there.
fn is_missing_partition(reason: &str) -> bool {
    let reason = reason.to_ascii_lowercase();
    reason.contains("partition not found") || reason.contains("10006")
}

pub struct PartitionLifecycle {
    gateway: Arc<QueryGateway>,
    catalog: Arc<CatalogEnsurer>,
    objects: Arc<dyn ObjectStore>,
    source: TableRef,
    summary: TableRef,
    location: Option<String>,
}

impl PartitionLifecycle {
    pub fn new(
        gateway: Arc<QueryGateway>,
        catalog: Arc<CatalogEnsurer>,
        objects: Arc<dyn ObjectStore>,
        source: TableRef,
        summary: TableRef,
        location: Option<String>,
    ) -> Self {
        Self {
            gateway,
            catalog,
            objects,
            source,
            summary,
            location,
        }
    }

    fn parsed_location(&self) -> Option<Result<StorageLocation, LocationError>> {
        self.location.as_deref().map(StorageLocation::parse)
    }

    /// Creates the summary table with `day` as its first partition unless it already exists.
    pub async fn ensure_summary_table(&self, day: IngestDate) -> Result<BootstrapOutcome, LifecycleError> {
        let exists = self
            .catalog
            .table_exists(&self.summary)
            .await
            .map_err(|source| LifecycleError::Catalog {
                table: self.summary.to_string(),
                source,
            })?;
        if exists {
            info!(table = %self.summary, "summary table exists");
            return Ok(BootstrapOutcome::Existed);
        }

        let location = match self.parsed_location() {
            None => {
                return Err(LifecycleError::MissingLocation {
                    table: self.summary.to_string(),
                })
            }
            Some(Err(source)) => {
                return Err(LifecycleError::InvalidLocation {
                    table: self.summary.to_string(),
                    source,
                })
            }
            Some(Ok(location)) => location,
        };

        info!(table = %self.summary, %location, "summary table missing; creating");
        self.gateway
            .execute(&Statement::CreateSummaryAs {
                summary: self.summary.name.clone(),
                source: self.source.name.clone(),
                location: location.clone(),
                day,
            })
            .await?;
        info!(table = %self.summary, %location, "summary table created");
        Ok(BootstrapOutcome::Created)
    }

    /// Removes any existing partition for `day`; a no-op when there is none.
    pub async fn drop_and_purge_partition(&self, day: IngestDate) -> PurgeReport {
        let metadata = match self
            .gateway
            .execute(&Statement::DropPartition {
                summary: self.summary.name.clone(),
                day,
            })
            .await
        {
            Ok(_) => {
                info!(table = %self.summary, %day, "partition dropped");
                DropOutcome::Dropped
            }
            Err(QueryError::Failed { reason, .. }) if is_missing_partition(&reason) => {
                info!(table = %self.summary, %day, "no partition to drop");
                DropOutcome::NotFound
            }
            Err(err) => {
                warn!(table = %self.summary, %day, error = %err, "dropping partition failed");
                DropOutcome::Error(err.to_string())
            }
        };

        let objects = match self.parsed_location() {
            None => {
                warn!("skipping object purge: SUMMARY_S3 not configured");
                ObjectPurgeOutcome::Skipped("summary location not configured".to_string())
            }
            Some(Err(err)) => {
                warn!(error = %err, "skipping object purge");
                ObjectPurgeOutcome::Skipped(err.to_string())
            }
            Some(Ok(location)) => {
                let prefix = location.partition_prefix(day);
                info!(bucket = %location.bucket, %prefix, "purging partition objects");
                match purge_prefix(self.objects.as_ref(), &location.bucket, &prefix, MAX_DELETE_BATCH).await {
                    Ok(stats) => ObjectPurgeOutcome::Purged(stats),
                    Err(err) => {
                        warn!(bucket = %location.bucket, %prefix, error = %err, "object purge failed");
                        ObjectPurgeOutcome::Error(err.to_string())
                    }
                }
            }
        };

        PurgeReport { metadata, objects }
    }

    /// Appends one mean-price row per `(make, country)` for `day`.
    pub async fn insert_snapshot(&self, day: IngestDate) -> Result<(), LifecycleError> {
        self.gateway
            .execute(&Statement::InsertSnapshot {
                summary: self.summary.name.clone(),
                source: self.source.name.clone(),
                day,
            })
            .await?;
        info!(table = %self.summary, %day, "snapshot inserted");
        Ok(())
    }
}
