//! Daily summary pipeline: trigger handling, readiness checks, partition lifecycle and alerts.

pub mod config;
pub mod detect;
pub mod lifecycle;
pub mod notify;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use autoprice_core::{IngestDate, TableRef};
use autoprice_storage::{
    CatalogEnsurer, CatalogService, DiscoveryService, NotificationChannel, ObjectStore,
    QueryGateway, QueryService, ServiceError,
};
use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub use config::{ConfigError, LogFormat, PipelineConfig};
pub use detect::{alert_body, alert_subject, select_alerts, ChangeDetector, DetectError};
pub use lifecycle::{
    BootstrapOutcome, DropOutcome, LifecycleError, ObjectPurgeOutcome, PartitionLifecycle, PurgeReport,
};
pub use notify::{NotifyError, Notifier};

pub const CRATE_NAME: &str = "autoprice-sync";

pub const SUMMARY_ERROR_SUBJECT: &str = "[AutoPrice] Summary Build Error";
pub const DISCOVERY_ERROR_SUBJECT: &str = "[AutoPrice] Glue Error";

/// Object named by an upload notification. Both fields are `None` for manual runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub bucket: Option<String>,
    pub key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct S3Notification {
    #[serde(rename = "Records", default)]
    records: Vec<S3NotificationRecord>,
}

#[derive(Debug, Deserialize)]
struct S3NotificationRecord {
    s3: S3Entity,
}

#[derive(Debug, Deserialize)]
struct S3Entity {
    bucket: S3Bucket,
    object: S3Object,
}

#[derive(Debug, Deserialize)]
struct S3Bucket {
    name: String,
}

#[derive(Debug, Deserialize)]
struct S3Object {
    key: String,
}

impl TriggerEvent {
    pub fn manual() -> Self {
        Self::default()
    }

    /// First record of an S3 notification; anything else is a manual run.
    pub fn from_json(value: &serde_json::Value) -> Self {
        serde_json::from_value::<S3Notification>(value.clone())
            .ok()
            .and_then(|n| n.records.into_iter().next())
            .map(|record| Self {
                bucket: Some(record.s3.bucket.name),
                key: Some(decode_object_key(&record.s3.object.key)),
            })
            .unwrap_or_default()
    }

    pub fn from_slice(bytes: &[u8]) -> Self {
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Self::manual();
        }
        match serde_json::from_slice::<serde_json::Value>(bytes) {
            Ok(value) => Self::from_json(&value),
            Err(err) => {
                warn!(error = %err, "trigger payload is not JSON; treating as manual run");
                Self::manual()
            }
        }
    }

    /// Manual runs accept everything; uploads must end with `suffix`, case-insensitively.
    pub fn accepts(&self, suffix: &str) -> bool {
        match &self.key {
            Some(key) => key.to_lowercase().ends_with(&suffix.to_lowercase()),
            None => true,
        }
    }
}

/// Object keys in notifications are form-encoded: `+` is a space, `%XX` a byte.
/// Malformed escapes are kept as written.
pub fn decode_object_key(raw: &str) -> String {
    percent_decode_str(&raw.replace('+', " "))
        .decode_utf8_lossy()
        .into_owned()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStage {
    Start,
    TriggerDiscovery,
    CatalogReady,
    PipelineRun,
    Done,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Skipped,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationOutcome {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub bucket: Option<String>,
    pub key: Option<String>,
    pub day: IngestDate,
    pub previous_day: Option<IngestDate>,
    pub alerts: Vec<String>,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("ensuring namespace {namespace}: {source}")]
    Namespace {
        namespace: String,
        #[source]
        source: ServiceError,
    },
    #[error("Source table not ready: {table} (waited {waited:?})")]
    SourceNotReady { table: TableRef, waited: Duration },
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    #[error(transparent)]
    Detect(#[from] DetectError),
    #[error("{source}")]
    Notify {
        stage: RunStage,
        #[source]
        source: NotifyError,
    },
}

impl PipelineError {
    /// Stage the run was in when it failed.
    pub fn stage(&self) -> RunStage {
        match self {
            Self::Namespace { .. } | Self::SourceNotReady { .. } => RunStage::CatalogReady,
            Self::Lifecycle(_) | Self::Detect(_) => RunStage::PipelineRun,
            Self::Notify { stage, .. } => *stage,
        }
    }
}

/// External services the pipeline drives.
#[derive(Clone)]
pub struct Collaborators {
    pub queries: Arc<dyn QueryService>,
    pub catalog: Arc<dyn CatalogService>,
    pub discovery: Arc<dyn DiscoveryService>,
    pub objects: Arc<dyn ObjectStore>,
    pub channels: Vec<Arc<dyn NotificationChannel>>,
}

pub struct SnapshotPipeline {
    config: PipelineConfig,
    discovery: Arc<dyn DiscoveryService>,
    catalog: Arc<CatalogEnsurer>,
    lifecycle: PartitionLifecycle,
    detector: ChangeDetector,
    notifier: Notifier,
}

fn enter(stage: RunStage) {
    info!(stage = ?stage, "entering stage");
}

impl SnapshotPipeline {
    pub fn new(config: PipelineConfig, collaborators: Collaborators) -> Result<Self, ConfigError> {
        config.validate()?;

        let gateway = Arc::new(QueryGateway::new(
            collaborators.queries,
            config.query_context(),
            config.poll_policy(),
        ));
        let catalog = Arc::new(CatalogEnsurer::new(collaborators.catalog, config.table_poll_interval));
        let lifecycle = PartitionLifecycle::new(
            gateway.clone(),
            catalog.clone(),
            collaborators.objects,
            config.source_ref(),
            config.summary_ref(),
            config.summary_location.clone(),
        );
        let detector = ChangeDetector::new(gateway, config.summary_table.clone());
        let notifier = Notifier::new(collaborators.channels);
        info!(channels = ?notifier.channel_names(), "pipeline configured");

        Ok(Self {
            discovery: collaborators.discovery,
            catalog,
            lifecycle,
            detector,
            notifier,
            config,
        })
    }

    pub async fn handle(&self, event: &TriggerEvent) -> Result<InvocationOutcome, PipelineError> {
        self.handle_on(event, IngestDate::today()).await
    }

    /// Runs the pipeline for an explicit `day`.
    pub async fn handle_on(&self, event: &TriggerEvent, day: IngestDate) -> Result<InvocationOutcome, PipelineError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("pipeline_run", %run_id, %day);
        self.run_stages(run_id, event, day).instrument(span).await
    }

    async fn run_stages(
        &self,
        run_id: Uuid,
        event: &TriggerEvent,
        day: IngestDate,
    ) -> Result<InvocationOutcome, PipelineError> {
        enter(RunStage::Start);
        let mut outcome = InvocationOutcome {
            run_id,
            status: RunStatus::Skipped,
            bucket: event.bucket.clone(),
            key: event.key.clone(),
            day,
            previous_day: None,
            alerts: Vec::new(),
        };
        match (&event.bucket, &event.key) {
            (Some(bucket), Some(key)) => info!(%bucket, %key, "object uploaded"),
            _ => warn!("no object in trigger event; running unconditionally"),
        }
        if !event.accepts(&self.config.accepted_suffix) {
            info!(suffix = %self.config.accepted_suffix, "skipping object with another suffix");
            return Ok(outcome);
        }

        enter(RunStage::TriggerDiscovery);
        if let Err(err) = self.trigger_discovery().await {
            enter(RunStage::Failed);
            error!(error = %err, "discovery alert could not be delivered");
            return Err(err);
        }

        enter(RunStage::CatalogReady);
        if let Err(err) = self.catalog_ready().await {
            enter(RunStage::Failed);
            error!(error = %err, "catalog not ready");
            return Err(err);
        }

        enter(RunStage::PipelineRun);
        match self.run_pipeline(day).await {
            Ok((previous_day, alerts)) => {
                outcome.status = RunStatus::Completed;
                outcome.previous_day = previous_day;
                outcome.alerts = alerts;
                enter(RunStage::Done);
                Ok(outcome)
            }
            Err(err) => {
                enter(RunStage::Failed);
                error!(error = %err, "summary build failed");
                if let Err(notify_err) = self.notifier.publish(SUMMARY_ERROR_SUBJECT, &err.to_string()).await {
                    error!(error = %notify_err, "failure alert could not be delivered");
                }
                Err(err)
            }
        }
    }

    /// A discovery failure is alerted and the run goes on; only an undeliverable alert aborts it.
    async fn trigger_discovery(&self) -> Result<(), PipelineError> {
        let Some(job) = self.config.discovery_job.as_deref() else {
            info!("no discovery job configured");
            return Ok(());
        };
        match self.discovery.start(job).await {
            Ok(()) => info!(job, "discovery started"),
            Err(ServiceError::AlreadyRunning(_)) => info!(job, "discovery already running"),
            Err(err) => {
                warn!(job, error = %err, "discovery could not be started");
                self.notifier
                    .publish(DISCOVERY_ERROR_SUBJECT, &err.to_string())
                    .await
                    .map_err(|source| PipelineError::Notify {
                        stage: RunStage::TriggerDiscovery,
                        source,
                    })?;
            }
        }
        Ok(())
    }

    async fn catalog_ready(&self) -> Result<(), PipelineError> {
        self.catalog
            .ensure_namespace(&self.config.namespace)
            .await
            .map_err(|source| PipelineError::Namespace {
                namespace: self.config.namespace.clone(),
                source,
            })?;

        let source = self.config.source_ref();
        if !self
            .catalog
            .wait_for_table(&source, self.config.source_wait_timeout)
            .await
        {
            return Err(PipelineError::SourceNotReady {
                table: source,
                waited: self.config.source_wait_timeout,
            });
        }
        Ok(())
    }

    async fn run_pipeline(&self, day: IngestDate) -> Result<(Option<IngestDate>, Vec<String>), PipelineError> {
        self.lifecycle.ensure_summary_table(day).await?;
        let report = self.lifecycle.drop_and_purge_partition(day).await;
        info!(metadata = ?report.metadata, objects = ?report.objects, "partition purge finished");
        self.lifecycle.insert_snapshot(day).await?;

        let Some(previous) = self.detector.find_previous_partition(day).await? else {
            info!("no previous partition; skipping comparison");
            return Ok((None, Vec::new()));
        };
        let rows = self.detector.compare(day, previous).await?;
        let threshold = self.config.alert_threshold_pct;
        let alerts = select_alerts(&rows, threshold);
        if alerts.is_empty() {
            info!(%previous, compared = rows.len(), threshold, "no change over threshold");
        } else {
            info!(%previous, affected = alerts.len(), threshold, "price change over threshold");
            self.notifier
                .publish(&alert_subject(day, threshold, alerts.len()), &alert_body(&alerts))
                .await
                .map_err(|source| PipelineError::Notify {
                    stage: RunStage::PipelineRun,
                    source,
                })?;
        }
        Ok((Some(previous), alerts))
    }

    /// Cron job that runs the pipeline unconditionally, when enabled.
    pub async fn maybe_build_scheduler(self: &Arc<Self>) -> anyhow::Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = self.config.schedule_cron.clone();
        let pipeline = Arc::clone(self);
        let job = Job::new_async(&cron, move |_uuid, _l| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                match pipeline.handle(&TriggerEvent::manual()).await {
                    Ok(outcome) => info!(
                        run_id = %outcome.run_id,
                        alerts = outcome.alerts.len(),
                        "scheduled run finished"
                    ),
                    Err(err) => error!(error = %err, stage = ?err.stage(), "scheduled run failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }
}
