//! In-process warehouse implementing every collaborator contract.
//!
//! Catalog metadata and object storage are separate: dropping a partition only
//! forgets its metadata, while partition reads list the objects under the
//! partition prefix.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{Array, Float64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use async_trait::async_trait;
use autoprice_core::{
    compare_partitions, summarize, IngestDate, QueryHandle, QueryState, SourceRecord, Statement,
    StorageLocation, SummaryRow, TableRef,
};
use autoprice_storage::{
    CatalogService, DiscoveryService, ListPage, NotificationChannel, ObjectStore, QueryContext,
    QueryService, QueryStatus, RawRows, ServiceError, MAX_DELETE_BATCH,
};
use bytes::Bytes;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone)]
enum LocalTable {
    Source {
        records: Vec<SourceRecord>,
    },
    Summary {
        location: StorageLocation,
        partitions: BTreeSet<IngestDate>,
    },
}

#[derive(Debug, Clone)]
struct LocalQuery {
    state: QueryState,
    reason: Option<String>,
    rows: RawRows,
}

#[derive(Debug)]
struct WarehouseState {
    namespaces: BTreeSet<String>,
    tables: BTreeMap<(String, String), LocalTable>,
    staged_sources: Vec<(String, String, Vec<SourceRecord>)>,
    objects: BTreeMap<(String, String), Bytes>,
    queries: HashMap<String, LocalQuery>,
    executed: Vec<&'static str>,
    discovery_runs: Vec<String>,
    discovery_busy: bool,
    discovery_failure: Option<String>,
    stall_queries: bool,
    fail_next: Option<(&'static str, String)>,
    list_page_size: usize,
}

impl Default for WarehouseState {
    fn default() -> Self {
        Self {
            namespaces: BTreeSet::new(),
            tables: BTreeMap::new(),
            staged_sources: Vec::new(),
            objects: BTreeMap::new(),
            queries: HashMap::new(),
            executed: Vec::new(),
            discovery_runs: Vec::new(),
            discovery_busy: false,
            discovery_failure: None,
            stall_queries: false,
            fail_next: None,
            list_page_size: 1000,
        }
    }
}

/// Query engine, catalog, discovery job and object store over shared in-memory state.
#[derive(Debug, Default)]
pub struct LocalWarehouse {
    state: Mutex<WarehouseState>,
}

impl LocalWarehouse {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers a source table as if discovery had already catalogued it.
    pub async fn register_source(&self, namespace: &str, table: &str, records: Vec<SourceRecord>) {
        let mut state = self.state.lock().await;
        state.namespaces.insert(namespace.to_string());
        state.tables.insert(
            (namespace.to_string(), table.to_string()),
            LocalTable::Source { records },
        );
    }

    /// Holds a source table back until the next discovery run.
    pub async fn stage_source(&self, namespace: &str, table: &str, records: Vec<SourceRecord>) {
        self.state
            .lock()
            .await
            .staged_sources
            .push((namespace.to_string(), table.to_string(), records));
    }

    /// Replaces the rows of an already registered source table.
    pub async fn replace_source_records(&self, namespace: &str, table: &str, records: Vec<SourceRecord>) {
        let mut state = self.state.lock().await;
        if let Some(LocalTable::Source { records: current }) =
            state.tables.get_mut(&(namespace.to_string(), table.to_string()))
        {
            *current = records;
        }
    }

    pub async fn set_discovery_busy(&self, busy: bool) {
        self.state.lock().await.discovery_busy = busy;
    }

    /// Rejects the next discovery start with `reason`, then behaves normally again.
    pub async fn fail_next_discovery(&self, reason: impl Into<String>) {
        self.state.lock().await.discovery_failure = Some(reason.into());
    }

    /// Leaves every later submission `RUNNING` until cancelled.
    pub async fn stall_queries(&self, stall: bool) {
        self.state.lock().await.stall_queries = stall;
    }

    /// Fails the next statement of `kind` (see [`Statement::kind`]) with `reason`.
    pub async fn fail_next(&self, kind: &'static str, reason: impl Into<String>) {
        self.state.lock().await.fail_next = Some((kind, reason.into()));
    }

    pub async fn set_list_page_size(&self, size: usize) {
        self.state.lock().await.list_page_size = size.max(1);
    }

    /// Writes a raw object, bypassing the engine.
    pub async fn put_object(&self, bucket: &str, key: &str, body: impl Into<Bytes>) {
        self.state
            .lock()
            .await
            .objects
            .insert((bucket.to_string(), key.to_string()), body.into());
    }

    pub async fn object_keys(&self, bucket: &str) -> Vec<String> {
        self.state
            .lock()
            .await
            .objects
            .keys()
            .filter(|(b, _)| b == bucket)
            .map(|(_, k)| k.clone())
            .collect()
    }

    pub async fn partitions(&self, namespace: &str, table: &str) -> Vec<IngestDate> {
        match self
            .state
            .lock()
            .await
            .tables
            .get(&(namespace.to_string(), table.to_string()))
        {
            Some(LocalTable::Summary { partitions, .. }) => partitions.iter().copied().collect(),
            _ => Vec::new(),
        }
    }

    /// Rows a query against one partition would see.
    pub async fn summary_rows(&self, namespace: &str, table: &str, day: IngestDate) -> Result<Vec<SummaryRow>> {
        let state = self.state.lock().await;
        match state.tables.get(&(namespace.to_string(), table.to_string())) {
            Some(LocalTable::Summary {
                location,
                partitions,
            }) if partitions.contains(&day) => read_partition(&state.objects, location, day),
            _ => Ok(Vec::new()),
        }
    }

    /// Statement kinds in submission order.
    pub async fn executed(&self) -> Vec<&'static str> {
        self.state.lock().await.executed.clone()
    }

    pub async fn discovery_runs(&self) -> Vec<String> {
        self.state.lock().await.discovery_runs.clone()
    }
}

/// Reads a JSON array of source records.
pub fn read_source_fixture(path: impl AsRef<Path>) -> Result<Vec<SourceRecord>> {
    let path = path.as_ref();
    let text =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

fn summary_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        ArrowField::new("make", DataType::Utf8, false),
        ArrowField::new("country", DataType::Utf8, false),
        ArrowField::new("avg_price", DataType::Float64, false),
    ]))
}

fn encode_rows(rows: &[SummaryRow]) -> Result<Bytes> {
    let schema = summary_schema();
    let makes = StringArray::from(rows.iter().map(|r| r.make.as_str()).collect::<Vec<_>>());
    let countries = StringArray::from(rows.iter().map(|r| r.country.as_str()).collect::<Vec<_>>());
    let prices = Float64Array::from(rows.iter().map(|r| r.avg_price).collect::<Vec<_>>());
    let batch = RecordBatch::try_new(
        schema.clone(),
        vec![Arc::new(makes), Arc::new(countries), Arc::new(prices)],
    )
    .context("building summary record batch")?;

    let mut buf = Vec::new();
    let mut writer =
        ArrowWriter::try_new(&mut buf, schema, None).context("opening parquet writer")?;
    writer.write(&batch).context("writing summary record batch")?;
    writer.close().context("closing parquet writer")?;
    Ok(Bytes::from(buf))
}

fn decode_rows(bytes: Bytes, day: IngestDate) -> Result<Vec<SummaryRow>> {
    let reader = ParquetRecordBatchReaderBuilder::try_new(bytes)
        .context("opening parquet object")?
        .build()
        .context("building parquet reader")?;

    let mut rows = Vec::new();
    for batch in reader {
        let batch = batch.context("reading parquet batch")?;
        let makes = string_column(&batch, "make")?;
        let countries = string_column(&batch, "country")?;
        let prices = batch
            .column_by_name("avg_price")
            .and_then(|c| c.as_any().downcast_ref::<Float64Array>())
            .context("avg_price column missing")?;
        for i in 0..batch.num_rows() {
            rows.push(SummaryRow {
                make: makes.value(i).to_string(),
                country: countries.value(i).to_string(),
                avg_price: prices.value(i),
                ingest_date: day,
            });
        }
    }
    Ok(rows)
}

fn string_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a StringArray> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<StringArray>())
        .with_context(|| format!("{name} column missing"))
}

fn read_partition(
    objects: &BTreeMap<(String, String), Bytes>,
    location: &StorageLocation,
    day: IngestDate,
) -> Result<Vec<SummaryRow>> {
    let prefix = location.partition_prefix(day);
    let mut rows = Vec::new();
    for ((bucket, key), body) in objects {
        if bucket == &location.bucket && key.starts_with(&prefix) {
            rows.extend(decode_rows(body.clone(), day).with_context(|| format!("decoding {key}"))?);
        }
    }
    Ok(rows)
}

fn number(value: Option<f64>) -> Option<String> {
    value.map(|v| v.to_string())
}

impl WarehouseState {
    fn source_records(&self, namespace: &str, table: &str) -> Result<Vec<SourceRecord>, String> {
        match self.tables.get(&(namespace.to_string(), table.to_string())) {
            Some(LocalTable::Source { records }) => Ok(records.clone()),
            Some(LocalTable::Summary { .. }) => Err(format!(
                "NOT_SUPPORTED: Table '{namespace}.{table}' is not a source table"
            )),
            None => Err(format!("TABLE_NOT_FOUND: Table '{namespace}.{table}' does not exist")),
        }
    }

    fn summary_table(
        &mut self,
        namespace: &str,
        table: &str,
    ) -> Result<(&StorageLocation, &mut BTreeSet<IngestDate>), String> {
        match self.tables.get_mut(&(namespace.to_string(), table.to_string())) {
            Some(LocalTable::Summary {
                location,
                partitions,
            }) => Ok((&*location, partitions)),
            Some(LocalTable::Source { .. }) => Err(format!(
                "NOT_SUPPORTED: Table '{namespace}.{table}' is not partitioned"
            )),
            None => Err(format!("TABLE_NOT_FOUND: Table '{namespace}.{table}' does not exist")),
        }
    }

    fn write_partition(
        &mut self,
        location: &StorageLocation,
        day: IngestDate,
        query_id: &str,
        rows: &[SummaryRow],
    ) -> Result<(), String> {
        let body = encode_rows(rows).map_err(|e| e.to_string())?;
        let key = format!("{}{query_id}.parquet", location.partition_prefix(day));
        debug!(bucket = %location.bucket, %key, rows = rows.len(), "writing partition object");
        self.objects.insert((location.bucket.clone(), key), body);
        Ok(())
    }

    fn execute(&mut self, statement: &Statement, namespace: &str, query_id: &str) -> Result<RawRows, String> {
        if !self.namespaces.contains(namespace) {
            return Err(format!("SCHEMA_NOT_FOUND: Schema '{namespace}' does not exist"));
        }

        match statement {
            Statement::CreateSummaryAs {
                summary,
                source,
                location,
                day,
            } => {
                if self.tables.contains_key(&(namespace.to_string(), summary.clone())) {
                    return Err(format!("ALREADY_EXISTS: Table '{namespace}.{summary}' already exists"));
                }
                let rows = summarize(&self.source_records(namespace, source)?, *day);
                let mut partitions = BTreeSet::new();
                if !rows.is_empty() {
                    self.write_partition(location, *day, query_id, &rows)?;
                    partitions.insert(*day);
                }
                self.tables.insert(
                    (namespace.to_string(), summary.clone()),
                    LocalTable::Summary {
                        location: location.clone(),
                        partitions,
                    },
                );
                Ok(Vec::new())
            }
            Statement::DropPartition { summary, day } => {
                let (_, partitions) = self.summary_table(namespace, summary)?;
                if partitions.remove(day) {
                    Ok(Vec::new())
                } else {
                    Err(format!(
                        "FAILED: SemanticException [Error 10006]: Partition not found (ingest_date = DATE '{day}')"
                    ))
                }
            }
            Statement::InsertSnapshot {
                summary,
                source,
                day,
            } => {
                let rows = summarize(&self.source_records(namespace, source)?, *day);
                let (location, _) = self.summary_table(namespace, summary)?;
                let location = location.clone();
                if !rows.is_empty() {
                    self.write_partition(&location, *day, query_id, &rows)?;
                    let (_, partitions) = self.summary_table(namespace, summary)?;
                    partitions.insert(*day);
                }
                Ok(Vec::new())
            }
            Statement::PreviousPartition { summary, before } => {
                let (_, partitions) = self.summary_table(namespace, summary)?;
                let prev = partitions.range(..*before).next_back().map(|d| d.to_string());
                Ok(vec![vec![Some("prev_day".to_string())], vec![prev]])
            }
            Statement::ComparePartitions {
                summary,
                today,
                previous,
            } => {
                let (location, has_today, has_prev) = {
                    let (location, partitions) = self.summary_table(namespace, summary)?;
                    (location.clone(), partitions.contains(today), partitions.contains(previous))
                };
                let cur = if has_today {
                    read_partition(&self.objects, &location, *today).map_err(|e| e.to_string())?
                } else {
                    Vec::new()
                };
                let prev = if has_prev {
                    read_partition(&self.objects, &location, *previous).map_err(|e| e.to_string())?
                } else {
                    Vec::new()
                };

                let mut rows = vec![[
                    "make",
                    "country",
                    "avg_price",
                    "prev_avg_price",
                    "pct_change",
                ]
                .iter()
                .map(|c| Some(c.to_string()))
                .collect::<Vec<_>>()];
                for row in compare_partitions(&cur, &prev) {
                    rows.push(vec![
                        Some(row.make),
                        Some(row.country),
                        number(row.avg_price_today),
                        number(row.avg_price_prev),
                        number(row.pct_change),
                    ]);
                }
                Ok(rows)
            }
        }
    }
}

#[async_trait]
impl QueryService for LocalWarehouse {
    async fn submit(&self, statement: &Statement, context: &QueryContext) -> Result<QueryHandle, ServiceError> {
        let mut state = self.state.lock().await;
        let query_id = Uuid::new_v4().to_string();
        let kind = statement.kind();
        state.executed.push(kind);

        let injected = if state
            .fail_next
            .as_ref()
            .is_some_and(|(target, _)| *target == kind)
        {
            state.fail_next.take().map(|(_, reason)| reason)
        } else {
            None
        };

        let query = if let Some(reason) = injected {
            LocalQuery {
                state: QueryState::Failed,
                reason: Some(reason),
                rows: Vec::new(),
            }
        } else if state.stall_queries {
            LocalQuery {
                state: QueryState::Running,
                reason: None,
                rows: Vec::new(),
            }
        } else {
            match state.execute(statement, &context.namespace, &query_id) {
                Ok(rows) => LocalQuery {
                    state: QueryState::Succeeded,
                    reason: None,
                    rows,
                },
                Err(reason) => LocalQuery {
                    state: QueryState::Failed,
                    reason: Some(reason),
                    rows: Vec::new(),
                },
            }
        };
        debug!(kind, %query_id, state = %query.state, "local statement executed");
        state.queries.insert(query_id.clone(), query);
        Ok(QueryHandle::new(query_id))
    }

    async fn status(&self, handle: &QueryHandle) -> Result<QueryStatus, ServiceError> {
        let state = self.state.lock().await;
        let query = state
            .queries
            .get(handle.as_str())
            .ok_or_else(|| ServiceError::NotFound(format!("query {handle}")))?;
        Ok(QueryStatus {
            state: query.state,
            reason: query.reason.clone(),
            engine_ms: Some(0),
        })
    }

    async fn results(&self, handle: &QueryHandle) -> Result<RawRows, ServiceError> {
        let state = self.state.lock().await;
        let query = state
            .queries
            .get(handle.as_str())
            .ok_or_else(|| ServiceError::NotFound(format!("query {handle}")))?;
        if query.state != QueryState::Succeeded {
            return Err(ServiceError::rejected(
                "InvalidRequestException",
                format!("query {handle} is {}", query.state),
            ));
        }
        Ok(query.rows.clone())
    }

    async fn cancel(&self, handle: &QueryHandle) -> Result<(), ServiceError> {
        let mut state = self.state.lock().await;
        let query = state
            .queries
            .get_mut(handle.as_str())
            .ok_or_else(|| ServiceError::NotFound(format!("query {handle}")))?;
        if !query.state.is_terminal() {
            query.state = QueryState::Cancelled;
        }
        Ok(())
    }
}

#[async_trait]
impl CatalogService for LocalWarehouse {
    async fn get_namespace(&self, namespace: &str) -> Result<(), ServiceError> {
        if self.state.lock().await.namespaces.contains(namespace) {
            Ok(())
        } else {
            Err(ServiceError::NotFound(format!("namespace {namespace}")))
        }
    }

    async fn create_namespace(&self, namespace: &str) -> Result<(), ServiceError> {
        if self.state.lock().await.namespaces.insert(namespace.to_string()) {
            Ok(())
        } else {
            Err(ServiceError::AlreadyExists(format!("namespace {namespace}")))
        }
    }

    async fn get_table(&self, table: &TableRef) -> Result<(), ServiceError> {
        let state = self.state.lock().await;
        if state
            .tables
            .contains_key(&(table.namespace.clone(), table.name.clone()))
        {
            Ok(())
        } else {
            Err(ServiceError::NotFound(format!("table {table}")))
        }
    }
}

#[async_trait]
impl DiscoveryService for LocalWarehouse {
    async fn start(&self, job: &str) -> Result<(), ServiceError> {
        let mut state = self.state.lock().await;
        if state.discovery_busy {
            return Err(ServiceError::AlreadyRunning(job.to_string()));
        }
        if let Some(reason) = state.discovery_failure.take() {
            return Err(ServiceError::rejected("AccessDeniedException", reason));
        }
        state.discovery_runs.push(job.to_string());
        for (namespace, table, records) in std::mem::take(&mut state.staged_sources) {
            info!(job, %namespace, %table, "discovery registered source table");
            state.namespaces.insert(namespace.clone());
            state
                .tables
                .insert((namespace, table), LocalTable::Source { records });
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for LocalWarehouse {
    async fn list_page(
        &self,
        bucket: &str,
        prefix: &str,
        continuation: Option<&str>,
    ) -> Result<ListPage, ServiceError> {
        let state = self.state.lock().await;
        let page_size = state.list_page_size;
        let mut keys: Vec<String> = state
            .objects
            .keys()
            .filter(|(b, k)| b == bucket && k.starts_with(prefix))
            .filter(|(_, k)| continuation.map_or(true, |after| k.as_str() > after))
            .take(page_size + 1)
            .map(|(_, k)| k.clone())
            .collect();
        let next = if keys.len() > page_size {
            keys.truncate(page_size);
            keys.last().cloned()
        } else {
            None
        };
        Ok(ListPage { keys, next })
    }

    async fn delete_batch(&self, bucket: &str, keys: &[String]) -> Result<(), ServiceError> {
        if keys.len() > MAX_DELETE_BATCH {
            return Err(ServiceError::rejected(
                "MalformedXML",
                format!("{} keys exceed the bulk delete limit", keys.len()),
            ));
        }
        let mut state = self.state.lock().await;
        for key in keys {
            state.objects.remove(&(bucket.to_string(), key.clone()));
        }
        Ok(())
    }
}

/// Notification channel that keeps every published message.
#[derive(Debug, Default)]
pub struct RecordingChannel {
    published: Mutex<Vec<(String, String)>>,
    failing: Mutex<bool>,
}

impl RecordingChannel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn set_failing(&self, failing: bool) {
        *self.failing.lock().await = failing;
    }

    pub async fn published(&self) -> Vec<(String, String)> {
        self.published.lock().await.clone()
    }
}

#[async_trait]
impl NotificationChannel for RecordingChannel {
    fn name(&self) -> &str {
        "recording"
    }

    async fn publish(&self, subject: &str, body: &str) -> Result<(), ServiceError> {
        if *self.failing.lock().await {
            return Err(ServiceError::Unavailable("recording channel is failing".into()));
        }
        self.published
            .lock()
            .await
            .push((subject.to_string(), body.to_string()));
        Ok(())
    }
}
