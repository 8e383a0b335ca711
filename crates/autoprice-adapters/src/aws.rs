//! Athena, Glue, S3 and SNS behind the collaborator contracts.

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use autoprice_core::{QueryHandle, QueryState, Statement, TableRef};
use autoprice_storage::{
    CatalogService, DiscoveryService, ListPage, NotificationChannel, ObjectStore, QueryContext,
    QueryService, QueryStatus, RawRows, ServiceError,
};
use aws_config::{BehaviorVersion, SdkConfig};
use aws_sdk_athena::types::{QueryExecutionContext, ResultConfiguration};
use aws_sdk_glue::types::DatabaseInput;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::types::{Delete, ObjectIdentifier};
use tracing::debug;

/// SNS rejects longer subjects.
const SNS_SUBJECT_LIMIT: usize = 100;

fn map_sdk_error<E, R>(err: SdkError<E, R>) -> ServiceError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    R: Debug,
{
    match &err {
        SdkError::ServiceError(_) => ServiceError::Rejected {
            code: err.code().unwrap_or("Unknown").to_string(),
            message: err
                .message()
                .map(str::to_string)
                .unwrap_or_else(|| DisplayErrorContext(&err).to_string()),
        },
        _ => ServiceError::Unavailable(DisplayErrorContext(&err).to_string()),
    }
}

fn invalid_input(err: impl std::fmt::Display) -> ServiceError {
    ServiceError::rejected("InvalidInput", err.to_string())
}

/// Clients for every AWS collaborator, built from one shared SDK config.
#[derive(Clone)]
pub struct AwsCollaborators {
    pub queries: Arc<AthenaQueryService>,
    pub catalog: Arc<GlueCatalog>,
    pub objects: Arc<S3ObjectStore>,
    config: SdkConfig,
}

impl AwsCollaborators {
    pub async fn from_env() -> Self {
        let config = aws_config::load_defaults(BehaviorVersion::latest()).await;
        Self {
            queries: Arc::new(AthenaQueryService::new(aws_sdk_athena::Client::new(&config))),
            catalog: Arc::new(GlueCatalog::new(aws_sdk_glue::Client::new(&config))),
            objects: Arc::new(S3ObjectStore::new(aws_sdk_s3::Client::new(&config))),
            config,
        }
    }

    pub fn sns_channel(&self, topic_arn: impl Into<String>) -> SnsChannel {
        SnsChannel::new(aws_sdk_sns::Client::new(&self.config), topic_arn)
    }
}

pub struct AthenaQueryService {
    client: aws_sdk_athena::Client,
}

impl AthenaQueryService {
    pub fn new(client: aws_sdk_athena::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl QueryService for AthenaQueryService {
    async fn submit(&self, statement: &Statement, context: &QueryContext) -> Result<QueryHandle, ServiceError> {
        let sql = statement.to_sql();
        debug!(kind = statement.kind(), %sql, "submitting athena statement");
        let out = self
            .client
            .start_query_execution()
            .query_string(sql)
            .query_execution_context(
                QueryExecutionContext::builder()
                    .database(&context.namespace)
                    .build(),
            )
            .result_configuration(
                ResultConfiguration::builder()
                    .output_location(&context.output_location)
                    .build(),
            )
            .set_work_group(context.workgroup.clone())
            .send()
            .await
            .map_err(map_sdk_error)?;

        out.query_execution_id()
            .map(QueryHandle::new)
            .ok_or_else(|| ServiceError::rejected("MissingQueryExecutionId", "athena returned no execution id"))
    }

    async fn status(&self, handle: &QueryHandle) -> Result<QueryStatus, ServiceError> {
        let out = self
            .client
            .get_query_execution()
            .query_execution_id(handle.as_str())
            .send()
            .await
            .map_err(map_sdk_error)?;
        let execution = out
            .query_execution()
            .ok_or_else(|| ServiceError::NotFound(format!("query execution {handle}")))?;
        let status = execution.status();

        Ok(QueryStatus {
            state: status
                .and_then(|s| s.state())
                .map(|s| s.as_str().parse().unwrap_or(QueryState::Running))
                .unwrap_or(QueryState::Queued),
            reason: status
                .and_then(|s| s.state_change_reason())
                .map(str::to_string),
            engine_ms: execution
                .statistics()
                .and_then(|s| s.engine_execution_time_in_millis()),
        })
    }

    async fn results(&self, handle: &QueryHandle) -> Result<RawRows, ServiceError> {
        let mut rows = Vec::new();
        let mut next_token: Option<String> = None;
        loop {
            let out = self
                .client
                .get_query_results()
                .query_execution_id(handle.as_str())
                .set_next_token(next_token.take())
                .send()
                .await
                .map_err(map_sdk_error)?;
            if let Some(result_set) = out.result_set() {
                rows.extend(result_set.rows().iter().map(|row| {
                    row.data()
                        .iter()
                        .map(|datum| datum.var_char_value().map(str::to_string))
                        .collect::<Vec<_>>()
                }));
            }
            match out.next_token() {
                Some(token) => next_token = Some(token.to_string()),
                None => break,
            }
        }
        Ok(rows)
    }

    async fn cancel(&self, handle: &QueryHandle) -> Result<(), ServiceError> {
        self.client
            .stop_query_execution()
            .query_execution_id(handle.as_str())
            .send()
            .await
            .map_err(map_sdk_error)?;
        Ok(())
    }
}

/// Glue data catalog, also the crawler that discovers the source table.
pub struct GlueCatalog {
    client: aws_sdk_glue::Client,
}

impl GlueCatalog {
    pub fn new(client: aws_sdk_glue::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl CatalogService for GlueCatalog {
    async fn get_namespace(&self, namespace: &str) -> Result<(), ServiceError> {
        match self.client.get_database().name(namespace).send().await {
            Ok(_) => Ok(()),
            Err(err)
                if err
                    .as_service_error()
                    .is_some_and(|e| e.is_entity_not_found_exception()) =>
            {
                Err(ServiceError::NotFound(format!("database {namespace}")))
            }
            Err(err) => Err(map_sdk_error(err)),
        }
    }

    async fn create_namespace(&self, namespace: &str) -> Result<(), ServiceError> {
        let input = DatabaseInput::builder()
            .name(namespace)
            .build()
            .map_err(invalid_input)?;
        match self.client.create_database().database_input(input).send().await {
            Ok(_) => Ok(()),
            Err(err)
                if err
                    .as_service_error()
                    .is_some_and(|e| e.is_already_exists_exception()) =>
            {
                Err(ServiceError::AlreadyExists(format!("database {namespace}")))
            }
            Err(err) => Err(map_sdk_error(err)),
        }
    }

    async fn get_table(&self, table: &TableRef) -> Result<(), ServiceError> {
        match self
            .client
            .get_table()
            .database_name(&table.namespace)
            .name(&table.name)
            .send()
            .await
        {
            Ok(_) => Ok(()),
            Err(err)
                if err
                    .as_service_error()
                    .is_some_and(|e| e.is_entity_not_found_exception()) =>
            {
                Err(ServiceError::NotFound(format!("table {table}")))
            }
            Err(err) => Err(map_sdk_error(err)),
        }
    }
}

#[async_trait]
impl DiscoveryService for GlueCatalog {
    async fn start(&self, job: &str) -> Result<(), ServiceError> {
        match self.client.start_crawler().name(job).send().await {
            Ok(_) => Ok(()),
            Err(err)
                if err
                    .as_service_error()
                    .is_some_and(|e| e.is_crawler_running_exception()) =>
            {
                Err(ServiceError::AlreadyRunning(job.to_string()))
            }
            Err(err) => Err(map_sdk_error(err)),
        }
    }
}

pub struct S3ObjectStore {
    client: aws_sdk_s3::Client,
}

impl S3ObjectStore {
    pub fn new(client: aws_sdk_s3::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn list_page(
        &self,
        bucket: &str,
        prefix: &str,
        continuation: Option<&str>,
    ) -> Result<ListPage, ServiceError> {
        let out = self
            .client
            .list_objects_v2()
            .bucket(bucket)
            .prefix(prefix)
            .set_continuation_token(continuation.map(str::to_string))
            .send()
            .await
            .map_err(map_sdk_error)?;
        Ok(ListPage {
            keys: out
                .contents()
                .iter()
                .filter_map(|object| object.key().map(str::to_string))
                .collect(),
            next: out.next_continuation_token().map(str::to_string),
        })
    }

    async fn delete_batch(&self, bucket: &str, keys: &[String]) -> Result<(), ServiceError> {
        let objects = keys
            .iter()
            .map(|key| ObjectIdentifier::builder().key(key).build())
            .collect::<Result<Vec<_>, _>>()
            .map_err(invalid_input)?;
        let delete = Delete::builder()
            .set_objects(Some(objects))
            .quiet(true)
            .build()
            .map_err(invalid_input)?;
        let out = self
            .client
            .delete_objects()
            .bucket(bucket)
            .delete(delete)
            .send()
            .await
            .map_err(map_sdk_error)?;

        let failed = out.errors();
        if !failed.is_empty() {
            return Err(ServiceError::rejected(
                "PartialDelete",
                format!("{} of {} objects in {bucket} were not deleted", failed.len(), keys.len()),
            ));
        }
        Ok(())
    }
}

pub struct SnsChannel {
    client: aws_sdk_sns::Client,
    topic_arn: String,
}

impl SnsChannel {
    pub fn new(client: aws_sdk_sns::Client, topic_arn: impl Into<String>) -> Self {
        Self {
            client,
            topic_arn: topic_arn.into(),
        }
    }
}

/// ASCII-only, single-line subject within the SNS limit.
fn sns_subject(subject: &str) -> String {
    subject
        .chars()
        .map(|c| if c.is_ascii() && !c.is_ascii_control() { c } else { '?' })
        .take(SNS_SUBJECT_LIMIT - 1)
        .collect()
}

#[async_trait]
impl NotificationChannel for SnsChannel {
    fn name(&self) -> &str {
        "sns"
    }

    async fn publish(&self, subject: &str, body: &str) -> Result<(), ServiceError> {
        self.client
            .publish()
            .topic_arn(&self.topic_arn)
            .subject(sns_subject(subject))
            .message(body)
            .send()
            .await
            .map_err(map_sdk_error)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sns_subjects_are_ascii_and_bounded() {
        assert_eq!(sns_subject("[AutoPrice] ok"), "[AutoPrice] ok");
        assert_eq!(sns_subject("a\nb≥c"), "a?b?c");
        assert_eq!(sns_subject(&"x".repeat(300)).len(), SNS_SUBJECT_LIMIT - 1);
    }
}
