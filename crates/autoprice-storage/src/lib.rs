//! Collaborator contracts and the polling gateways the pipeline drives them through.

mod catalog;
mod gateway;
mod purge;

use async_trait::async_trait;
use autoprice_core::{QueryHandle, QueryState, Statement, TableRef};
use thiserror::Error;

pub use catalog::{CatalogEnsurer, NamespaceOutcome};
pub use gateway::{PollPolicy, QueryError, QueryGateway, ResultSet, Submission, Wait};
pub use purge::{purge_prefix, PurgeStats, MAX_DELETE_BATCH};

pub const CRATE_NAME: &str = "autoprice-storage";

/// Failure reported by an external collaborator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ServiceError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("already running: {0}")]
    AlreadyRunning(String),
    #[error("{code}: {message}")]
    Rejected { code: String, message: String },
    #[error("service unavailable: {0}")]
    Unavailable(String),
}

impl ServiceError {
    pub fn rejected(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Rejected {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Scope every statement runs in: working namespace, workgroup and result output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryContext {
    pub namespace: String,
    pub workgroup: Option<String>,
    pub output_location: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryStatus {
    pub state: QueryState,
    pub reason: Option<String>,
    pub engine_ms: Option<i64>,
}

/// Raw result rows; the first row holds column names.
pub type RawRows = Vec<Vec<Option<String>>>;

#[async_trait]
pub trait QueryService: Send + Sync {
    async fn submit(
        &self,
        statement: &Statement,
        context: &QueryContext,
    ) -> Result<QueryHandle, ServiceError>;

    async fn status(&self, handle: &QueryHandle) -> Result<QueryStatus, ServiceError>;

    async fn results(&self, handle: &QueryHandle) -> Result<RawRows, ServiceError>;

    async fn cancel(&self, handle: &QueryHandle) -> Result<(), ServiceError>;
}

/// Namespace and table metadata. Lookups report absence as [`ServiceError::NotFound`].
#[async_trait]
pub trait CatalogService: Send + Sync {
    async fn get_namespace(&self, namespace: &str) -> Result<(), ServiceError>;

    async fn create_namespace(&self, namespace: &str) -> Result<(), ServiceError>;

    async fn get_table(&self, table: &TableRef) -> Result<(), ServiceError>;
}

/// Source-table discovery job. A run already in progress is [`ServiceError::AlreadyRunning`].
#[async_trait]
pub trait DiscoveryService: Send + Sync {
    async fn start(&self, job: &str) -> Result<(), ServiceError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListPage {
    pub keys: Vec<String>,
    pub next: Option<String>,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn list_page(
        &self,
        bucket: &str,
        prefix: &str,
        continuation: Option<&str>,
    ) -> Result<ListPage, ServiceError>;

    /// Deletes at most [`MAX_DELETE_BATCH`] keys in one request.
    async fn delete_batch(&self, bucket: &str, keys: &[String]) -> Result<(), ServiceError>;
}

#[async_trait]
pub trait NotificationChannel: Send + Sync {
    fn name(&self) -> &str;

    async fn publish(&self, subject: &str, body: &str) -> Result<(), ServiceError>;
}
