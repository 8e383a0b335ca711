use std::sync::Arc;
use std::time::Duration;

use autoprice_core::TableRef;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::{CatalogService, ServiceError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamespaceOutcome {
    Existed,
    Created,
}

pub struct CatalogEnsurer {
    catalog: Arc<dyn CatalogService>,
    poll_interval: Duration,
}

impl CatalogEnsurer {
    pub fn new(catalog: Arc<dyn CatalogService>, poll_interval: Duration) -> Self {
        Self {
            catalog,
            poll_interval,
        }
    }

    /// Creates `namespace` unless it is already registered.
    pub async fn ensure_namespace(&self, namespace: &str) -> Result<NamespaceOutcome, ServiceError> {
        match self.catalog.get_namespace(namespace).await {
            Ok(()) => {
                info!(namespace, "namespace exists");
                Ok(NamespaceOutcome::Existed)
            }
            Err(ServiceError::NotFound(_)) => match self.catalog.create_namespace(namespace).await {
                Ok(()) => {
                    info!(namespace, "namespace created");
                    Ok(NamespaceOutcome::Created)
                }
                Err(ServiceError::AlreadyExists(_)) => Ok(NamespaceOutcome::Existed),
                Err(err) => Err(err),
            },
            Err(err) => Err(err),
        }
    }

    pub async fn table_exists(&self, table: &TableRef) -> Result<bool, ServiceError> {
        match self.catalog.get_table(table).await {
            Ok(()) => Ok(true),
            Err(ServiceError::NotFound(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Polls until `table` is registered or `timeout` elapses.
    ///
    /// Lookup errors other than not-found are logged and retried within the same budget.
    pub async fn wait_for_table(&self, table: &TableRef, timeout: Duration) -> bool {
        let started = Instant::now();
        loop {
            match self.catalog.get_table(table).await {
                Ok(()) => {
                    info!(%table, "table found");
                    return true;
                }
                Err(ServiceError::NotFound(_)) => {}
                Err(err) => warn!(%table, error = %err, "table lookup failed; retrying"),
            }

            let waited = started.elapsed();
            if waited >= timeout {
                warn!(%table, ?waited, "timed out waiting for table");
                return false;
            }
            tokio::time::sleep(self.poll_interval.min(timeout - waited)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeSet, VecDeque};
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;

    #[derive(Default)]
    struct FakeCatalog {
        namespaces: Mutex<BTreeSet<String>>,
        table_lookups: Mutex<VecDeque<Result<(), ServiceError>>>,
        creates: Mutex<usize>,
    }

    #[async_trait]
    impl CatalogService for FakeCatalog {
        async fn get_namespace(&self, namespace: &str) -> Result<(), ServiceError> {
            if self.namespaces.lock().unwrap().contains(namespace) {
                Ok(())
            } else {
                Err(ServiceError::NotFound(namespace.to_string()))
            }
        }

        async fn create_namespace(&self, namespace: &str) -> Result<(), ServiceError> {
            *self.creates.lock().unwrap() += 1;
            self.namespaces.lock().unwrap().insert(namespace.to_string());
            Ok(())
        }

        async fn get_table(&self, table: &TableRef) -> Result<(), ServiceError> {
            self.table_lookups
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(ServiceError::NotFound(table.to_string())))
        }
    }

    fn ensurer(catalog: Arc<FakeCatalog>) -> CatalogEnsurer {
        CatalogEnsurer::new(catalog, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn ensure_namespace_is_idempotent() {
        let catalog = Arc::new(FakeCatalog::default());
        let ensurer = ensurer(catalog.clone());
        assert_eq!(
            ensurer.ensure_namespace("autoprice_db").await.unwrap(),
            NamespaceOutcome::Created
        );
        assert_eq!(
            ensurer.ensure_namespace("autoprice_db").await.unwrap(),
            NamespaceOutcome::Existed
        );
        assert_eq!(*catalog.creates.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn wait_for_table_retries_through_transient_errors() {
        let catalog = Arc::new(FakeCatalog::default());
        catalog.table_lookups.lock().unwrap().extend([
            Err(ServiceError::NotFound("t".into())),
            Err(ServiceError::Unavailable("throttled".into())),
            Ok(()),
        ]);
        let table = TableRef::new("autoprice_db", "autoprice_upload");
        assert!(ensurer(catalog).wait_for_table(&table, Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn wait_for_table_gives_up_after_timeout() {
        let catalog = Arc::new(FakeCatalog::default());
        let table = TableRef::new("autoprice_db", "autoprice_upload");
        assert!(
            !ensurer(catalog)
                .wait_for_table(&table, Duration::from_millis(10))
                .await
        );
    }

    #[tokio::test]
    async fn table_exists_distinguishes_absence_from_errors() {
        let catalog = Arc::new(FakeCatalog::default());
        catalog
            .table_lookups
            .lock()
            .unwrap()
            .extend([Ok(()), Err(ServiceError::rejected("AccessDenied", "nope"))]);
        let ensurer = ensurer(catalog);
        let table = TableRef::new("autoprice_db", "autoprice_summary");
        assert!(ensurer.table_exists(&table).await.unwrap());
        assert!(ensurer.table_exists(&table).await.is_err());
        assert!(!ensurer.table_exists(&table).await.unwrap());
    }
}
