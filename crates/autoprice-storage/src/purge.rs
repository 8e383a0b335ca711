use serde::Serialize;
use tracing::{debug, info};

use crate::{ObjectStore, ServiceError};

/// Bulk-delete request limit of the object store.
pub const MAX_DELETE_BATCH: usize = 1000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PurgeStats {
    pub listed: usize,
    pub deleted: usize,
    pub batches: usize,
}

/// Deletes every object under `prefix`, paging through the listing and flushing
/// a delete request each time `batch_size` keys have accumulated.
pub async fn purge_prefix(
    store: &dyn ObjectStore,
    bucket: &str,
    prefix: &str,
    batch_size: usize,
) -> Result<PurgeStats, ServiceError> {
    if prefix.is_empty() {
        return Err(ServiceError::rejected(
            "EmptyPrefix",
            format!("refusing to purge the whole of bucket {bucket}"),
        ));
    }
    let batch_size = batch_size.clamp(1, MAX_DELETE_BATCH);

    let mut stats = PurgeStats::default();
    let mut pending: Vec<String> = Vec::with_capacity(batch_size);
    let mut continuation: Option<String> = None;

    loop {
        let page = store
            .list_page(bucket, prefix, continuation.as_deref())
            .await?;
        stats.listed += page.keys.len();

        for key in page.keys {
            pending.push(key);
            if pending.len() == batch_size {
                flush(store, bucket, &mut pending, &mut stats).await?;
            }
        }

        match page.next {
            Some(next) => continuation = Some(next),
            None => break,
        }
    }
    if !pending.is_empty() {
        flush(store, bucket, &mut pending, &mut stats).await?;
    }

    info!(bucket, prefix, deleted = stats.deleted, batches = stats.batches, "prefix purged");
    Ok(stats)
}

async fn flush(
    store: &dyn ObjectStore,
    bucket: &str,
    pending: &mut Vec<String>,
    stats: &mut PurgeStats,
) -> Result<(), ServiceError> {
    debug!(bucket, keys = pending.len(), "deleting object batch");
    store.delete_batch(bucket, pending).await?;
    stats.deleted += pending.len();
    stats.batches += 1;
    pending.clear();
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::ListPage;

    struct PagedObjects {
        keys: Mutex<BTreeSet<String>>,
        page_size: usize,
        batch_sizes: Mutex<Vec<usize>>,
    }

    impl PagedObjects {
        fn new(keys: impl IntoIterator<Item = String>, page_size: usize) -> Self {
            Self {
                keys: Mutex::new(keys.into_iter().collect()),
                page_size,
                batch_sizes: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ObjectStore for PagedObjects {
        async fn list_page(
            &self,
            _bucket: &str,
            prefix: &str,
            continuation: Option<&str>,
        ) -> Result<ListPage, ServiceError> {
            let keys = self.keys.lock().unwrap();
            let page: Vec<String> = keys
                .iter()
                .filter(|k| k.starts_with(prefix))
                .filter(|k| continuation.map_or(true, |after| k.as_str() > after))
                .take(self.page_size + 1)
                .cloned()
                .collect();
            let next = (page.len() > self.page_size).then(|| page[self.page_size - 1].clone());
            Ok(ListPage {
                keys: page.into_iter().take(self.page_size).collect(),
                next,
            })
        }

        async fn delete_batch(&self, _bucket: &str, keys: &[String]) -> Result<(), ServiceError> {
            assert!(keys.len() <= MAX_DELETE_BATCH);
            self.batch_sizes.lock().unwrap().push(keys.len());
            let mut stored = self.keys.lock().unwrap();
            for key in keys {
                stored.remove(key);
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn deletes_in_bounded_batches_across_pages() {
        let today = (0..2500).map(|i| format!("summary/ingest_date=2026-10-17/part-{i:05}.parquet"));
        let other = (0..3).map(|i| format!("summary/ingest_date=2026-10-16/part-{i:05}.parquet"));
        let store = PagedObjects::new(today.chain(other), 400);

        let stats = purge_prefix(&store, "curated", "summary/ingest_date=2026-10-17/", MAX_DELETE_BATCH)
            .await
            .unwrap();

        assert_eq!(stats, PurgeStats { listed: 2500, deleted: 2500, batches: 3 });
        assert_eq!(store.batch_sizes.lock().unwrap().as_slice(), &[1000, 1000, 500]);
        let remaining = store.keys.lock().unwrap();
        assert_eq!(remaining.len(), 3);
        assert!(remaining.iter().all(|k| k.contains("2026-10-16")));
    }

    #[tokio::test]
    async fn purging_an_absent_prefix_is_a_no_op() {
        let store = PagedObjects::new(["summary/ingest_date=2026-10-16/a.parquet".to_string()], 10);
        let stats = purge_prefix(&store, "curated", "summary/ingest_date=2026-10-17/", 1000)
            .await
            .unwrap();
        assert_eq!(stats, PurgeStats::default());
        assert!(store.batch_sizes.lock().unwrap().is_empty());
        assert_eq!(store.keys.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn empty_prefix_is_refused() {
        let store = PagedObjects::new(["a".to_string()], 10);
        assert!(purge_prefix(&store, "curated", "", 1000).await.is_err());
        assert_eq!(store.keys.lock().unwrap().len(), 1);
    }
}
