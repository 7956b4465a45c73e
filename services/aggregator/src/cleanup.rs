use crate::aggregator::ProcessedFileRef;
use crate::error::Result;
use crate::object_store::ObjectStore;
use std::sync::Arc;
use tracing::{info, instrument};

/// Keys to delete from one bucket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketDeletion {
    pub bucket: String,
    pub keys: Vec<String>,
}

/// Group processed files by bucket, buckets in first-seen order
pub fn group_by_bucket(processed: &[ProcessedFileRef]) -> Vec<BucketDeletion> {
    let mut groups: Vec<BucketDeletion> = Vec::new();

    for file in processed {
        match groups.iter_mut().find(|group| group.bucket == file.bucket) {
            Some(group) => group.keys.push(file.key.clone()),
            None => groups.push(BucketDeletion {
                bucket: file.bucket.clone(),
                keys: vec![file.key.clone()],
            }),
        }
    }

    groups
}

/// Deletes source files once their summary is visible
pub struct CleanupCoordinator {
    store: Arc<dyn ObjectStore>,
}

impl CleanupCoordinator {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// Issue one batch delete per bucket for exactly the processed keys.
    ///
    /// Returns the number of keys deleted. Stops at the first failing bucket;
    /// buckets already cleaned stay cleaned.
    #[instrument(skip(self, processed), fields(files = processed.len()))]
    pub async fn delete_processed(&self, processed: &[ProcessedFileRef]) -> Result<usize> {
        let mut deleted = 0;

        for group in group_by_bucket(processed) {
            self.store.delete_batch(&group.bucket, &group.keys).await?;

            metrics::counter!("shipments.files.deleted", "bucket" => group.bucket.clone())
                .increment(group.keys.len() as u64);
            info!(bucket = %group.bucket, count = group.keys.len(), "Deleted processed files");
            deleted += group.keys.len();
        }

        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{AggregatorError, StoreOperation};
    use crate::object_store::{MemoryObjectStore, MockObjectStore};
    use tokio_test::assert_ok;

    fn file(bucket: &str, key: &str) -> ProcessedFileRef {
        ProcessedFileRef {
            bucket: bucket.to_string(),
            key: key.to_string(),
        }
    }

    #[test]
    fn test_group_by_bucket_keeps_order() {
        let groups = group_by_bucket(&[
            file("scanner", "T1--a"),
            file("mobile", "T2--a"),
            file("scanner", "T3--a"),
        ]);

        assert_eq!(
            groups,
            vec![
                BucketDeletion {
                    bucket: "scanner".to_string(),
                    keys: vec!["T1--a".to_string(), "T3--a".to_string()],
                },
                BucketDeletion {
                    bucket: "mobile".to_string(),
                    keys: vec!["T2--a".to_string()],
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_deletes_only_processed_keys() {
        let store = Arc::new(MemoryObjectStore::new());
        store.insert("scanner", "T1--a", "x");
        store.insert("scanner", "T9--bad", "garbage");
        store.insert("mobile", "T2--a", "x");

        let cleanup = CleanupCoordinator::new(store.clone());
        let deleted = cleanup
            .delete_processed(&[file("scanner", "T1--a"), file("mobile", "T2--a")])
            .await
            .unwrap();

        assert_eq!(deleted, 2);
        assert_eq!(store.keys("scanner"), vec!["T9--bad"]);
        assert!(store.keys("mobile").is_empty());
        assert_eq!(store.delete_calls().len(), 2);
    }

    #[tokio::test]
    async fn test_nothing_processed_means_no_calls() {
        let mut store = MockObjectStore::new();
        store.expect_delete_batch().never();

        let cleanup = CleanupCoordinator::new(Arc::new(store));
        assert_ok!(cleanup.delete_processed(&[]).await);
    }

    #[tokio::test]
    async fn test_delete_failure_surfaces() {
        let store = Arc::new(MemoryObjectStore::new());
        store.insert("scanner", "T1--a", "x");
        store.insert("mobile", "T2--a", "x");
        store.fail_on(StoreOperation::Delete, "mobile", "access denied");

        let cleanup = CleanupCoordinator::new(store.clone());
        let err = cleanup
            .delete_processed(&[file("scanner", "T1--a"), file("mobile", "T2--a")])
            .await
            .unwrap_err();

        assert!(matches!(err, AggregatorError::Store { operation: StoreOperation::Delete, .. }));
        assert!(store.keys("scanner").is_empty());
        assert_eq!(store.keys("mobile"), vec!["T2--a"]);
    }
}
