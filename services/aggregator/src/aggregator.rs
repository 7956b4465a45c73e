use crate::config::MalformedTimestampPolicy;
use crate::error::{AggregatorError, Result};
use crate::object_store::ObjectStore;
use crate::parser::{self, ParseError, ParseOutcome, StatusRecord};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Once a shipment reaches this status no further updates are applied
pub const TERMINAL_STATUS: &str = "DELIVERED";

/// Latest known status of one shipment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedStatus {
    /// Event time in epoch seconds
    pub timestamp: i64,
    pub status: String,
}

impl TrackedStatus {
    pub fn is_terminal(&self) -> bool {
        self.status == TERMINAL_STATUS
    }
}

/// How a record changed the aggregate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FoldEffect {
    /// First record for the tracking number
    Inserted,
    /// Strictly newer than the previous entry
    Replaced,
    /// Older, equal, or the shipment was already delivered
    Kept,
}

/// Latest status per tracking number
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LatestStatus {
    entries: BTreeMap<String, TrackedStatus>,
}

impl LatestStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, tracking_number: &str) -> Option<&TrackedStatus> {
        self.entries.get(tracking_number)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in tracking number order
    pub fn iter(&self) -> impl Iterator<Item = (&String, &TrackedStatus)> {
        self.entries.iter()
    }

    pub fn is_delivered(&self, tracking_number: &str) -> bool {
        self.get(tracking_number)
            .map(TrackedStatus::is_terminal)
            .unwrap_or(false)
    }

    /// Fold one record in, keeping the strictly newest per tracking number
    pub fn fold(&mut self, record: StatusRecord) -> FoldEffect {
        let incoming = TrackedStatus {
            timestamp: record.timestamp,
            status: record.status,
        };

        match self.entries.get_mut(&record.tracking_number) {
            None => {
                self.entries.insert(record.tracking_number, incoming);
                FoldEffect::Inserted
            }
            Some(current) if current.is_terminal() => FoldEffect::Kept,
            Some(current) if incoming.timestamp > current.timestamp => {
                *current = incoming;
                FoldEffect::Replaced
            }
            Some(_) => FoldEffect::Kept,
        }
    }
}

/// A source file folded into the aggregate, deletable once the summary is visible
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProcessedFileRef {
    pub bucket: String,
    pub key: String,
}

/// Counters for one or more bucket folds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FoldStats {
    pub listed: usize,
    pub read: usize,
    pub processed: usize,
    pub skipped_invalid: usize,
    pub skipped_delivered: usize,
}

impl FoldStats {
    fn merge(&mut self, other: FoldStats) {
        self.listed += other.listed;
        self.read += other.read;
        self.processed += other.processed;
        self.skipped_invalid += other.skipped_invalid;
        self.skipped_delivered += other.skipped_delivered;
    }
}

/// Result of folding one bucket into the accumulator
#[derive(Debug, Clone, Default)]
pub struct BucketFold {
    pub latest: LatestStatus,
    pub processed: Vec<ProcessedFileRef>,
    pub stats: FoldStats,
}

/// Result of folding every source bucket
#[derive(Debug, Clone, Default)]
pub struct Aggregation {
    pub latest: LatestStatus,
    pub processed: Vec<ProcessedFileRef>,
    pub stats: FoldStats,
}

/// Folds shipment event files from source buckets into a `LatestStatus`
pub struct StatusAggregator {
    store: Arc<dyn ObjectStore>,
    timestamp_policy: MalformedTimestampPolicy,
}

impl StatusAggregator {
    pub fn new(store: Arc<dyn ObjectStore>, timestamp_policy: MalformedTimestampPolicy) -> Self {
        Self {
            store,
            timestamp_policy,
        }
    }

    /// Fold every bucket in order, threading one accumulator through all of them
    pub async fn fold_buckets(&self, buckets: &[String]) -> Result<Aggregation> {
        let mut aggregation = Aggregation::default();

        for bucket in buckets {
            let fold = self
                .fold_bucket(bucket, std::mem::take(&mut aggregation.latest))
                .await?;

            aggregation.latest = fold.latest;
            aggregation.processed.extend(fold.processed);
            aggregation.stats.merge(fold.stats);
        }

        Ok(aggregation)
    }

    /// Fold one bucket's files into `latest` and return the updated accumulator
    #[instrument(skip(self, latest), fields(tracked = latest.len()))]
    pub async fn fold_bucket(&self, bucket: &str, mut latest: LatestStatus) -> Result<BucketFold> {
        info!(bucket = %bucket, "Processing bucket");

        let keys = self.store.list(bucket).await?;
        let mut processed = Vec::new();
        let mut stats = FoldStats {
            listed: keys.len(),
            ..FoldStats::default()
        };

        for key in keys {
            let tracking_number = parser::tracking_number(&key);

            // Closed shipments are retired without reading the file
            if latest.is_delivered(tracking_number) {
                debug!(bucket = %bucket, key = %key, "Shipment already delivered, skipping read");
                stats.skipped_delivered += 1;
                metrics::counter!("shipments.files.skipped", "reason" => "delivered").increment(1);
                processed.push(ProcessedFileRef {
                    bucket: bucket.to_string(),
                    key,
                });
                continue;
            }

            let contents = self.store.get_text(bucket, &key).await?;
            stats.read += 1;

            let record = match parser::parse_event_file(&key, &contents) {
                Ok(ParseOutcome::Valid(record)) => record,
                Ok(ParseOutcome::Invalid { reason }) => {
                    warn!(bucket = %bucket, key = %key, reason = %reason, "Skipping invalid file");
                    stats.skipped_invalid += 1;
                    metrics::counter!("shipments.files.skipped", "reason" => "invalid").increment(1);
                    continue;
                }
                Err(ParseError::MalformedTimestamp { key, value }) => match self.timestamp_policy {
                    MalformedTimestampPolicy::Fail => {
                        return Err(AggregatorError::MalformedTimestamp {
                            bucket: bucket.to_string(),
                            key,
                            value,
                        });
                    }
                    MalformedTimestampPolicy::Skip => {
                        warn!(
                            bucket = %bucket,
                            key = %key,
                            value = %value,
                            "Skipping file with malformed timestamp"
                        );
                        stats.skipped_invalid += 1;
                        metrics::counter!("shipments.files.skipped", "reason" => "malformed_timestamp")
                            .increment(1);
                        continue;
                    }
                },
            };

            let effect = latest.fold(record);
            debug!(
                bucket = %bucket,
                key = %key,
                tracking_number = %tracking_number,
                effect = ?effect,
                "Folded status update"
            );

            stats.processed += 1;
            metrics::counter!("shipments.files.processed", "bucket" => bucket.to_string()).increment(1);
            processed.push(ProcessedFileRef {
                bucket: bucket.to_string(),
                key,
            });
        }

        info!(
            bucket = %bucket,
            listed = stats.listed,
            processed = stats.processed,
            skipped_invalid = stats.skipped_invalid,
            skipped_delivered = stats.skipped_delivered,
            "Bucket processed"
        );

        Ok(BucketFold {
            latest,
            processed,
            stats,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreOperation;
    use crate::object_store::{MemoryObjectStore, MockObjectStore};

    fn record(tracking_number: &str, timestamp: i64, status: &str) -> StatusRecord {
        StatusRecord {
            tracking_number: tracking_number.to_string(),
            timestamp,
            status: status.to_string(),
        }
    }

    fn file(status: &str, timestamp: i64) -> String {
        format!("status:{}\ntimestamp:{}", status, timestamp)
    }

    fn buckets(names: &[&str]) -> Vec<String> {
        names.iter().map(|name| name.to_string()).collect()
    }

    fn aggregator(store: Arc<dyn ObjectStore>) -> StatusAggregator {
        StatusAggregator::new(store, MalformedTimestampPolicy::Fail)
    }

    #[test]
    fn test_fold_keeps_strictly_newest() {
        let mut latest = LatestStatus::new();
        assert_eq!(latest.fold(record("T1", 100, "PICKED UP")), FoldEffect::Inserted);
        assert_eq!(latest.fold(record("T1", 50, "CREATED")), FoldEffect::Kept);
        assert_eq!(latest.fold(record("T1", 100, "OTHER")), FoldEffect::Kept);
        assert_eq!(latest.fold(record("T1", 150, "IN TRANSIT")), FoldEffect::Replaced);

        let entry = latest.get("T1").unwrap();
        assert_eq!(entry.timestamp, 150);
        assert_eq!(entry.status, "IN TRANSIT");
    }

    #[test]
    fn test_fold_delivered_is_terminal() {
        let mut latest = LatestStatus::new();
        latest.fold(record("T1", 100, "DELIVERED"));
        assert_eq!(latest.fold(record("T1", 500, "RETURNED")), FoldEffect::Kept);
        assert!(latest.is_delivered("T1"));
        assert_eq!(latest.get("T1").unwrap().timestamp, 100);
    }

    #[tokio::test]
    async fn test_cross_bucket_example() {
        let store = Arc::new(MemoryObjectStore::new());
        store.insert("bucket-a", "T1--x", "status:IN TRANSIT\ntimestamp:100");
        store.insert("bucket-b", "T1--y", "status:DELIVERED\ntimestamp:200");

        let aggregation = aggregator(store.clone())
            .fold_buckets(&buckets(&["bucket-a", "bucket-b"]))
            .await
            .unwrap();

        let entry = aggregation.latest.get("T1").unwrap();
        assert_eq!(entry.timestamp, 200);
        assert_eq!(entry.status, "DELIVERED");
        assert_eq!(
            aggregation.processed,
            vec![
                ProcessedFileRef {
                    bucket: "bucket-a".to_string(),
                    key: "T1--x".to_string()
                },
                ProcessedFileRef {
                    bucket: "bucket-b".to_string(),
                    key: "T1--y".to_string()
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_delivered_files_skipped_without_read() {
        let store = Arc::new(MemoryObjectStore::new());
        store.insert("bucket-a", "T1--a", &file("DELIVERED", 200));
        store.insert("bucket-b", "T1--b", &file("RETURNED", 900));

        let aggregation = aggregator(store.clone())
            .fold_buckets(&buckets(&["bucket-a", "bucket-b"]))
            .await
            .unwrap();

        assert_eq!(aggregation.latest.get("T1").unwrap().status, "DELIVERED");
        assert_eq!(aggregation.processed.len(), 2);
        assert_eq!(aggregation.stats.skipped_delivered, 1);
        assert_eq!(
            store.reads(),
            vec![("bucket-a".to_string(), "T1--a".to_string())]
        );
    }

    #[tokio::test]
    async fn test_superseded_files_still_processed() {
        let store = Arc::new(MemoryObjectStore::new());
        store.insert("bucket-a", "T1--a", &file("IN TRANSIT", 300));
        store.insert("bucket-a", "T1--b", &file("PICKED UP", 100));

        let aggregation = aggregator(store)
            .fold_buckets(&buckets(&["bucket-a"]))
            .await
            .unwrap();

        assert_eq!(aggregation.latest.get("T1").unwrap().timestamp, 300);
        assert_eq!(aggregation.processed.len(), 2);
        assert_eq!(aggregation.stats.processed, 2);
    }

    #[tokio::test]
    async fn test_invalid_files_not_processed() {
        let store = Arc::new(MemoryObjectStore::new());
        store.insert("bucket-a", "T1--a", "garbage");
        store.insert("bucket-a", "T2--a", "status:IN TRANSIT\nno separator here");
        store.insert("bucket-a", "T3--a", &file("IN TRANSIT", 10));

        let aggregation = aggregator(store)
            .fold_buckets(&buckets(&["bucket-a"]))
            .await
            .unwrap();

        assert_eq!(aggregation.latest.len(), 1);
        assert!(aggregation.latest.get("T1").is_none());
        assert_eq!(aggregation.stats.skipped_invalid, 2);
        assert_eq!(
            aggregation.processed,
            vec![ProcessedFileRef {
                bucket: "bucket-a".to_string(),
                key: "T3--a".to_string()
            }]
        );
    }

    #[tokio::test]
    async fn test_binary_file_skipped_as_invalid() {
        let store = Arc::new(MemoryObjectStore::new());
        store.insert_bytes("bucket-a", "T1--a", &[0xff, 0x0a]);
        store.insert("bucket-a", "T2--a", &file("IN TRANSIT", 10));

        let aggregation = aggregator(store.clone())
            .fold_buckets(&buckets(&["bucket-a"]))
            .await
            .unwrap();

        assert_eq!(aggregation.stats.skipped_invalid, 1);
        assert!(aggregation.latest.get("T1").is_none());
        assert_eq!(
            aggregation.processed,
            vec![ProcessedFileRef {
                bucket: "bucket-a".to_string(),
                key: "T2--a".to_string()
            }]
        );
        assert_eq!(store.reads().len(), 2);
    }

    #[tokio::test]
    async fn test_malformed_timestamp_fails_by_default() {
        let store = Arc::new(MemoryObjectStore::new());
        store.insert("bucket-a", "T1--a", "status:IN TRANSIT\ntimestamp:soon");

        let err = aggregator(store)
            .fold_buckets(&buckets(&["bucket-a"]))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            AggregatorError::MalformedTimestamp { ref bucket, ref key, ref value }
                if bucket == "bucket-a" && key == "T1--a" && value == "soon"
        ));
    }

    #[tokio::test]
    async fn test_malformed_timestamp_skip_policy() {
        let store = Arc::new(MemoryObjectStore::new());
        store.insert("bucket-a", "T1--a", "status:IN TRANSIT\ntimestamp:soon");
        store.insert("bucket-a", "T2--a", &file("IN TRANSIT", 10));

        let aggregation = StatusAggregator::new(store, MalformedTimestampPolicy::Skip)
            .fold_buckets(&buckets(&["bucket-a"]))
            .await
            .unwrap();

        assert_eq!(aggregation.stats.skipped_invalid, 1);
        assert_eq!(aggregation.processed.len(), 1);
        assert!(aggregation.latest.get("T1").is_none());
    }

    #[tokio::test]
    async fn test_fold_bucket_threads_accumulator() {
        let store = Arc::new(MemoryObjectStore::new());
        store.insert("bucket-b", "T1--b", &file("IN TRANSIT", 50));

        let mut latest = LatestStatus::new();
        latest.fold(record("T1", 80, "OUT FOR DELIVERY"));
        latest.fold(record("T2", 10, "CREATED"));

        let fold = aggregator(store).fold_bucket("bucket-b", latest).await.unwrap();

        assert_eq!(fold.latest.len(), 2);
        assert_eq!(fold.latest.get("T1").unwrap().status, "OUT FOR DELIVERY");
        assert_eq!(fold.processed.len(), 1);
    }

    #[tokio::test]
    async fn test_list_failure_aborts() {
        let mut store = MockObjectStore::new();
        store.expect_list().returning(|bucket| {
            Err(AggregatorError::store(StoreOperation::List, bucket, None, "access denied"))
        });
        store.expect_get_text().never();

        let err = aggregator(Arc::new(store))
            .fold_buckets(&buckets(&["bucket-a"]))
            .await
            .unwrap_err();

        assert!(err.to_string().contains("access denied"));
    }

    #[tokio::test]
    async fn test_order_of_buckets_decides_ties() {
        let store = Arc::new(MemoryObjectStore::new());
        store.insert("bucket-a", "T1--a", &file("FROM A", 100));
        store.insert("bucket-b", "T1--b", &file("FROM B", 100));

        let aggregation = aggregator(store.clone())
            .fold_buckets(&buckets(&["bucket-b", "bucket-a"]))
            .await
            .unwrap();

        assert_eq!(aggregation.latest.get("T1").unwrap().status, "FROM B");
        assert_eq!(aggregation.processed.len(), 2);
    }
}
