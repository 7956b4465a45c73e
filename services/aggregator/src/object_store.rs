//! Object store capability consumed by the aggregator.
//!
//! The pipeline only needs five operations on bucket/key addressed text
//! objects. `S3ObjectStore` backs them with S3; `MemoryObjectStore` keeps
//! everything in process and can simulate a write that is not yet visible
//! to existence checks, or fail individual operations.

use crate::error::{AggregatorError, Result, StoreOperation};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};

/// Bucket/key addressed object storage
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// List every key in a bucket
    async fn list(&self, bucket: &str) -> Result<Vec<String>>;

    /// Read an object as text.
    ///
    /// Bytes that are not valid UTF-8 are replaced rather than rejected, so
    /// binary content reaches the parser and is classified there.
    async fn get_text(&self, bucket: &str, key: &str) -> Result<String>;

    /// Write a text object, replacing any existing one
    async fn put_text(&self, bucket: &str, key: &str, body: &str) -> Result<()>;

    /// Check whether an object is visible
    async fn exists(&self, bucket: &str, key: &str) -> Result<bool>;

    /// Delete a batch of keys from one bucket.
    ///
    /// Missing keys are not an error.
    async fn delete_batch(&self, bucket: &str, keys: &[String]) -> Result<()>;
}

/// Decode object bytes as text, replacing invalid UTF-8 sequences with U+FFFD.
///
/// Returns whether any replacement happened alongside the text.
pub fn decode_text(bytes: &[u8]) -> (String, bool) {
    match String::from_utf8_lossy(bytes) {
        Cow::Borrowed(text) => (text.to_string(), false),
        Cow::Owned(text) => (text, true),
    }
}

/// How long a freshly written object stays invisible to `exists`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum VisibilityLag {
    #[default]
    Immediate,
    /// Hidden for this many existence checks
    Checks(u32),
    Never,
}

#[derive(Debug, Default)]
struct MemoryState {
    buckets: BTreeMap<String, BTreeMap<String, String>>,
    lag: VisibilityLag,
    hidden: HashMap<(String, String), VisibilityLag>,
    failures: HashMap<(StoreOperation, String), String>,
    reads: Vec<(String, String)>,
    deletes: Vec<(String, Vec<String>)>,
    exists_checks: usize,
}

impl MemoryState {
    fn check_failure(&self, operation: StoreOperation, bucket: &str, key: Option<&str>) -> Result<()> {
        match self.failures.get(&(operation, bucket.to_string())) {
            Some(message) => Err(AggregatorError::store(operation, bucket, key, message)),
            None => Ok(()),
        }
    }
}

/// In-memory object store for tests and local runs.
///
/// Keys are listed in lexicographic order, matching S3.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    state: RwLock<MemoryState>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an object without going through the visibility lag
    pub fn insert(&self, bucket: &str, key: &str, contents: &str) {
        self.state
            .write()
            .buckets
            .entry(bucket.to_string())
            .or_default()
            .insert(key.to_string(), contents.to_string());
    }

    /// Seed an object from raw bytes, decoded the way `S3ObjectStore` decodes them
    pub fn insert_bytes(&self, bucket: &str, key: &str, bytes: &[u8]) {
        let (contents, _) = decode_text(bytes);
        self.insert(bucket, key, &contents);
    }

    /// Create an empty bucket
    pub fn create_bucket(&self, bucket: &str) {
        self.state.write().buckets.entry(bucket.to_string()).or_default();
    }

    /// Apply a visibility lag to objects written from now on
    pub fn set_visibility_lag(&self, lag: VisibilityLag) {
        self.state.write().lag = lag;
    }

    /// Make every call of `operation` against `bucket` fail
    pub fn fail_on(&self, operation: StoreOperation, bucket: &str, message: &str) {
        self.state
            .write()
            .failures
            .insert((operation, bucket.to_string()), message.to_string());
    }

    pub fn clear_failures(&self) {
        self.state.write().failures.clear();
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<String> {
        self.state
            .read()
            .buckets
            .get(bucket)
            .and_then(|objects| objects.get(key).cloned())
    }

    pub fn keys(&self, bucket: &str) -> Vec<String> {
        self.state
            .read()
            .buckets
            .get(bucket)
            .map(|objects| objects.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Every (bucket, key) read through `get_text`, in call order
    pub fn reads(&self) -> Vec<(String, String)> {
        self.state.read().reads.clone()
    }

    /// Every `delete_batch` call, in call order
    pub fn delete_calls(&self) -> Vec<(String, Vec<String>)> {
        self.state.read().deletes.clone()
    }

    pub fn exists_checks(&self) -> usize {
        self.state.read().exists_checks
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn list(&self, bucket: &str) -> Result<Vec<String>> {
        let state = self.state.read();
        state.check_failure(StoreOperation::List, bucket, None)?;

        state
            .buckets
            .get(bucket)
            .map(|objects| objects.keys().cloned().collect())
            .ok_or_else(|| AggregatorError::store(StoreOperation::List, bucket, None, "no such bucket"))
    }

    async fn get_text(&self, bucket: &str, key: &str) -> Result<String> {
        let mut state = self.state.write();
        state.check_failure(StoreOperation::Get, bucket, Some(key))?;
        state.reads.push((bucket.to_string(), key.to_string()));

        state
            .buckets
            .get(bucket)
            .and_then(|objects| objects.get(key).cloned())
            .ok_or_else(|| AggregatorError::store(StoreOperation::Get, bucket, Some(key), "no such key"))
    }

    async fn put_text(&self, bucket: &str, key: &str, body: &str) -> Result<()> {
        let mut state = self.state.write();
        state.check_failure(StoreOperation::Put, bucket, Some(key))?;

        state
            .buckets
            .entry(bucket.to_string())
            .or_default()
            .insert(key.to_string(), body.to_string());

        let lag = state.lag;
        if lag != VisibilityLag::Immediate {
            state.hidden.insert((bucket.to_string(), key.to_string()), lag);
        }
        Ok(())
    }

    async fn exists(&self, bucket: &str, key: &str) -> Result<bool> {
        let mut state = self.state.write();
        state.check_failure(StoreOperation::Exists, bucket, Some(key))?;
        state.exists_checks += 1;

        let id = (bucket.to_string(), key.to_string());
        match state.hidden.get(&id).copied() {
            Some(VisibilityLag::Never) => return Ok(false),
            Some(VisibilityLag::Checks(remaining)) => {
                if remaining > 1 {
                    state.hidden.insert(id, VisibilityLag::Checks(remaining - 1));
                } else {
                    state.hidden.remove(&id);
                }
                return Ok(false);
            }
            Some(VisibilityLag::Immediate) | None => {}
        }

        Ok(state
            .buckets
            .get(bucket)
            .map(|objects| objects.contains_key(key))
            .unwrap_or(false))
    }

    async fn delete_batch(&self, bucket: &str, keys: &[String]) -> Result<()> {
        let mut state = self.state.write();
        state.check_failure(StoreOperation::Delete, bucket, None)?;
        state.deletes.push((bucket.to_string(), keys.to_vec()));

        if let Some(objects) = state.buckets.get_mut(bucket) {
            for key in keys {
                objects.remove(key);
            }
        }
        Ok(())
    }
}
