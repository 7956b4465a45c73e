use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Object store operation that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOperation {
    List,
    Get,
    Put,
    Exists,
    Delete,
}

impl StoreOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreOperation::List => "list",
            StoreOperation::Get => "get",
            StoreOperation::Put => "put",
            StoreOperation::Exists => "exists",
            StoreOperation::Delete => "delete",
        }
    }
}

impl fmt::Display for StoreOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that abort an aggregation run
#[derive(Error, Debug)]
pub enum AggregatorError {
    #[error("Object store {operation} failed for {location}: {message}")]
    Store {
        operation: StoreOperation,
        location: String,
        message: String,
    },

    #[error("Malformed timestamp {value:?} in s3://{bucket}/{key}")]
    MalformedTimestamp {
        bucket: String,
        key: String,
        value: String,
    },

    #[error("Summary s3://{bucket}/{key} not visible after {timeout:?}")]
    SummaryNotVisible {
        bucket: String,
        key: String,
        timeout: Duration,
    },

    #[error("Failed to encode summary: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl AggregatorError {
    /// Build a store error for a bucket, or for a single key within it
    pub fn store(
        operation: StoreOperation,
        bucket: &str,
        key: Option<&str>,
        message: impl fmt::Display,
    ) -> Self {
        let location = match key {
            Some(key) => format!("s3://{}/{}", bucket, key),
            None => format!("s3://{}", bucket),
        };

        AggregatorError::Store {
            operation,
            location,
            message: message.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, AggregatorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_location() {
        let err = AggregatorError::store(StoreOperation::Get, "bucket-a", Some("T1--x"), "timeout");
        assert_eq!(
            err.to_string(),
            "Object store get failed for s3://bucket-a/T1--x: timeout"
        );

        let err = AggregatorError::store(StoreOperation::List, "bucket-a", None, "denied");
        assert_eq!(
            err.to_string(),
            "Object store list failed for s3://bucket-a: denied"
        );
    }
}
