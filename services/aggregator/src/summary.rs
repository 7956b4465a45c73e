//! Summary publishing and visibility confirmation.
//!
//! A summary is the JSON encoding of `LatestStatus`, written once per run
//! under a key derived from the wall clock and the run id. The write is not trusted until an
//! existence check sees it; the publisher polls at a fixed interval and gives
//! up after a fixed timeout.

use crate::aggregator::LatestStatus;
use crate::error::{AggregatorError, Result};
use crate::object_store::ObjectStore;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Wall clock used to name summary objects
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The system clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Encode a status map as a summary document
pub fn serialize_summary(latest: &LatestStatus) -> Result<String> {
    Ok(serde_json::to_string_pretty(latest)?)
}

/// Decode a summary document
pub fn parse_summary(body: &str) -> Result<LatestStatus> {
    Ok(serde_json::from_str(body)?)
}

/// Existence polling schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            timeout: Duration::from_secs(60),
        }
    }
}

/// How a visibility poll ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Visible { attempts: u32 },
    TimedOut { attempts: u32 },
}

/// Check for an object until it is visible or the timeout elapses.
///
/// Checks immediately, then once per interval. The last check happens at or
/// just before the deadline, never after it.
pub async fn wait_until_visible(
    store: &dyn ObjectStore,
    bucket: &str,
    key: &str,
    policy: PollPolicy,
) -> Result<PollOutcome> {
    // A timeout past the end of the clock never expires
    let deadline = Instant::now().checked_add(policy.timeout);
    let mut attempts = 0;

    loop {
        attempts += 1;
        if store.exists(bucket, key).await? {
            return Ok(PollOutcome::Visible { attempts });
        }

        let now = Instant::now();
        let pause = match deadline {
            Some(deadline) if now >= deadline => return Ok(PollOutcome::TimedOut { attempts }),
            Some(deadline) => policy.interval.min(deadline - now),
            None => policy.interval,
        };

        debug!(bucket = %bucket, key = %key, attempts, "Waiting for summary to become visible");
        tokio::time::sleep(pause).await;
    }
}

/// A summary object that has been written
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedSummary {
    pub bucket: String,
    pub key: String,
    pub entries: usize,
}

/// Writes summaries and confirms they are visible
pub struct SummaryPublisher {
    store: Arc<dyn ObjectStore>,
    bucket: String,
    prefix: String,
    poll: PollPolicy,
    clock: Arc<dyn Clock>,
}

impl SummaryPublisher {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        bucket: impl Into<String>,
        prefix: impl Into<String>,
        poll: PollPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            bucket: bucket.into(),
            prefix: prefix.into(),
            poll,
            clock,
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Key for a summary written now by `run_id`.
    ///
    /// Keys sort by time; the run id keeps two runs in the same millisecond
    /// from overwriting each other.
    pub fn summary_key(&self, run_id: Uuid) -> String {
        format!("{}{}-{}", self.prefix, self.clock.now().timestamp_millis(), run_id)
    }

    /// Write the summary object
    #[instrument(skip(self, latest), fields(bucket = %self.bucket, entries = latest.len()))]
    pub async fn publish(&self, run_id: Uuid, latest: &LatestStatus) -> Result<PublishedSummary> {
        let body = serialize_summary(latest)?;
        let key = self.summary_key(run_id);

        self.store.put_text(&self.bucket, &key, &body).await?;

        info!(key = %key, size_bytes = body.len(), "Summary written");

        Ok(PublishedSummary {
            bucket: self.bucket.clone(),
            key,
            entries: latest.len(),
        })
    }

    /// Wait for a written summary to become visible.
    ///
    /// Returns the number of existence checks made.
    #[instrument(skip(self, summary), fields(bucket = %summary.bucket, key = %summary.key))]
    pub async fn confirm(&self, summary: &PublishedSummary) -> Result<u32> {
        let outcome =
            wait_until_visible(self.store.as_ref(), &summary.bucket, &summary.key, self.poll).await?;

        match outcome {
            PollOutcome::Visible { attempts } => {
                metrics::counter!("shipments.summary.poll_attempts").increment(u64::from(attempts));
                info!(attempts, "Summary visible");
                Ok(attempts)
            }
            PollOutcome::TimedOut { attempts } => {
                metrics::counter!("shipments.summary.poll_attempts").increment(u64::from(attempts));
                warn!(attempts, timeout = ?self.poll.timeout, "Summary not visible before timeout");
                Err(AggregatorError::SummaryNotVisible {
                    bucket: summary.bucket.clone(),
                    key: summary.key.clone(),
                    timeout: self.poll.timeout,
                })
            }
        }
    }
}
