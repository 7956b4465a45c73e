use crate::aggregator::StatusAggregator;
use crate::cleanup::CleanupCoordinator;
use crate::config::{Config, MalformedTimestampPolicy};
use crate::error::AggregatorError;
use crate::object_store::ObjectStore;
use crate::summary::{Clock, PollPolicy, SummaryPublisher, SystemClock};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, error, info, info_span, Instrument};
use uuid::Uuid;

/// Stage of a single run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Start,
    ProcessingBuckets,
    Publishing,
    Confirming,
    Cleaning,
    Done,
    Failed,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Start => "start",
            RunState::ProcessingBuckets => "processing_buckets",
            RunState::Publishing => "publishing",
            RunState::Confirming => "confirming",
            RunState::Cleaning => "cleaning",
            RunState::Done => "done",
            RunState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Done | RunState::Failed)
    }

    /// Whether a run may move from this state to `next`
    pub fn can_transition_to(&self, next: RunState) -> bool {
        use RunState::*;

        matches!(
            (self, next),
            (Start, ProcessingBuckets)
                | (ProcessingBuckets, Publishing)
                | (Publishing, Confirming)
                | (Confirming, Cleaning)
                | (Cleaning, Done)
                | (ProcessingBuckets, Failed)
                | (Publishing, Failed)
                | (Confirming, Failed)
                | (Cleaning, Failed)
        )
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed run. The whole run is retried by the next scheduled invocation.
#[derive(Error, Debug)]
#[error("Run {run_id} failed while {state}: {source}; will be retried on the next scheduled run")]
pub struct RunError {
    pub run_id: Uuid,
    /// State the run was in when it failed
    pub state: RunState,
    pub source: AggregatorError,
}

/// Outcome of a successful run
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: Uuid,
    pub summary_bucket: String,
    pub summary_key: String,
    pub tracking_numbers: usize,
    pub files_processed: usize,
    pub files_deleted: usize,
    pub skipped_invalid: usize,
    pub skipped_delivered: usize,
    pub poll_attempts: u32,
    /// Every state the run passed through, in order
    pub states: Vec<RunState>,
}

struct RunTracker {
    run_id: Uuid,
    state: RunState,
    states: Vec<RunState>,
}

impl RunTracker {
    fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            state: RunState::Start,
            states: vec![RunState::Start],
        }
    }

    fn advance(&mut self, next: RunState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal run transition {} -> {}",
            self.state,
            next
        );
        debug!(from = %self.state, to = %next, "Run state transition");
        self.state = next;
        self.states.push(next);
    }

    fn fail(&mut self, source: AggregatorError) -> RunError {
        let state = self.state;
        self.advance(RunState::Failed);
        RunError {
            run_id: self.run_id,
            state,
            source,
        }
    }
}

/// Sequences aggregation, publishing, confirmation and cleanup for one run
pub struct ShipmentEventProcessor {
    source_buckets: Vec<String>,
    aggregator: StatusAggregator,
    publisher: SummaryPublisher,
    cleanup: CleanupCoordinator,
}

impl ShipmentEventProcessor {
    /// Build a processor from service configuration
    pub fn from_config(store: Arc<dyn ObjectStore>, config: &Config) -> Self {
        ProcessorBuilder::new(store)
            .source_buckets(config.aggregation.source_buckets.clone())
            .summary_bucket(config.publish.summary_bucket.clone())
            .summary_prefix(config.publish.summary_prefix.clone())
            .poll_policy(PollPolicy {
                interval: config.poll_interval(),
                timeout: config.poll_timeout(),
            })
            .malformed_timestamp(config.aggregation.malformed_timestamp)
            .build()
    }

    pub fn builder(store: Arc<dyn ObjectStore>) -> ProcessorBuilder {
        ProcessorBuilder::new(store)
    }

    pub fn source_buckets(&self) -> &[String] {
        &self.source_buckets
    }

    /// Execute one run
    pub async fn run(&self) -> Result<RunReport, RunError> {
        let run_id = Uuid::new_v4();
        let started = Instant::now();

        let result = self
            .execute(run_id)
            .instrument(info_span!("run", run_id = %run_id))
            .await;

        metrics::histogram!("shipments.run.duration_seconds")
            .record(started.elapsed().as_secs_f64());

        match &result {
            Ok(report) => {
                metrics::counter!("shipments.runs.succeeded").increment(1);
                info!(
                    run_id = %run_id,
                    summary_key = %report.summary_key,
                    tracking_numbers = report.tracking_numbers,
                    files_processed = report.files_processed,
                    files_deleted = report.files_deleted,
                    "All updates successfully processed"
                );
            }
            Err(e) => {
                metrics::counter!("shipments.runs.failed", "state" => e.state.as_str()).increment(1);
                error!(run_id = %run_id, state = %e.state, error = %e.source, "Run failed");
            }
        }

        result
    }

    async fn execute(&self, run_id: Uuid) -> Result<RunReport, RunError> {
        let mut run = RunTracker::new(run_id);

        run.advance(RunState::ProcessingBuckets);
        let aggregation = self
            .aggregator
            .fold_buckets(&self.source_buckets)
            .await
            .map_err(|e| run.fail(e))?;

        debug!(statuses = ?aggregation.latest, "Aggregated statuses");

        run.advance(RunState::Publishing);
        let summary = self
            .publisher
            .publish(run_id, &aggregation.latest)
            .await
            .map_err(|e| run.fail(e))?;

        run.advance(RunState::Confirming);
        let poll_attempts = self
            .publisher
            .confirm(&summary)
            .await
            .map_err(|e| run.fail(e))?;

        run.advance(RunState::Cleaning);
        let files_deleted = self
            .cleanup
            .delete_processed(&aggregation.processed)
            .await
            .map_err(|e| run.fail(e))?;

        run.advance(RunState::Done);

        Ok(RunReport {
            run_id,
            summary_bucket: summary.bucket,
            summary_key: summary.key,
            tracking_numbers: aggregation.latest.len(),
            files_processed: aggregation.processed.len(),
            files_deleted,
            skipped_invalid: aggregation.stats.skipped_invalid,
            skipped_delivered: aggregation.stats.skipped_delivered,
            poll_attempts,
            states: run.states,
        })
    }
}

/// Builder for creating a ShipmentEventProcessor with custom settings
pub struct ProcessorBuilder {
    store: Arc<dyn ObjectStore>,
    source_buckets: Vec<String>,
    summary_bucket: String,
    summary_prefix: String,
    poll: PollPolicy,
    clock: Arc<dyn Clock>,
    malformed_timestamp: MalformedTimestampPolicy,
}

impl ProcessorBuilder {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        let defaults = Config::default();

        Self {
            store,
            source_buckets: defaults.aggregation.source_buckets,
            summary_bucket: defaults.publish.summary_bucket,
            summary_prefix: defaults.publish.summary_prefix,
            poll: PollPolicy::default(),
            clock: Arc::new(SystemClock),
            malformed_timestamp: MalformedTimestampPolicy::default(),
        }
    }

    pub fn source_buckets(mut self, buckets: Vec<String>) -> Self {
        self.source_buckets = buckets;
        self
    }

    pub fn summary_bucket(mut self, bucket: impl Into<String>) -> Self {
        self.summary_bucket = bucket.into();
        self
    }

    pub fn summary_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.summary_prefix = prefix.into();
        self
    }

    pub fn poll_policy(mut self, poll: PollPolicy) -> Self {
        self.poll = poll;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn malformed_timestamp(mut self, policy: MalformedTimestampPolicy) -> Self {
        self.malformed_timestamp = policy;
        self
    }

    pub fn build(self) -> ShipmentEventProcessor {
        ShipmentEventProcessor {
            source_buckets: self.source_buckets,
            aggregator: StatusAggregator::new(self.store.clone(), self.malformed_timestamp),
            publisher: SummaryPublisher::new(
                self.store.clone(),
                self.summary_bucket,
                self.summary_prefix,
                self.poll,
                self.clock,
            ),
            cleanup: CleanupCoordinator::new(self.store),
        }
    }
}
