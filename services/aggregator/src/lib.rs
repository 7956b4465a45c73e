//! Shipment Event Aggregator
//!
//! Shipment status updates arrive as individual files in several S3 buckets,
//! one bucket per event source (hand-held scanners, the mobile app, ...).
//! Every run folds all of them into the latest status per tracking number,
//! publishes that as a summary object, waits until the summary is visible and
//! only then deletes the source files it consumed.
//!
//! ## Architecture
//!
//! ```text
//! Source Buckets              Summary Bucket
//! ┌──────────────┐           ┌──────────────┐
//! │ scanner      │           │ {millis}-{id}│
//! │ mobile-app   │           └──────────────┘
//! └──────────────┘                  ▲
//!        │                          │ put + poll
//!        ▼                          │
//! ┌──────────────┐           ┌──────────────┐
//! │ Status       │──────────▶│ Summary      │
//! │ Aggregator   │           │ Publisher    │
//! └──────────────┘           └──────────────┘
//!        │                          │ visible
//!        │ processed files          ▼
//!        │                   ┌──────────────┐
//!        └──────────────────▶│ Cleanup      │
//!                            └──────────────┘
//! ```
//!
//! Any failure aborts the run before cleanup; the next scheduled run
//! reprocesses the same files. Runs from separate processes are not
//! coordinated, so only one scheduler should be deployed per set of buckets.

pub mod aggregator;
pub mod cleanup;
pub mod config;
pub mod error;
pub mod object_store;
pub mod orchestrator;
pub mod parser;
pub mod s3_store;
pub mod summary;

pub use aggregator::{
    Aggregation, BucketFold, FoldEffect, FoldStats, LatestStatus, ProcessedFileRef,
    StatusAggregator, TrackedStatus, TERMINAL_STATUS,
};
pub use cleanup::{BucketDeletion, CleanupCoordinator};
pub use config::{Config, ConfigError, MalformedTimestampPolicy};
pub use error::{AggregatorError, StoreOperation};
pub use object_store::{decode_text, MemoryObjectStore, ObjectStore, VisibilityLag};
pub use orchestrator::{ProcessorBuilder, RunError, RunReport, RunState, ShipmentEventProcessor};
pub use parser::{parse_event_file, ParseError, ParseOutcome, StatusRecord};
pub use s3_store::S3ObjectStore;
pub use summary::{
    parse_summary, serialize_summary, Clock, PollOutcome, PollPolicy, PublishedSummary,
    SummaryPublisher, SystemClock,
};
