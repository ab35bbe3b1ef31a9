//! Run telemetry
//!
//! Pluggable persistence for per-run event logs, run metadata and
//! throughput samples, plus the read-side analytics derived from them.
//! Storage schema (backend-agnostic):
//!
//! - `logs(timestamp, run_id, key, value)` - append-only
//! - `run_info(timestamp, run_id UNIQUE, pipeline_type)` - one per run
//! - `throughput(timestamp, count, category)` - range-queried samples
//!
//! Telemetry is best-effort everywhere in the engine: a failing sink is
//! logged locally and never aborts a pipeline run.

pub mod analytics;
pub mod file;
pub mod memory;

pub use analytics::{analyze, ErrorBucket, RunAnalytics};
pub use file::FileSink;
pub use memory::InMemorySink;

use crate::core::{PipelineType, Result, RunId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Well-known log event keys the engine and analytics agree on.
pub mod keys {
    /// A provider or stage error; the value carries the error code/message.
    pub const ERROR: &str = "error";
    /// The query text a search pipe received.
    pub const SEARCH_QUERY: &str = "search_query";
    /// Serialized search results a search pipe produced.
    pub const SEARCH_RESULTS: &str = "search_results";
    /// One retrieval relevance score.
    pub const RELEVANCE_SCORE: &str = "relevance_score";
    /// Graph-search latency in milliseconds.
    pub const GRAPH_SEARCH_LATENCY_MS: &str = "graph_search_latency_ms";
    /// Generation latency in milliseconds.
    pub const GENERATION_LATENCY_MS: &str = "generation_latency_ms";
}

/// One append-only log event, always tied to a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    /// When the event was recorded
    pub timestamp: DateTime<Utc>,
    /// The run this event belongs to
    pub run_id: RunId,
    /// Event key, e.g. `"error"` or `"search_results"`
    pub key: String,
    /// Event payload
    pub value: serde_json::Value,
}

/// One-time metadata record for a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    /// When the run was opened
    pub timestamp: DateTime<Utc>,
    /// The run identifier; unique per record
    pub run_id: RunId,
    /// Pipeline type the run executed
    pub pipeline_type: PipelineType,
}

/// One throughput sample for analytics range queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThroughputSample {
    /// When the sample was taken
    pub timestamp: DateTime<Utc>,
    /// Item count observed in the sample window
    pub count: u64,
    /// Sample category, e.g. `"fragments"` or `"queries"`
    pub category: String,
}

/// Pluggable storage/query backend for run telemetry.
///
/// Implementations must be safe for concurrent use by multiple pipes'
/// background log workers; connections are opened lazily.
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    /// Appends one log event for a run.
    async fn log(&self, run_id: RunId, key: &str, value: serde_json::Value) -> Result<()>;

    /// Appends the one-time run-info record. A second record for the same
    /// run id is a [`crate::core::RagStreamError::DuplicateRunInfo`] error.
    async fn record_run(&self, run_id: RunId, pipeline_type: PipelineType) -> Result<()>;

    /// The up-to-`limit` most recent run ids, newest first, optionally
    /// filtered by pipeline type.
    async fn recent_runs(
        &self,
        limit: usize,
        pipeline_type: Option<PipelineType>,
    ) -> Result<Vec<RunId>>;

    /// Up to `per_run_limit` most recent events (newest first) for each of
    /// the given run ids, gathered in a single pass over storage rather
    /// than one scan per run.
    async fn events_for_runs(
        &self,
        run_ids: &[RunId],
        per_run_limit: usize,
    ) -> Result<HashMap<RunId, Vec<LogEvent>>>;

    /// Appends one throughput sample.
    async fn record_throughput(&self, sample: ThroughputSample) -> Result<()>;

    /// Samples in `[start, end]`, optionally filtered by category,
    /// oldest first.
    async fn throughput_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        category: Option<&str>,
    ) -> Result<Vec<ThroughputSample>>;

    /// Explicit retention cleanup: removes the run record and every log
    /// event for the given run.
    async fn purge_run(&self, run_id: RunId) -> Result<()>;
}
