//! In-memory telemetry sink
//!
//! The default sink for tests and short-lived processes. Everything lives
//! in three vectors behind one lock; append order doubles as the time
//! order for "most recent" queries.

use super::{LogEvent, RunRecord, TelemetrySink, ThroughputSample};
use crate::core::{PipelineType, RagStreamError, Result, RunId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;

#[derive(Debug, Default)]
struct Tables {
    logs: Vec<LogEvent>,
    run_info: Vec<RunRecord>,
    throughput: Vec<ThroughputSample>,
}

/// Telemetry sink backed by process memory.
#[derive(Debug, Default)]
pub struct InMemorySink {
    tables: Mutex<Tables>,
}

impl InMemorySink {
    /// Creates an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of stored log events, across all runs.
    pub fn event_count(&self) -> usize {
        self.tables.lock().logs.len()
    }
}

#[async_trait]
impl TelemetrySink for InMemorySink {
    async fn log(&self, run_id: RunId, key: &str, value: serde_json::Value) -> Result<()> {
        self.tables.lock().logs.push(LogEvent {
            timestamp: Utc::now(),
            run_id,
            key: key.to_string(),
            value,
        });
        Ok(())
    }

    async fn record_run(&self, run_id: RunId, pipeline_type: PipelineType) -> Result<()> {
        let mut tables = self.tables.lock();
        if tables.run_info.iter().any(|r| r.run_id == run_id) {
            return Err(RagStreamError::DuplicateRunInfo { run_id });
        }
        tables.run_info.push(RunRecord {
            timestamp: Utc::now(),
            run_id,
            pipeline_type,
        });
        Ok(())
    }

    async fn recent_runs(
        &self,
        limit: usize,
        pipeline_type: Option<PipelineType>,
    ) -> Result<Vec<RunId>> {
        let tables = self.tables.lock();
        Ok(tables
            .run_info
            .iter()
            .rev()
            .filter(|r| pipeline_type.map_or(true, |t| r.pipeline_type == t))
            .take(limit)
            .map(|r| r.run_id)
            .collect())
    }

    async fn events_for_runs(
        &self,
        run_ids: &[RunId],
        per_run_limit: usize,
    ) -> Result<HashMap<RunId, Vec<LogEvent>>> {
        let tables = self.tables.lock();
        let mut windows: HashMap<RunId, Vec<LogEvent>> =
            run_ids.iter().map(|id| (*id, Vec::new())).collect();
        // Single reverse pass; each run's window fills until its limit.
        for event in tables.logs.iter().rev() {
            if let Some(window) = windows.get_mut(&event.run_id) {
                if window.len() < per_run_limit {
                    window.push(event.clone());
                }
            }
        }
        Ok(windows)
    }

    async fn record_throughput(&self, sample: ThroughputSample) -> Result<()> {
        self.tables.lock().throughput.push(sample);
        Ok(())
    }

    async fn throughput_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        category: Option<&str>,
    ) -> Result<Vec<ThroughputSample>> {
        let tables = self.tables.lock();
        Ok(tables
            .throughput
            .iter()
            .filter(|s| s.timestamp >= start && s.timestamp <= end)
            .filter(|s| category.map_or(true, |c| s.category == c))
            .cloned()
            .collect())
    }

    async fn purge_run(&self, run_id: RunId) -> Result<()> {
        let mut tables = self.tables.lock();
        tables.logs.retain(|e| e.run_id != run_id);
        tables.run_info.retain(|r| r.run_id != run_id);
        Ok(())
    }
}
