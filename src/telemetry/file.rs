//! File-backed telemetry sink
//!
//! Append-only JSONL persistence: one file per logical table
//! (`logs.jsonl`, `run_info.jsonl`, `throughput.jsonl`) under a base
//! directory. File handles are opened lazily on first write and shared
//! behind async locks, so any number of pipes' background log workers can
//! append concurrently. Queries re-read the files; this sink favors
//! durability and simplicity over query speed.

use super::{LogEvent, RunRecord, TelemetrySink, ThroughputSample};
use crate::core::{PipelineType, RagStreamError, Result, RunId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// One lazily-opened append-only JSONL table.
struct Table {
    path: PathBuf,
    writer: Mutex<Option<File>>,
}

impl Table {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            writer: Mutex::new(None),
        }
    }

    async fn append<T: Serialize>(&self, record: &T) -> Result<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let mut writer = self.writer.lock().await;
        let file = match writer.as_mut() {
            Some(file) => file,
            None => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&self.path)
                    .await?;
                writer.insert(file)
            }
        };
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn read_all<T: DeserializeOwned>(&self) -> Result<Vec<T>> {
        // Hold the writer lock so a concurrent append cannot interleave a
        // partial line into the read.
        let _writer = self.writer.lock().await;
        match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents
                .lines()
                .filter(|line| !line.trim().is_empty())
                .map(|line| serde_json::from_str(line).map_err(RagStreamError::from))
                .collect(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn rewrite<T: Serialize>(&self, records: &[T]) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let mut contents = String::new();
        for record in records {
            contents.push_str(&serde_json::to_string(record)?);
            contents.push('\n');
        }
        tokio::fs::write(&self.path, contents).await?;
        // Reopen on next append so the handle points at the new file.
        *writer = None;
        Ok(())
    }
}

/// Telemetry sink persisting to JSONL files under a directory.
pub struct FileSink {
    logs: Table,
    run_info: Table,
    throughput: Table,
    known_runs: Mutex<Option<HashSet<RunId>>>,
}

impl FileSink {
    /// Creates a sink rooted at `dir`, creating the directory if needed.
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            logs: Table::new(dir.join("logs.jsonl")),
            run_info: Table::new(dir.join("run_info.jsonl")),
            throughput: Table::new(dir.join("throughput.jsonl")),
            known_runs: Mutex::new(None),
        })
    }

    /// Loads the set of recorded run ids on first use.
    async fn known_runs(&self) -> Result<tokio::sync::MutexGuard<'_, Option<HashSet<RunId>>>> {
        let mut known = self.known_runs.lock().await;
        if known.is_none() {
            let records: Vec<RunRecord> = self.run_info.read_all().await?;
            *known = Some(records.into_iter().map(|r| r.run_id).collect());
        }
        Ok(known)
    }
}

#[async_trait]
impl TelemetrySink for FileSink {
    async fn log(&self, run_id: RunId, key: &str, value: serde_json::Value) -> Result<()> {
        self.logs
            .append(&LogEvent {
                timestamp: Utc::now(),
                run_id,
                key: key.to_string(),
                value,
            })
            .await
    }

    async fn record_run(&self, run_id: RunId, pipeline_type: PipelineType) -> Result<()> {
        let mut known = self.known_runs().await?;
        let runs = known.get_or_insert_with(HashSet::new);
        if runs.contains(&run_id) {
            return Err(RagStreamError::DuplicateRunInfo { run_id });
        }
        self.run_info
            .append(&RunRecord {
                timestamp: Utc::now(),
                run_id,
                pipeline_type,
            })
            .await?;
        runs.insert(run_id);
        Ok(())
    }

    async fn recent_runs(
        &self,
        limit: usize,
        pipeline_type: Option<PipelineType>,
    ) -> Result<Vec<RunId>> {
        let records: Vec<RunRecord> = self.run_info.read_all().await?;
        Ok(records
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
        let events: Vec<LogEvent> = self.logs.read_all().await?;
        let mut windows: HashMap<RunId, Vec<LogEvent>> =
            run_ids.iter().map(|id| (*id, Vec::new())).collect();
        for event in events.into_iter().rev() {
            if let Some(window) = windows.get_mut(&event.run_id) {
                if window.len() < per_run_limit {
                    window.push(event);
                }
            }
        }
        Ok(windows)
    }

    async fn record_throughput(&self, sample: ThroughputSample) -> Result<()> {
        self.throughput.append(&sample).await
    }

    async fn throughput_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        category: Option<&str>,
    ) -> Result<Vec<ThroughputSample>> {
        let samples: Vec<ThroughputSample> = self.throughput.read_all().await?;
        Ok(samples
            .into_iter()
            .filter(|s| s.timestamp >= start && s.timestamp <= end)
            .filter(|s| category.map_or(true, |c| s.category == c))
            .collect())
    }

    async fn purge_run(&self, run_id: RunId) -> Result<()> {
        let events: Vec<LogEvent> = self.logs.read_all().await?;
        let kept: Vec<LogEvent> = events.into_iter().filter(|e| e.run_id != run_id).collect();
        self.logs.rewrite(&kept).await?;

        let records: Vec<RunRecord> = self.run_info.read_all().await?;
        let kept: Vec<RunRecord> = records.into_iter().filter(|r| r.run_id != run_id).collect();
        self.run_info.rewrite(&kept).await?;

        if let Some(runs) = self.known_runs.lock().await.as_mut() {
            runs.remove(&run_id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sink_in_tempdir() -> (tempfile::TempDir, FileSink) {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileSink::new(dir.path()).unwrap();
        (dir, sink)
    }

    #[tokio::test]
    async fn test_events_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let run = RunId::new();
        {
            let sink = FileSink::new(dir.path()).unwrap();
            sink.log(run, "error", json!("boom")).await.unwrap();
            sink.record_run(run, PipelineType::Rag).await.unwrap();
        }

        let reopened = FileSink::new(dir.path()).unwrap();
        let events = reopened.events_for_runs(&[run], 10).await.unwrap();
        assert_eq!(events[&run].len(), 1);
        assert_eq!(events[&run][0].value, json!("boom"));
        assert_eq!(reopened.recent_runs(10, None).await.unwrap(), vec![run]);
    }

    #[tokio::test]
    async fn test_duplicate_run_detected_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let run = RunId::new();
        {
            let sink = FileSink::new(dir.path()).unwrap();
            sink.record_run(run, PipelineType::Search).await.unwrap();
        }
        let reopened = FileSink::new(dir.path()).unwrap();
        assert!(matches!(
            reopened.record_run(run, PipelineType::Search).await.unwrap_err(),
            RagStreamError::DuplicateRunInfo { .. }
        ));
    }

    #[tokio::test]
    async fn test_concurrent_appends_keep_lines_whole() {
        let (_dir, sink) = sink_in_tempdir();
        let sink = std::sync::Arc::new(sink);
        let run = RunId::new();

        let mut handles = Vec::new();
        for i in 0..20 {
            let sink = sink.clone();
            handles.push(tokio::spawn(async move {
                sink.log(run, "k", json!(i)).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let events = sink.events_for_runs(&[run], 100).await.unwrap();
        assert_eq!(events[&run].len(), 20);
    }

    #[tokio::test]
    async fn test_purge_rewrites_files() {
        let (_dir, sink) = sink_in_tempdir();
        let keep = RunId::new();
        let drop = RunId::new();
        sink.record_run(keep, PipelineType::Eval).await.unwrap();
        sink.record_run(drop, PipelineType::Eval).await.unwrap();
        sink.log(keep, "k", json!(1)).await.unwrap();
        sink.log(drop, "k", json!(2)).await.unwrap();

        sink.purge_run(drop).await.unwrap();
        assert_eq!(sink.recent_runs(10, None).await.unwrap(), vec![keep]);
        let events = sink.events_for_runs(&[keep, drop], 10).await.unwrap();
        assert_eq!(events[&keep].len(), 1);
        assert!(events[&drop].is_empty());
    }
}
