//! Run tracking
//!
//! [`RunTracker`] issues one unique run identifier per top-level pipeline
//! invocation and keeps an in-memory registry of `{run_id -> pipeline_type}`
//! for the process lifetime. The identifier travels the call chain inside an
//! explicit [`RunContext`] (rather than an implicit task-local binding) so
//! every spawned branch and log worker correlates to the same run.
//!
//! The context also carries the run-scoped cancellation token; every
//! suspension point in the engine honors it.

use crate::core::{PipelineType, Result, RunId};
use crate::telemetry::TelemetrySink;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Issues run identifiers and remembers which pipeline type each belongs to.
pub struct RunTracker {
    registry: Mutex<HashMap<RunId, PipelineType>>,
    sink: Option<Arc<dyn TelemetrySink>>,
}

impl std::fmt::Debug for RunTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunTracker")
            .field("runs", &self.registry.lock().len())
            .field("has_sink", &self.sink.is_some())
            .finish()
    }
}

impl RunTracker {
    /// Creates a tracker without telemetry persistence.
    pub fn new() -> Self {
        Self {
            registry: Mutex::new(HashMap::new()),
            sink: None,
        }
    }

    /// Creates a tracker that persists run records and log events to `sink`.
    pub fn with_sink(sink: Arc<dyn TelemetrySink>) -> Self {
        Self {
            registry: Mutex::new(HashMap::new()),
            sink: Some(sink),
        }
    }

    /// Opens a new run: fresh random id, registry entry, one-time run-info
    /// record in the sink. Sink failures are logged and swallowed -
    /// telemetry never blocks a run from starting.
    pub async fn begin_run(&self, pipeline_type: PipelineType) -> RunContext {
        let run_id = RunId::new();
        self.registry.lock().insert(run_id, pipeline_type);

        if let Some(sink) = &self.sink {
            if let Err(error) = sink.record_run(run_id, pipeline_type).await {
                tracing::warn!(run_id = %run_id, %error, "failed to persist run info");
            }
        }

        tracing::debug!(run_id = %run_id, pipeline_type = %pipeline_type, "run started");
        RunContext {
            run_id,
            pipeline_type,
            cancel: CancellationToken::new(),
            sink: self.sink.clone(),
        }
    }

    /// Closes a run. The registry entry intentionally stays so completed
    /// runs remain queryable until [`RunTracker::forget_run`].
    pub fn end_run(&self, ctx: &RunContext) {
        tracing::debug!(run_id = %ctx.run_id, "run ended");
    }

    /// Pipeline type recorded for a run, if the run is known.
    pub fn pipeline_type_of(&self, run_id: RunId) -> Option<PipelineType> {
        self.registry.lock().get(&run_id).copied()
    }

    /// Explicit cleanup: drops the registry entry for a completed run.
    pub fn forget_run(&self, run_id: RunId) {
        self.registry.lock().remove(&run_id);
    }

    /// Number of runs currently in the registry.
    pub fn tracked_runs(&self) -> usize {
        self.registry.lock().len()
    }
}

impl Default for RunTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything a pipe needs to know about the run it executes inside:
/// the run id, the pipeline type, the cancellation token and the
/// telemetry sink.
#[derive(Clone)]
pub struct RunContext {
    /// The run this context belongs to
    pub run_id: RunId,
    /// Pipeline type the run was opened with
    pub pipeline_type: PipelineType,
    cancel: CancellationToken,
    sink: Option<Arc<dyn TelemetrySink>>,
}

impl std::fmt::Debug for RunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunContext")
            .field("run_id", &self.run_id)
            .field("pipeline_type", &self.pipeline_type)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl RunContext {
    /// The run-scoped cancellation token.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Requests cancellation of the whole run. Every drain loop and
    /// duplication task observes the token at its next suspension point.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Fails with [`crate::core::RagStreamError::Cancelled`] once the token
    /// has fired.
    pub fn ensure_active(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(crate::core::RagStreamError::Cancelled {
                run_id: self.run_id,
            })
        } else {
            Ok(())
        }
    }

    /// Best-effort structured log entry for this run. A no-op without a
    /// sink; sink failures are logged locally and swallowed.
    pub async fn log_info(&self, key: &str, value: serde_json::Value) {
        if let Some(sink) = &self.sink {
            if let Err(error) = sink.log(self.run_id, key, value).await {
                tracing::warn!(run_id = %self.run_id, key, %error, "failed to persist log event");
            }
        }
    }

    /// The telemetry sink, when one is configured.
    pub fn sink(&self) -> Option<&Arc<dyn TelemetrySink>> {
        self.sink.as_ref()
    }
}
