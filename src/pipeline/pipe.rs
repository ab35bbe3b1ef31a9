//! The pipe abstraction
//!
//! A pipe is the unit of computation: it consumes a lazily-produced input
//! stream plus the shared run state and produces a lazily-produced output
//! stream. Implementors write [`Pipe::run_logic`]; the provided
//! [`Pipe::run`] wraps it with the lifecycle - the state machine, the
//! telemetry queue, and the guarantee that the queue drains before the
//! output stream reports end-of-stream.

use crate::config::PipeConfig;
use crate::core::{RagStreamError, Result, RunId};
use crate::pipeline::logging::{spawn_log_worker, LogWorker, PipeLogger};
use crate::pipeline::types::{ItemStream, PipeInput};
use crate::state::SharedRunState;
use crate::tracking::RunContext;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use std::sync::Arc;

/// Lifecycle of one pipe: `Uninitialized -> Running -> Completed | Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeState {
    /// Constructed, never run
    Uninitialized,
    /// A run has assigned a run id and the pipe is producing output
    Running,
    /// The output stream finished cleanly
    Completed,
    /// The output stream surfaced an error (or was dropped mid-error)
    Failed,
}

/// Shared core every pipe embeds: name, configuration and lifecycle state.
///
/// Replaces the legacy pattern of intercepting every method call with a
/// "has run been called yet" check: there is exactly one guard,
/// [`PipeBase::current_run`], and it fails before the run-entry path has
/// assigned a run identifier.
pub struct PipeBase {
    config: PipeConfig,
    state: Mutex<PipeState>,
    current_run: Mutex<Option<RunId>>,
}

impl PipeBase {
    /// Creates an uninitialized pipe core. Wrap in `Arc` so the lifecycle
    /// can outlive borrows into the output stream.
    pub fn new(config: PipeConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            state: Mutex::new(PipeState::Uninitialized),
            current_run: Mutex::new(None),
        })
    }

    /// The pipe's name; doubles as its shared-state group key.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// The pipe's configuration.
    pub fn config(&self) -> &PipeConfig {
        &self.config
    }

    /// Current lifecycle state.
    pub fn state(&self) -> PipeState {
        *self.state.lock()
    }

    /// The run id assigned by the current/most recent run. Fails with
    /// [`RagStreamError::UninitializedPipe`] before any run started.
    pub fn current_run(&self) -> Result<RunId> {
        (*self.current_run.lock())
            .ok_or_else(|| RagStreamError::UninitializedPipe {
                pipe: self.name().to_string(),
            })
    }

    fn begin(&self, run_id: RunId) {
        *self.current_run.lock() = Some(run_id);
        *self.state.lock() = PipeState::Running;
    }

    fn finish(&self, failed: bool) {
        *self.state.lock() = if failed {
            PipeState::Failed
        } else {
            PipeState::Completed
        };
    }
}

impl std::fmt::Debug for PipeBase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipeBase")
            .field("name", &self.name())
            .field("state", &self.state())
            .finish()
    }
}

/// Per-run context handed to [`Pipe::run_logic`]: the run, plus the
/// telemetry queue handle when a sink is configured.
#[derive(Clone)]
pub struct PipeContext {
    run: RunContext,
    logger: Option<PipeLogger>,
}

impl PipeContext {
    /// A context without a telemetry queue.
    pub fn new(run: RunContext) -> Self {
        Self { run, logger: None }
    }

    pub(crate) fn with_logger(run: RunContext, logger: PipeLogger) -> Self {
        Self {
            run,
            logger: Some(logger),
        }
    }

    /// The run this execution belongs to.
    pub fn run(&self) -> &RunContext {
        &self.run
    }

    /// The run identifier.
    pub fn run_id(&self) -> RunId {
        self.run.run_id
    }

    /// Enqueues one telemetry event through the pipe's bounded queue.
    /// Never blocks; a full queue drops the event.
    pub fn enqueue_log(&self, key: impl Into<String>, value: serde_json::Value) {
        if let Some(logger) = &self.logger {
            logger.enqueue(self.run.run_id, key, value);
        }
    }
}

/// The unit of asynchronous transformation in the engine.
#[async_trait]
pub trait Pipe: Send + Sync {
    /// The pipe's shared core.
    fn base(&self) -> &Arc<PipeBase>;

    /// Pipe name (shared-state group key, binding source name).
    fn name(&self) -> &str {
        self.base().name()
    }

    /// The transformation itself. Must return a lazily-produced stream;
    /// implementations must not drain their input eagerly into memory.
    async fn run_logic(
        &self,
        input: PipeInput,
        state: Arc<SharedRunState>,
        ctx: PipeContext,
    ) -> Result<ItemStream>;

    /// The run-entry path: assigns the run id, opens the telemetry queue,
    /// delegates to [`Pipe::run_logic`] and wraps its stream with the
    /// lifecycle epilogue. Callers other than the pipeline engine rarely
    /// need to override this.
    async fn run(
        &self,
        input: PipeInput,
        state: Arc<SharedRunState>,
        run: &RunContext,
    ) -> Result<ItemStream> {
        let base = Arc::clone(self.base());
        base.begin(run.run_id);

        let (ctx, worker) = match run.sink() {
            Some(sink) => {
                let (logger, worker) =
                    spawn_log_worker(Arc::clone(sink), base.config().log_queue_capacity);
                (PipeContext::with_logger(run.clone(), logger), Some(worker))
            }
            None => (PipeContext::new(run.clone()), None),
        };

        match self.run_logic(input, state, ctx).await {
            Ok(output) => Ok(finalize_stream(output, base, worker)),
            Err(error) => {
                tracing::error!(
                    pipe = %base.name(),
                    run_id = %run.run_id,
                    %error,
                    "pipe failed to start"
                );
                base.finish(true);
                if let Some(worker) = worker {
                    worker.join().await;
                }
                Err(error)
            }
        }
    }
}

struct Epilogue {
    inner: ItemStream,
    base: Arc<PipeBase>,
    worker: Option<LogWorker>,
    failed: bool,
    finished: bool,
}

impl Drop for Epilogue {
    fn drop(&mut self) {
        // Consumer dropped the stream early: record the final state. The
        // worker self-drains once the last logger handle drops with the
        // inner stream.
        if !self.finished {
            self.base.finish(self.failed);
        }
    }
}

/// Wraps a pipe's output so that, at end-of-stream, the state machine
/// advances and the telemetry queue is fully drained before `None` is
/// reported to the consumer.
fn finalize_stream(inner: ItemStream, base: Arc<PipeBase>, worker: Option<LogWorker>) -> ItemStream {
    let epilogue = Epilogue {
        inner,
        base,
        worker,
        failed: false,
        finished: false,
    };
    stream::unfold(epilogue, |mut ep| async move {
        if ep.finished {
            return None;
        }
        match ep.inner.next().await {
            Some(Ok(item)) => Some((Ok(item), ep)),
            Some(Err(error)) => {
                ep.failed = true;
                Some((Err(error), ep))
            }
            None => {
                ep.finished = true;
                ep.base.finish(ep.failed);
                // Drop the inner stream first: it owns the last logger
                // handles, and the worker only exits once they are gone.
                ep.inner = stream::empty().boxed();
                if let Some(worker) = ep.worker.take() {
                    worker.join().await;
                }
                None
            }
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::PipelineType;
    use crate::pipeline::types::PipeItem;
    use crate::telemetry::{InMemorySink, TelemetrySink};
    use crate::tracking::RunTracker;
    use futures::TryStreamExt;
    use serde_json::json;

    /// Passes items through unchanged, logging one event per item.
    struct EchoPipe {
        base: Arc<PipeBase>,
    }

    impl EchoPipe {
        fn new(name: &str) -> Self {
            Self {
                base: PipeBase::new(PipeConfig::new(name).unwrap()),
            }
        }
    }

    #[async_trait]
    impl Pipe for EchoPipe {
        fn base(&self) -> &Arc<PipeBase> {
            &self.base
        }

        async fn run_logic(
            &self,
            input: PipeInput,
            _state: Arc<SharedRunState>,
            ctx: PipeContext,
        ) -> Result<ItemStream> {
            Ok(input
                .message
                .inspect(move |item| {
                    if let Ok(item) = item {
                        ctx.enqueue_log("echoed", json!(format!("{item:?}")));
                    }
                })
                .boxed())
        }
    }

    #[tokio::test]
    async fn test_uninitialized_pipe_guard() {
        let pipe = EchoPipe::new("echo");
        assert_eq!(pipe.base().state(), PipeState::Uninitialized);
        assert!(matches!(
            pipe.base().current_run().unwrap_err(),
            RagStreamError::UninitializedPipe { pipe } if pipe == "echo"
        ));
    }

    #[tokio::test]
    async fn test_run_assigns_run_id_and_completes() {
        let tracker = RunTracker::new();
        let run = tracker.begin_run(PipelineType::Other).await;
        let pipe = EchoPipe::new("echo");

        let output = pipe
            .run(
                PipeInput::from_items(vec![PipeItem::Text("a".to_string())]),
                Arc::new(SharedRunState::new()),
                &run,
            )
            .await
            .unwrap();
        assert_eq!(pipe.base().current_run().unwrap(), run.run_id);
        assert_eq!(pipe.base().state(), PipeState::Running);

        let items: Vec<PipeItem> = output.try_collect().await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(pipe.base().state(), PipeState::Completed);
    }

    #[tokio::test]
    async fn test_log_queue_drained_before_stream_ends() {
        let sink = Arc::new(InMemorySink::new());
        let tracker = RunTracker::with_sink(sink.clone());
        let run = tracker.begin_run(PipelineType::Other).await;
        let pipe = EchoPipe::new("echo");

        let items = vec![
            PipeItem::Text("a".to_string()),
            PipeItem::Text("b".to_string()),
            PipeItem::Text("c".to_string()),
        ];
        let output = pipe
            .run(PipeInput::from_items(items), Arc::new(SharedRunState::new()), &run)
            .await
            .unwrap();
        let _: Vec<PipeItem> = output.try_collect().await.unwrap();

        // try_collect returned after the epilogue joined the worker, so
        // every enqueued event has already reached the sink.
        let events = sink.events_for_runs(&[run.run_id], 10).await.unwrap();
        assert_eq!(events[&run.run_id].len(), 3);
    }

    #[tokio::test]
    async fn test_failing_stream_marks_pipe_failed() {
        struct FailingPipe {
            base: Arc<PipeBase>,
        }

        #[async_trait]
        impl Pipe for FailingPipe {
            fn base(&self) -> &Arc<PipeBase> {
                &self.base
            }

            async fn run_logic(
                &self,
                _input: PipeInput,
                _state: Arc<SharedRunState>,
                _ctx: PipeContext,
            ) -> Result<ItemStream> {
                Ok(stream::iter(vec![
                    Ok(PipeItem::Text("ok".to_string())),
                    Err(RagStreamError::provider("embedding", "connection reset")),
                ])
                .boxed())
            }
        }

        let tracker = RunTracker::new();
        let run = tracker.begin_run(PipelineType::Other).await;
        let pipe = FailingPipe {
            base: PipeBase::new(PipeConfig::new("failing").unwrap()),
        };

        let mut output = pipe
            .run(PipeInput::empty(), Arc::new(SharedRunState::new()), &run)
            .await
            .unwrap();
        assert!(output.next().await.unwrap().is_ok());
        assert!(output.next().await.unwrap().is_err());
        drop(output);
        assert_eq!(pipe.base().state(), PipeState::Failed);
    }
}
