//! Per-pipe telemetry queue
//!
//! Each pipe run opens one bounded queue of `(run_id, key, value)` triples
//! and one background worker that forwards them to the telemetry sink.
//! Enqueueing never blocks the transformation: a full queue drops the
//! event. On completion the pipe awaits the worker, which exits only after
//! the queue has fully drained - enqueued events are never silently lost.

use crate::core::RunId;
use crate::telemetry::TelemetrySink;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

type LogTriple = (RunId, String, serde_json::Value);

/// Cheap clonable handle for enqueueing telemetry from inside a pipe.
#[derive(Clone)]
pub struct PipeLogger {
    tx: mpsc::Sender<LogTriple>,
}

impl PipeLogger {
    /// Enqueues one event. Telemetry is best-effort: when the queue is
    /// full or already closed the event is dropped and the pipe carries on.
    pub fn enqueue(&self, run_id: RunId, key: impl Into<String>, value: serde_json::Value) {
        let key = key.into();
        if let Err(error) = self.tx.try_send((run_id, key, value)) {
            match error {
                mpsc::error::TrySendError::Full(_) => {
                    tracing::trace!(run_id = %run_id, "telemetry queue full, dropping event");
                }
                mpsc::error::TrySendError::Closed(_) => {
                    tracing::trace!(run_id = %run_id, "telemetry queue closed, dropping event");
                }
            }
        }
    }
}

/// Handle on the background forwarder task.
pub struct LogWorker {
    handle: JoinHandle<()>,
}

impl LogWorker {
    /// Awaits the worker. The worker exits once every sender has dropped
    /// and the remaining queued events have been forwarded, so joining
    /// after the last enqueue guarantees a fully drained queue.
    pub async fn join(self) {
        if let Err(error) = self.handle.await {
            tracing::warn!(%error, "telemetry worker task failed");
        }
    }
}

/// Opens the bounded queue and spawns its forwarder.
pub fn spawn_log_worker(
    sink: Arc<dyn TelemetrySink>,
    capacity: usize,
) -> (PipeLogger, LogWorker) {
    let (tx, mut rx) = mpsc::channel::<LogTriple>(capacity);
    let handle = tokio::spawn(async move {
        while let Some((run_id, key, value)) = rx.recv().await {
            if let Err(error) = sink.log(run_id, &key, value).await {
                tracing::warn!(run_id = %run_id, %key, %error, "failed to persist log event");
            }
        }
    });
    (PipeLogger { tx }, LogWorker { handle })
}
