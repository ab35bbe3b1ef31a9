//! Pipeline composition and execution
//!
//! A pipeline is an ordered list of pipes plus declared bindings between
//! named pipe outputs and downstream input fields. Pipes execute strictly
//! in declared order; each pipe's output stream feeds the next pipe live,
//! so stage *i+1* may begin consuming before stage *i* finished producing.
//! The one exception is a binding on the immediately preceding pipe: a
//! once-consumed stream cannot be iterated twice, so the engine
//! materializes it into a buffer and replays from there - an explicit,
//! documented barrier.

use crate::core::{PipelineType, RagStreamError, Result};
use crate::pipeline::pipe::Pipe;
use crate::pipeline::types::{flatten_into, ItemStream, PipeInput, PipeItem};
use crate::state::SharedRunState;
use crate::tracking::{RunContext, RunTracker};
use futures::stream::{self, StreamExt};
use indexmap::IndexMap;
use std::sync::Arc;

/// The reserved field name addressing a pipe's output stream itself.
pub const MESSAGE_FIELD: &str = "message";

/// One declared dependency: feed `source_pipe`'s `source_field` into the
/// downstream pipe's input field `dest_field`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    /// Name of the upstream pipe (must appear strictly earlier)
    pub source_pipe: String,
    /// Field the upstream pipe wrote (or [`MESSAGE_FIELD`] for its stream)
    pub source_field: String,
    /// Input field on the downstream pipe
    pub dest_field: String,
}

impl Binding {
    /// Creates a binding.
    pub fn new(
        source_pipe: impl Into<String>,
        source_field: impl Into<String>,
        dest_field: impl Into<String>,
    ) -> Self {
        Self {
            source_pipe: source_pipe.into(),
            source_field: source_field.into(),
            dest_field: dest_field.into(),
        }
    }

    /// A binding replaying the upstream pipe's output stream. Only the
    /// immediately preceding pipe's stream can be replayed; `add_pipe`
    /// rejects anything further back.
    pub fn message(source_pipe: impl Into<String>) -> Self {
        Self::new(source_pipe, MESSAGE_FIELD, MESSAGE_FIELD)
    }
}

/// What a pipeline run hands back.
pub enum PipelineOutput {
    /// Non-streaming: the final pipe's output, fully drained and
    /// recursively flattened
    Completed(Vec<PipeItem>),
    /// Streaming: the final pipe's live output stream, unconsumed
    Streaming(ItemStream),
}

impl std::fmt::Debug for PipelineOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineOutput::Completed(items) => f.debug_tuple("Completed").field(items).finish(),
            PipelineOutput::Streaming(_) => f.write_str("Streaming(..)"),
        }
    }
}

impl PipelineOutput {
    /// The drained items of a non-streaming run.
    pub fn items(self) -> Result<Vec<PipeItem>> {
        match self {
            PipelineOutput::Completed(items) => Ok(items),
            PipelineOutput::Streaming(_) => Err(RagStreamError::config(
                "pipeline ran in streaming mode; no materialized items",
            )),
        }
    }

    /// The output as a stream, regardless of mode.
    pub fn into_stream(self) -> ItemStream {
        match self {
            PipelineOutput::Completed(items) => {
                stream::iter(items.into_iter().map(Ok)).boxed()
            }
            PipelineOutput::Streaming(stream) => stream,
        }
    }
}

/// An ordered composition of pipes with declared cross-pipe bindings.
#[derive(Clone)]
pub struct Pipeline {
    pipeline_type: PipelineType,
    tracker: Arc<RunTracker>,
    pipes: Vec<Arc<dyn Pipe>>,
    bindings: Vec<Vec<Binding>>,
}

impl Pipeline {
    /// Creates an empty pipeline of the given type.
    pub fn new(pipeline_type: PipelineType, tracker: Arc<RunTracker>) -> Self {
        Self {
            pipeline_type,
            tracker,
            pipes: Vec::new(),
            bindings: Vec::new(),
        }
    }

    /// The pipeline's declared type.
    pub fn pipeline_type(&self) -> PipelineType {
        self.pipeline_type
    }

    /// The run tracker this pipeline opens runs with.
    pub fn tracker(&self) -> &Arc<RunTracker> {
        &self.tracker
    }

    /// Names of the pipes in declared order.
    pub fn pipe_names(&self) -> Vec<&str> {
        self.pipes.iter().map(|p| p.name()).collect()
    }

    /// Appends a pipe with its upstream bindings.
    ///
    /// Validated at construction: pipe names must be unique, every binding
    /// must reference a pipe that appears strictly earlier (the pipeline
    /// is a DAG flattened into a linear order), each declared upstream
    /// field feeds at most one consumer, and a [`MESSAGE_FIELD`] binding
    /// must name the immediately preceding pipe - a stream further back is
    /// already consumed by the pipe after it and cannot be replayed.
    pub fn add_pipe(&mut self, pipe: Arc<dyn Pipe>, bindings: Vec<Binding>) -> Result<()> {
        let name = pipe.name().to_string();
        if self.pipes.iter().any(|p| p.name() == name) {
            return Err(RagStreamError::config(format!(
                "duplicate pipe name `{name}` in pipeline"
            )));
        }
        for (index, binding) in bindings.iter().enumerate() {
            if binding.source_pipe == name {
                return Err(RagStreamError::config(format!(
                    "pipe `{name}` cannot bind to itself"
                )));
            }
            if !self.pipes.iter().any(|p| p.name() == binding.source_pipe) {
                return Err(RagStreamError::config(format!(
                    "binding on pipe `{name}` references `{}`, which is not an earlier pipe",
                    binding.source_pipe
                )));
            }
            if binding.source_field == MESSAGE_FIELD
                && self.pipes.last().map(|p| p.name()) != Some(binding.source_pipe.as_str())
            {
                return Err(RagStreamError::config(format!(
                    "message binding on pipe `{name}` must reference the immediately \
                     preceding pipe, not `{}`",
                    binding.source_pipe
                )));
            }
            let already_consumed = self
                .bindings
                .iter()
                .flatten()
                .chain(bindings[..index].iter())
                .any(|b| {
                    b.source_pipe == binding.source_pipe && b.source_field == binding.source_field
                });
            if already_consumed {
                return Err(RagStreamError::config(format!(
                    "field `{}.{}` is already consumed by another binding",
                    binding.source_pipe, binding.source_field
                )));
            }
        }
        self.pipes.push(pipe);
        self.bindings.push(bindings);
        Ok(())
    }

    /// Executes the pipeline.
    ///
    /// Opens one run via the tracker unless `parent` is supplied (branch
    /// pipelines of the fan-out variants reuse the parent's run, so all
    /// telemetry correlates to a single run id). Non-streaming runs drain
    /// and recursively flatten the final pipe's output; streaming runs
    /// return the live stream unconsumed. Any error raised while draining
    /// is logged at ERROR with the pipeline type and run id, then
    /// re-raised unchanged.
    pub async fn run(
        &self,
        input: PipeInput,
        state: Option<Arc<SharedRunState>>,
        streaming: bool,
        parent: Option<&RunContext>,
    ) -> Result<PipelineOutput> {
        if self.pipes.is_empty() {
            return Err(RagStreamError::config("pipeline has no pipes"));
        }

        let owned;
        let ctx = match parent {
            Some(ctx) => ctx,
            None => {
                owned = self.tracker.begin_run(self.pipeline_type).await;
                &owned
            }
        };
        let state = state.unwrap_or_else(|| Arc::new(SharedRunState::new()));

        let result = self.execute(input, state, streaming, ctx).await;
        if let Err(error) = &result {
            tracing::error!(
                pipeline_type = %self.pipeline_type,
                run_id = %ctx.run_id,
                %error,
                "pipeline run failed"
            );
        }
        if parent.is_none() {
            self.tracker.end_run(ctx);
        }
        result
    }

    async fn execute(
        &self,
        input: PipeInput,
        state: Arc<SharedRunState>,
        streaming: bool,
        ctx: &RunContext,
    ) -> Result<PipelineOutput> {
        let PipeInput {
            message: mut current,
            extras: mut external_extras,
        } = input;

        for (position, pipe) in self.pipes.iter().enumerate() {
            ctx.ensure_active()?;

            let mut extras: IndexMap<String, serde_json::Value> = if position == 0 {
                std::mem::take(&mut external_extras)
            } else {
                IndexMap::new()
            };

            // Most-recently-produced dependency resolves first.
            let mut bindings = self.bindings[position].clone();
            bindings.sort_by_key(|b| std::cmp::Reverse(self.position_of(&b.source_pipe)));

            let previous = position
                .checked_sub(1)
                .map(|p| self.pipes[p].name().to_string());
            let needs_replay = bindings
                .iter()
                .any(|b| Some(&b.source_pipe) == previous.as_ref());

            if needs_replay {
                // Barrier: the previous pipe's live stream is consumed
                // once here, buffered, and replayed. Its state writes are
                // complete afterwards, so field bindings on it resolve
                // like any other upstream state read.
                let buffered = collect_stream(current, ctx).await?;
                current = stream::iter(buffered.into_iter().map(Ok)).boxed();
            }

            for binding in &bindings {
                if binding.source_field == MESSAGE_FIELD {
                    // Always the adjacent pipe (add_pipe rejects the
                    // rest); its replay happened above, nothing to inject.
                    continue;
                }
                let value = self.resolve_binding(binding, &state)?;
                extras.insert(binding.dest_field.clone(), value);
            }

            current = pipe
                .run(
                    PipeInput {
                        message: current,
                        extras,
                    },
                    Arc::clone(&state),
                    ctx,
                )
                .await?;
        }

        if streaming {
            Ok(PipelineOutput::Streaming(current))
        } else {
            let items = drain_flattened(current, ctx).await?;
            Ok(PipelineOutput::Completed(items))
        }
    }

    fn position_of(&self, name: &str) -> usize {
        // add_pipe validated that every binding source exists.
        self.pipes
            .iter()
            .position(|p| p.name() == name)
            .unwrap_or(usize::MAX)
    }

    fn resolve_binding(
        &self,
        binding: &Binding,
        state: &SharedRunState,
    ) -> Result<serde_json::Value> {
        // A stored null is a real value; only a field the source pipe
        // never wrote (or a pipe that wrote nothing at all) is a
        // resolution failure.
        match state.try_get(&binding.source_pipe, &binding.source_field) {
            Ok(Some(value)) => Ok(value),
            Ok(None) | Err(RagStreamError::StateGroupNotFound { .. }) => {
                Err(RagStreamError::DependencyResolution {
                    group: binding.source_pipe.clone(),
                    field: binding.source_field.clone(),
                })
            }
            Err(other) => Err(other),
        }
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("pipeline_type", &self.pipeline_type)
            .field("pipes", &self.pipe_names())
            .finish()
    }
}

/// Buffers a stream into a batch without flattening, honoring cancellation
/// at every item.
pub(crate) async fn collect_stream(
    mut stream: ItemStream,
    ctx: &RunContext,
) -> Result<Vec<PipeItem>> {
    let mut items = Vec::new();
    loop {
        tokio::select! {
            () = ctx.cancellation().cancelled() => {
                return Err(RagStreamError::Cancelled { run_id: ctx.run_id });
            }
            next = stream.next() => match next {
                Some(Ok(item)) => items.push(item),
                Some(Err(error)) => return Err(error),
                None => break,
            }
        }
    }
    Ok(items)
}

/// Drains a stream to completion, recursively flattening nested batches,
/// honoring cancellation at every item.
pub(crate) async fn drain_flattened(
    mut stream: ItemStream,
    ctx: &RunContext,
) -> Result<Vec<PipeItem>> {
    let mut items = Vec::new();
    loop {
        tokio::select! {
            () = ctx.cancellation().cancelled() => {
                return Err(RagStreamError::Cancelled { run_id: ctx.run_id });
            }
            next = stream.next() => match next {
                Some(Ok(item)) => flatten_into(item, &mut items),
                Some(Err(error)) => return Err(error),
                None => break,
            }
        }
    }
    Ok(items)
}
