//! Retrieval-augmented generation pipeline
//!
//! Composes a [`SearchPipeline`] with a generation pipe: the search phase
//! runs to completion, its ranked results are folded into a context text
//! with stable ordinal references (`[1]`, `[2]`, ...) so answers can cite
//! sources, and the generation pipe is invoked with `{query, context}`.
//! In streaming mode the response is the framed wire protocol of
//! [`crate::pipeline::streaming`] instead of a single answer.

use crate::core::{AggregateSearchResult, PipelineType, RagStreamError, Result, RunId};
use crate::pipeline::pipe::Pipe;
use crate::pipeline::pipeline::drain_flattened;
use crate::pipeline::search::SearchPipeline;
use crate::pipeline::streaming::{assemble_rag_stream, RagStreamPrelude};
use crate::pipeline::types::{PipeInput, PipeItem};
use crate::state::SharedRunState;
use crate::tracking::{RunContext, RunTracker};
use futures::stream::{BoxStream, StreamExt};
use serde_json::json;
use std::sync::Arc;

/// Input field carrying the user query into the generation pipe.
pub const QUERY_FIELD: &str = "query";
/// Input field carrying the assembled context into the generation pipe.
pub const CONTEXT_FIELD: &str = "context";
/// Input field telling the generation pipe to stream tokens.
pub const STREAM_FIELD: &str = "stream";

/// What a RAG run hands back.
pub enum RagOutcome {
    /// Non-streaming: the full answer plus the search results it cites
    Completed {
        /// Run id covering search and generation
        run_id: RunId,
        /// The generated answer text
        answer: String,
        /// The aggregate the context was built from
        search: AggregateSearchResult,
    },
    /// Streaming: the framed wire-protocol chunk stream, unconsumed
    Streaming(BoxStream<'static, Result<String>>),
}

/// A search pipeline composed with a generation pipe.
pub struct RagPipeline {
    search: SearchPipeline,
    generation: Arc<dyn Pipe>,
    tracker: Arc<RunTracker>,
}

impl RagPipeline {
    /// Composes search and generation under one tracker.
    pub fn new(
        search: SearchPipeline,
        generation: Arc<dyn Pipe>,
        tracker: Arc<RunTracker>,
    ) -> Self {
        Self {
            search,
            generation,
            tracker,
        }
    }

    /// Answers a query, either as one materialized answer or as the
    /// framed streaming response.
    pub async fn run(&self, query: &str, streaming: bool) -> Result<RagOutcome> {
        let ctx = self.tracker.begin_run(PipelineType::Rag).await;
        let result = self.run_inner(query, streaming, &ctx).await;
        if let Err(error) = &result {
            tracing::error!(run_id = %ctx.run_id, %error, "rag run failed");
        }
        self.tracker.end_run(&ctx);
        result
    }

    async fn run_inner(
        &self,
        query: &str,
        streaming: bool,
        ctx: &RunContext,
    ) -> Result<RagOutcome> {
        let aggregate = self.search.run_with(vec![query.to_string()], ctx).await?;
        let context = build_context(&aggregate);

        let state = Arc::new(SharedRunState::new());
        let input = PipeInput::empty()
            .with_extra(QUERY_FIELD, json!(query))
            .with_extra(CONTEXT_FIELD, json!(context))
            .with_extra(STREAM_FIELD, json!(streaming));
        let output = self.generation.run(input, state, ctx).await?;

        if streaming {
            let tokens = output
                .map(|item| match item {
                    Ok(item) => item.as_text().map(str::to_string).ok_or_else(|| {
                        RagStreamError::Generation {
                            message: "generation pipe emitted a non-text item".to_string(),
                        }
                    }),
                    Err(error) => Err(error),
                })
                .boxed();
            let results: Vec<_> = aggregate.ranked().into_iter().cloned().collect();
            let mut metadata = serde_json::Map::new();
            metadata.insert(QUERY_FIELD.to_string(), json!(query));
            metadata.insert("num_results".to_string(), json!(results.len()));
            let prelude = RagStreamPrelude {
                results,
                context,
                metadata,
            };
            Ok(RagOutcome::Streaming(assemble_rag_stream(prelude, tokens)?))
        } else {
            let items = drain_flattened(output, ctx).await?;
            let answer: String = items
                .iter()
                .filter_map(PipeItem::as_text)
                .collect::<Vec<_>>()
                .concat();
            Ok(RagOutcome::Completed {
                run_id: ctx.run_id,
                answer,
                search: aggregate,
            })
        }
    }
}

impl std::fmt::Debug for RagPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RagPipeline")
            .field("search", &self.search)
            .field("generation", &self.generation.name())
            .finish()
    }
}

/// Concatenates ranked results into a context text with stable ordinal
/// references. Ordinals start at 1 and follow the aggregate's ranking.
pub fn build_context(aggregate: &AggregateSearchResult) -> String {
    aggregate
        .ranked()
        .iter()
        .enumerate()
        .map(|(i, result)| format!("[{}] {}", i + 1, result.display_text()))
        .collect::<Vec<_>>()
        .join("\n")
}
