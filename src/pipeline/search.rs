//! Branching search pipeline
//!
//! Mirrors the ingestion fan-out over a stream of queries instead of
//! documents: one channel feeds a vector-search branch, another a
//! knowledge-graph-search branch, both running concurrently. The result
//! pairs whichever branches are configured into an
//! [`AggregateSearchResult`].

use crate::core::{AggregateSearchResult, PipelineType, RagStreamError, Result, SearchResult};
use crate::pipeline::ingestion::duplicate;
use crate::pipeline::pipeline::Pipeline;
use crate::pipeline::types::{PipeInput, PipeItem};
use crate::state::SharedRunState;
use crate::tracking::{RunContext, RunTracker};
use futures::StreamExt;
use std::cmp::Ordering;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// A query fan-out across vector-search and graph-search branches.
pub struct SearchPipeline {
    vector: Option<Pipeline>,
    graph: Option<Pipeline>,
    tracker: Arc<RunTracker>,
}

impl SearchPipeline {
    /// Assembles the search fan-out; at least one branch is required.
    pub fn new(
        vector: Option<Pipeline>,
        graph: Option<Pipeline>,
        tracker: Arc<RunTracker>,
    ) -> Result<Self> {
        if vector.is_none() && graph.is_none() {
            return Err(RagStreamError::config(
                "search pipeline needs at least one of the vector and graph branches",
            ));
        }
        Ok(Self {
            vector,
            graph,
            tracker,
        })
    }

    /// Runs the queries through both branches as its own run.
    pub async fn run(&self, queries: Vec<String>) -> Result<AggregateSearchResult> {
        let ctx = self.tracker.begin_run(PipelineType::Search).await;
        let result = self.run_with(queries, &ctx).await;
        if let Err(error) = &result {
            tracing::error!(run_id = %ctx.run_id, %error, "search run failed");
        }
        self.tracker.end_run(&ctx);
        result
    }

    /// Runs the queries inside an existing run context.
    ///
    /// The RAG pipeline uses this so its search phase shares the parent
    /// run id instead of opening a run of its own.
    pub async fn run_with(
        &self,
        queries: Vec<String>,
        ctx: &RunContext,
    ) -> Result<AggregateSearchResult> {
        let state = Arc::new(SharedRunState::new());
        let query_stream = futures::stream::iter(
            queries.into_iter().map(|q| Ok(PipeItem::Text(q))),
        )
        .boxed();

        let mut senders = Vec::new();
        let vector_task = self
            .vector
            .as_ref()
            .map(|branch| spawn_search_branch(branch, &state, ctx, &mut senders));
        let graph_task = self
            .graph
            .as_ref()
            .map(|branch| spawn_search_branch(branch, &state, ctx, &mut senders));

        let (dup_result, vector_results, graph_results) = tokio::join!(
            duplicate(query_stream, senders, ctx.clone()),
            join_search_branch(vector_task),
            join_search_branch(graph_task),
        );
        dup_result?;

        Ok(AggregateSearchResult {
            vector_results: vector_results?,
            graph_results: graph_results?,
        })
    }
}

impl std::fmt::Debug for SearchPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchPipeline")
            .field("vector", &self.vector)
            .field("graph", &self.graph)
            .finish()
    }
}

fn spawn_search_branch(
    branch: &Pipeline,
    state: &Arc<SharedRunState>,
    ctx: &RunContext,
    senders: &mut Vec<mpsc::UnboundedSender<Result<PipeItem>>>,
) -> JoinHandle<Result<Vec<SearchResult>>> {
    let (tx, rx) = mpsc::unbounded_channel();
    senders.push(tx);
    let branch = branch.clone();
    let state = Arc::clone(state);
    let ctx = ctx.clone();
    tokio::spawn(async move {
        let input = PipeInput::from_stream(UnboundedReceiverStream::new(rx).boxed());
        let items = branch
            .run(input, Some(state), false, Some(&ctx))
            .await?
            .items()?;
        Ok(ranked_results(items))
    })
}

async fn join_search_branch(
    task: Option<JoinHandle<Result<Vec<SearchResult>>>>,
) -> Result<Option<Vec<SearchResult>>> {
    match task {
        None => Ok(None),
        Some(handle) => match handle.await {
            Ok(result) => result.map(Some),
            Err(join_error) => Err(RagStreamError::Task {
                message: join_error.to_string(),
            }),
        },
    }
}

/// Extracts the search results from a branch's output, sorted by score
/// descending; the sort is stable, so ties keep their retrieval order.
fn ranked_results(items: Vec<PipeItem>) -> Vec<SearchResult> {
    let mut results: Vec<SearchResult> = items
        .into_iter()
        .filter_map(|item| match item {
            PipeItem::SearchResult(result) => Some(result),
            _ => None,
        })
        .collect();
    results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
    results
}
