//! Vector and graph search pipes

use crate::config::PipeConfig;
use crate::core::traits::{Embedder, GraphStore, VectorStore};
use crate::core::{RagStreamError, Result, SearchResult};
use crate::pipeline::pipe::{Pipe, PipeBase, PipeContext};
use crate::pipeline::types::{ItemStream, PipeInput, PipeItem};
use crate::state::SharedRunState;
use crate::telemetry::keys;
use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;

/// Default number of hits per query when the config carries no `limit`.
pub const DEFAULT_SEARCH_LIMIT: usize = 10;

fn query_text(item: PipeItem) -> Result<String> {
    match item {
        PipeItem::Text(query) => Ok(query),
        other => Err(RagStreamError::config(format!(
            "search pipes expect text queries, got {other:?}"
        ))),
    }
}

fn log_results(ctx: &PipeContext, query: &str, results: &[SearchResult]) {
    ctx.enqueue_log(keys::SEARCH_QUERY, json!(query));
    if let Ok(serialized) = serde_json::to_value(results) {
        ctx.enqueue_log(keys::SEARCH_RESULTS, serialized);
    }
    for result in results {
        ctx.enqueue_log(keys::RELEVANCE_SCORE, json!(result.score));
    }
}

/// Embeds each text query and searches the vector store, emitting one
/// [`PipeItem::SearchResult`] batch per query. Logs the query, the result
/// set, and every relevance score through the telemetry queue.
pub struct VectorSearchPipe {
    base: Arc<PipeBase>,
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn VectorStore>,
    limit: usize,
}

impl VectorSearchPipe {
    /// Creates the pipe; `limit` comes from the config's extra fields,
    /// defaulting to [`DEFAULT_SEARCH_LIMIT`].
    pub fn new(
        config: PipeConfig,
        embedder: Arc<dyn Embedder>,
        store: Arc<dyn VectorStore>,
    ) -> Result<Arc<Self>> {
        let limit = config
            .extra_value::<usize>("limit")
            .unwrap_or(DEFAULT_SEARCH_LIMIT);
        if limit == 0 {
            return Err(RagStreamError::config("search limit must be at least 1"));
        }
        Ok(Arc::new(Self {
            base: PipeBase::new(config),
            embedder,
            store,
            limit,
        }))
    }
}

#[async_trait]
impl Pipe for VectorSearchPipe {
    fn base(&self) -> &Arc<PipeBase> {
        &self.base
    }

    async fn run_logic(
        &self,
        input: PipeInput,
        _state: Arc<SharedRunState>,
        ctx: PipeContext,
    ) -> Result<ItemStream> {
        let embedder = Arc::clone(&self.embedder);
        let store = Arc::clone(&self.store);
        let limit = self.limit;

        let output = input
            .message
            .and_then(move |item| {
                let embedder = Arc::clone(&embedder);
                let store = Arc::clone(&store);
                let ctx = ctx.clone();
                async move {
                    let query = query_text(item)?;
                    let vectors = embedder.embed(std::slice::from_ref(&query)).await?;
                    let vector = vectors.into_iter().next().ok_or_else(|| {
                        RagStreamError::provider("embedder", "no vector for query")
                    })?;
                    let results = store.search(&vector, limit).await?;
                    log_results(&ctx, &query, &results);
                    Ok(PipeItem::Many(
                        results.into_iter().map(PipeItem::SearchResult).collect(),
                    ))
                }
            })
            .boxed();
        Ok(output)
    }
}

/// Runs each text query against the graph store's structured query
/// interface, emitting one [`PipeItem::SearchResult`] batch per query and
/// logging the query latency.
pub struct GraphSearchPipe {
    base: Arc<PipeBase>,
    graph: Arc<dyn GraphStore>,
}

impl GraphSearchPipe {
    /// Creates the pipe over a graph-store provider.
    pub fn new(config: PipeConfig, graph: Arc<dyn GraphStore>) -> Arc<Self> {
        Arc::new(Self {
            base: PipeBase::new(config),
            graph,
        })
    }
}

#[async_trait]
impl Pipe for GraphSearchPipe {
    fn base(&self) -> &Arc<PipeBase> {
        &self.base
    }

    async fn run_logic(
        &self,
        input: PipeInput,
        _state: Arc<SharedRunState>,
        ctx: PipeContext,
    ) -> Result<ItemStream> {
        let graph = Arc::clone(&self.graph);

        let output = input
            .message
            .and_then(move |item| {
                let graph = Arc::clone(&graph);
                let ctx = ctx.clone();
                async move {
                    let query = query_text(item)?;
                    let started = Instant::now();
                    let results = graph.structured_query(&query).await?;
                    ctx.enqueue_log(
                        keys::GRAPH_SEARCH_LATENCY_MS,
                        json!(started.elapsed().as_millis() as u64),
                    );
                    log_results(&ctx, &query, &results);
                    Ok(PipeItem::Many(
                        results.into_iter().map(PipeItem::SearchResult).collect(),
                    ))
                }
            })
            .boxed();
        Ok(output)
    }
}
