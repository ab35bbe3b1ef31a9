//! Knowledge-graph extraction pipe

use crate::config::PipeConfig;
use crate::core::traits::GraphStore;
use crate::core::{RagStreamError, Result};
use crate::pipeline::pipe::{Pipe, PipeBase, PipeContext};
use crate::pipeline::types::{ItemStream, PipeInput, PipeItem};
use crate::state::{field, SharedRunState};
use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Feeds each extraction into the graph store and reports how many
/// triples it produced. Writes the running `triple_count` to shared state
/// under the pipe's name.
pub struct KgExtractionPipe {
    base: Arc<PipeBase>,
    graph: Arc<dyn GraphStore>,
}

impl KgExtractionPipe {
    /// Creates the pipe over a graph-store provider.
    pub fn new(config: PipeConfig, graph: Arc<dyn GraphStore>) -> Arc<Self> {
        Arc::new(Self {
            base: PipeBase::new(config),
            graph,
        })
    }
}

#[async_trait]
impl Pipe for KgExtractionPipe {
    fn base(&self) -> &Arc<PipeBase> {
        &self.base
    }

    async fn run_logic(
        &self,
        input: PipeInput,
        state: Arc<SharedRunState>,
        _ctx: PipeContext,
    ) -> Result<ItemStream> {
        let graph = Arc::clone(&self.graph);
        let name = self.name().to_string();
        let count = Arc::new(AtomicU64::new(0));

        let output = input
            .message
            .and_then(move |item| {
                let graph = Arc::clone(&graph);
                let state = Arc::clone(&state);
                let name = name.clone();
                let count = Arc::clone(&count);
                async move {
                    let extraction = match item {
                        PipeItem::Extraction(extraction) => extraction,
                        other => {
                            return Err(RagStreamError::config(format!(
                                "kg pipe expects extraction items, got {other:?}"
                            )))
                        }
                    };
                    let extraction_id = extraction.id.clone();
                    let triples = graph.ingest(extraction).await?;
                    let total =
                        count.fetch_add(triples as u64, Ordering::Relaxed) + triples as u64;
                    state.update(&name, field("triple_count", total))?;
                    Ok(PipeItem::Value(json!({
                        "extraction_id": extraction_id.to_string(),
                        "triples": triples,
                    })))
                }
            })
            .boxed();
        Ok(output)
    }
}
