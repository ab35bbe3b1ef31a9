//! Document parsing pipe

use crate::config::PipeConfig;
use crate::core::traits::Parser;
use crate::core::{RagStreamError, Result};
use crate::pipeline::pipe::{Pipe, PipeBase, PipeContext};
use crate::pipeline::types::{ItemStream, PipeInput, PipeItem};
use crate::state::{field, SharedRunState};
use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Turns a stream of documents into a stream of extractions via a
/// [`Parser`] provider. Writes the running `extraction_count` to shared
/// state under the pipe's name.
pub struct ParsingPipe {
    base: Arc<PipeBase>,
    parser: Arc<dyn Parser>,
}

impl ParsingPipe {
    /// Creates the pipe over a parser provider.
    pub fn new(config: PipeConfig, parser: Arc<dyn Parser>) -> Arc<Self> {
        Arc::new(Self {
            base: PipeBase::new(config),
            parser,
        })
    }
}

#[async_trait]
impl Pipe for ParsingPipe {
    fn base(&self) -> &Arc<PipeBase> {
        &self.base
    }

    async fn run_logic(
        &self,
        input: PipeInput,
        state: Arc<SharedRunState>,
        _ctx: PipeContext,
    ) -> Result<ItemStream> {
        let parser = Arc::clone(&self.parser);
        let name = self.name().to_string();
        let count = Arc::new(AtomicU64::new(0));

        let output = input
            .message
            .and_then(move |item| {
                let parser = Arc::clone(&parser);
                async move {
                    match item {
                        PipeItem::Document(document) => {
                            let extractions = parser.parse(document).await?;
                            Ok(extractions.map_ok(PipeItem::Extraction).boxed())
                        }
                        other => Err(RagStreamError::config(format!(
                            "parsing pipe expects document items, got {other:?}"
                        ))),
                    }
                }
            })
            .try_flatten()
            .inspect_ok(move |_| {
                let total = count.fetch_add(1, Ordering::Relaxed) + 1;
                let _ = state.update(&name, field("extraction_count", total));
            })
            .boxed();
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::mock_providers::MockParser;
    use crate::core::{Document, PipelineType};
    use crate::tracking::RunTracker;

    #[tokio::test]
    async fn test_parses_each_document_into_extractions() {
        let tracker = RunTracker::new();
        let ctx = tracker.begin_run(PipelineType::Ingestion).await;
        let pipe = ParsingPipe::new(PipeConfig::new("parse").unwrap(), Arc::new(MockParser));
        let state = Arc::new(SharedRunState::new());

        let input = PipeInput::from_items(vec![PipeItem::Document(Document::new(
            "d1",
            "line one\nline two",
        ))]);
        let output = pipe
            .run(input, Arc::clone(&state), &ctx)
            .await
            .unwrap();
        let items: Vec<PipeItem> = output.try_collect().await.unwrap();

        let texts: Vec<&str> = items
            .iter()
            .filter_map(|item| match item {
                PipeItem::Extraction(e) => Some(e.text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(texts, vec!["line one", "line two"]);
        assert_eq!(
            state.get("parse", "extraction_count", None).unwrap(),
            serde_json::json!(2)
        );
    }

    #[tokio::test]
    async fn test_non_document_input_is_an_error() {
        let tracker = RunTracker::new();
        let ctx = tracker.begin_run(PipelineType::Ingestion).await;
        let pipe = ParsingPipe::new(PipeConfig::new("parse").unwrap(), Arc::new(MockParser));

        let input = PipeInput::from_items(vec![PipeItem::Text("not a document".to_string())]);
        let output = pipe
            .run(input, Arc::new(SharedRunState::new()), &ctx)
            .await
            .unwrap();
        let collected: Result<Vec<PipeItem>> = output.try_collect().await;
        assert!(collected.is_err());
    }
}
