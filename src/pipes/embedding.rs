//! Fragmenting and embedding pipe

use crate::config::PipeConfig;
use crate::core::traits::{Embedder, VectorStore};
use crate::core::{
    Extraction, Fragment, FragmentId, RagStreamError, Result, VectorEntry,
};
use crate::pipeline::pipe::{Pipe, PipeBase, PipeContext};
use crate::pipeline::types::{ItemStream, PipeInput, PipeItem};
use crate::state::{field, SharedRunState};
use crate::telemetry::ThroughputSample;
use async_trait::async_trait;
use chrono::Utc;
use futures::{StreamExt, TryStreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Default fragment size in characters when the config carries no
/// `fragment_chars` override.
pub const DEFAULT_FRAGMENT_CHARS: usize = 512;

/// Splits extractions into fragments, embeds each extraction's fragments
/// as one batch, and upserts them into the vector store.
///
/// Emits one [`PipeItem::Vector`] per stored fragment. Writes the running
/// `fragment_count` to shared state under the pipe's name and records a
/// `fragments` throughput sample per extraction when a sink is attached.
pub struct EmbeddingPipe {
    base: Arc<PipeBase>,
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn VectorStore>,
    fragment_chars: usize,
}

impl EmbeddingPipe {
    /// Creates the pipe; `fragment_chars` comes from the config's extra
    /// fields, defaulting to [`DEFAULT_FRAGMENT_CHARS`].
    pub fn new(
        config: PipeConfig,
        embedder: Arc<dyn Embedder>,
        store: Arc<dyn VectorStore>,
    ) -> Result<Arc<Self>> {
        let fragment_chars = config
            .extra_value::<usize>("fragment_chars")
            .unwrap_or(DEFAULT_FRAGMENT_CHARS);
        if fragment_chars == 0 {
            return Err(RagStreamError::config("fragment_chars must be at least 1"));
        }
        Ok(Arc::new(Self {
            base: PipeBase::new(config),
            embedder,
            store,
            fragment_chars,
        }))
    }
}

#[async_trait]
impl Pipe for EmbeddingPipe {
    fn base(&self) -> &Arc<PipeBase> {
        &self.base
    }

    async fn run_logic(
        &self,
        input: PipeInput,
        state: Arc<SharedRunState>,
        ctx: PipeContext,
    ) -> Result<ItemStream> {
        let embedder = Arc::clone(&self.embedder);
        let store = Arc::clone(&self.store);
        let fragment_chars = self.fragment_chars;
        let name = self.name().to_string();
        let count = Arc::new(AtomicU64::new(0));

        let output = input
            .message
            .and_then(move |item| {
                let embedder = Arc::clone(&embedder);
                let store = Arc::clone(&store);
                let ctx = ctx.clone();
                let state = Arc::clone(&state);
                let name = name.clone();
                let count = Arc::clone(&count);
                async move {
                    let extraction = match item {
                        PipeItem::Extraction(extraction) => extraction,
                        other => {
                            return Err(RagStreamError::config(format!(
                                "embedding pipe expects extraction items, got {other:?}"
                            )))
                        }
                    };
                    let vectors =
                        embed_extraction(extraction, fragment_chars, &embedder, &store, &ctx)
                            .await?;
                    let total = count.fetch_add(vectors.len() as u64, Ordering::Relaxed)
                        + vectors.len() as u64;
                    state.update(&name, field("fragment_count", total))?;
                    Ok(PipeItem::Many(vectors))
                }
            })
            .boxed();
        Ok(output)
    }
}

async fn embed_extraction(
    extraction: Extraction,
    fragment_chars: usize,
    embedder: &Arc<dyn Embedder>,
    store: &Arc<dyn VectorStore>,
    ctx: &PipeContext,
) -> Result<Vec<PipeItem>> {
    let fragments = fragment_extraction(&extraction, fragment_chars);
    if fragments.is_empty() {
        return Ok(Vec::new());
    }

    let texts: Vec<String> = fragments.iter().map(|f| f.text.clone()).collect();
    let vectors = embedder.embed(&texts).await?;
    if vectors.len() != fragments.len() {
        return Err(RagStreamError::provider(
            "embedder",
            format!(
                "embedder returned {} vectors for {} fragments",
                vectors.len(),
                fragments.len()
            ),
        ));
    }

    let entries: Vec<VectorEntry> = fragments
        .iter()
        .zip(vectors)
        .map(|(fragment, vector)| VectorEntry {
            id: fragment.id.to_string(),
            vector,
            metadata: fragment.metadata.clone(),
        })
        .collect();
    store.upsert(entries.clone()).await?;

    if let Some(sink) = ctx.run().sink() {
        let sample = ThroughputSample {
            timestamp: Utc::now(),
            count: entries.len() as u64,
            category: "fragments".to_string(),
        };
        if let Err(error) = sink.record_throughput(sample).await {
            tracing::warn!(%error, "throughput sample dropped");
        }
    }

    Ok(entries.into_iter().map(PipeItem::Vector).collect())
}

/// Splits an extraction into fragments of at most `max_chars` characters,
/// breaking at whitespace. A single word longer than `max_chars` becomes
/// its own oversized fragment rather than being split mid-word.
///
/// Fragment ids are deterministic (`extraction_id:ordinal`); metadata
/// inherits the extraction's metadata extended with `extraction_id`,
/// `document_id`, and the fragment `text`.
pub fn fragment_extraction(extraction: &Extraction, max_chars: usize) -> Vec<Fragment> {
    let mut chunks: Vec<String> = Vec::new();
    let mut current = String::new();
    for word in extraction.text.split_whitespace() {
        if !current.is_empty() && current.len() + 1 + word.len() > max_chars {
            chunks.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(word);
    }
    if !current.is_empty() {
        chunks.push(current);
    }

    chunks
        .into_iter()
        .enumerate()
        .map(|(ordinal, text)| {
            let mut metadata = extraction.metadata.clone();
            metadata.insert(
                "extraction_id".to_string(),
                extraction.id.to_string().into(),
            );
            metadata.insert(
                "document_id".to_string(),
                extraction.document_id.to_string().into(),
            );
            metadata.insert("text".to_string(), text.clone().into());
            Fragment {
                id: FragmentId::derive(&extraction.id, ordinal),
                text,
                metadata,
                extraction_id: extraction.id.clone(),
                document_id: extraction.document_id.clone(),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::mock_providers::{MockEmbedder, MockVectorStore};
    use crate::core::{DocumentId, ExtractionId, PipelineType};
    use crate::tracking::RunTracker;

    fn extraction(id: &str, text: &str) -> Extraction {
        Extraction {
            id: ExtractionId::new(id),
            text: text.to_string(),
            metadata: Default::default(),
            document_id: DocumentId::new("d1"),
        }
    }

    #[test]
    fn test_fragments_break_at_whitespace() {
        let fragments = fragment_extraction(&extraction("e1", "aa bb cc dd"), 5);
        let texts: Vec<&str> = fragments.iter().map(|f| f.text.as_str()).collect();
        assert_eq!(texts, vec!["aa bb", "cc dd"]);
        assert_eq!(fragments[0].id.to_string(), "e1:0");
        assert_eq!(fragments[1].id.to_string(), "e1:1");
        assert_eq!(
            fragments[0].metadata.get("text"),
            Some(&serde_json::json!("aa bb"))
        );
    }

    #[test]
    fn test_oversized_word_becomes_own_fragment() {
        let fragments = fragment_extraction(&extraction("e1", "tiny enormousword x"), 6);
        let texts: Vec<&str> = fragments.iter().map(|f| f.text.as_str()).collect();
        assert_eq!(texts, vec!["tiny", "enormousword", "x"]);
    }

    #[tokio::test]
    async fn test_embeds_and_upserts_each_extraction() {
        let tracker = RunTracker::new();
        let ctx = tracker.begin_run(PipelineType::Ingestion).await;
        let store = Arc::new(MockVectorStore::new());
        let pipe = EmbeddingPipe::new(
            PipeConfig::new("embed").unwrap(),
            Arc::new(MockEmbedder::new(8)),
            store.clone(),
        )
        .unwrap();
        let state = Arc::new(SharedRunState::new());

        let input = PipeInput::from_items(vec![PipeItem::Extraction(extraction(
            "e1",
            "some short text",
        ))]);
        let output = pipe.run(input, Arc::clone(&state), &ctx).await.unwrap();
        let items: Vec<PipeItem> = output.try_collect().await.unwrap();
        assert_eq!(items.len(), 1);
        assert!(matches!(&items[0], PipeItem::Many(inner) if inner.len() == 1));
        assert_eq!(
            state.get("embed", "fragment_count", None).unwrap(),
            serde_json::json!(1)
        );
    }
}
