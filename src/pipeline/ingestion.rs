//! Branching ingestion pipeline
//!
//! Runs a parsing pipeline once and fans its output out to an embedding
//! branch and a knowledge-graph branch, each a full [`Pipeline`] running
//! concurrently on its own task. Every parsed item is duplicated to every
//! active branch before the next item is pulled, so neither branch can
//! starve the other; closing the branch channels is the end-of-input
//! signal.

use crate::core::{PipelineType, RagStreamError, Result, RunId};
use crate::pipeline::pipeline::{Pipeline, PipelineOutput};
use crate::pipeline::types::{PipeInput, PipeItem};
use crate::state::SharedRunState;
use crate::tracking::{RunContext, RunTracker};
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// The materialized output of each branch of an ingestion run.
#[derive(Debug)]
pub struct IngestionOutcome {
    /// Run id shared by the parsing pipeline and every branch
    pub run_id: RunId,
    /// Output of the embedding branch, if configured
    pub embedding: Option<Vec<PipeItem>>,
    /// Output of the knowledge-graph branch, if configured
    pub kg: Option<Vec<PipeItem>>,
}

/// A parsing pipeline fanned out to embedding and knowledge-graph branches.
pub struct IngestionPipeline {
    parsing: Pipeline,
    embedding: Option<Pipeline>,
    kg: Option<Pipeline>,
    tracker: Arc<RunTracker>,
}

impl IngestionPipeline {
    /// Assembles the branching pipeline.
    ///
    /// At least one branch must be present; parsing with nowhere to send
    /// the output is a configuration error.
    pub fn new(
        parsing: Pipeline,
        embedding: Option<Pipeline>,
        kg: Option<Pipeline>,
        tracker: Arc<RunTracker>,
    ) -> Result<Self> {
        if embedding.is_none() && kg.is_none() {
            return Err(RagStreamError::config(
                "ingestion pipeline needs at least one of the embedding and kg branches",
            ));
        }
        Ok(Self {
            parsing,
            embedding,
            kg,
            tracker,
        })
    }

    /// Runs parsing once and both branches to completion.
    ///
    /// One run id covers the whole fan-out: the branch pipelines reuse
    /// the parent [`RunContext`] instead of opening runs of their own, so
    /// telemetry from every branch correlates to the same run.
    pub async fn run(&self, input: PipeInput) -> Result<IngestionOutcome> {
        let ctx = self.tracker.begin_run(PipelineType::Ingestion).await;
        let result = self.run_with(input, &ctx).await;
        self.tracker.end_run(&ctx);
        result
    }

    /// Runs the fan-out inside an existing run context, for callers that
    /// own the run (and its cancellation token) themselves.
    pub async fn run_with(&self, input: PipeInput, ctx: &RunContext) -> Result<IngestionOutcome> {
        let result = self.run_branches(input, ctx).await;
        if let Err(error) = &result {
            tracing::error!(run_id = %ctx.run_id, %error, "ingestion run failed");
        }
        result
    }

    async fn run_branches(&self, input: PipeInput, ctx: &RunContext) -> Result<IngestionOutcome> {
        let state = Arc::new(SharedRunState::new());

        let parsed = match self
            .parsing
            .run(input, Some(Arc::clone(&state)), true, Some(ctx))
            .await?
        {
            PipelineOutput::Streaming(stream) => stream,
            PipelineOutput::Completed(items) => {
                futures::stream::iter(items.into_iter().map(Ok)).boxed()
            }
        };

        let mut senders = Vec::new();
        let embedding_task = self
            .embedding
            .as_ref()
            .map(|branch| spawn_branch(branch, &state, ctx, &mut senders));
        let kg_task = self
            .kg
            .as_ref()
            .map(|branch| spawn_branch(branch, &state, ctx, &mut senders));

        // Duplicate each item to every branch before advancing, then drop
        // the senders so the branches see end-of-input.
        let duplication = duplicate(parsed, senders, ctx.clone());

        let (dup_result, embedding, kg) = tokio::join!(
            duplication,
            join_branch(embedding_task),
            join_branch(kg_task),
        );
        dup_result?;
        Ok(IngestionOutcome {
            run_id: ctx.run_id,
            embedding: embedding?,
            kg: kg?,
        })
    }
}

impl std::fmt::Debug for IngestionPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestionPipeline")
            .field("parsing", &self.parsing)
            .field("embedding", &self.embedding)
            .field("kg", &self.kg)
            .finish()
    }
}

fn spawn_branch(
    branch: &Pipeline,
    state: &Arc<SharedRunState>,
    ctx: &RunContext,
    senders: &mut Vec<mpsc::UnboundedSender<Result<PipeItem>>>,
) -> JoinHandle<Result<Vec<PipeItem>>> {
    let (tx, rx) = mpsc::unbounded_channel();
    senders.push(tx);
    let branch = branch.clone();
    let state = Arc::clone(state);
    let ctx = ctx.clone();
    tokio::spawn(async move {
        let input = PipeInput::from_stream(UnboundedReceiverStream::new(rx).boxed());
        branch
            .run(input, Some(state), false, Some(&ctx))
            .await?
            .items()
    })
}

async fn join_branch(
    task: Option<JoinHandle<Result<Vec<PipeItem>>>>,
) -> Result<Option<Vec<PipeItem>>> {
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

/// Forwards every item to every sender; a closed receiver is ignored, its
/// branch reports its own failure at join time.
pub(crate) async fn duplicate(
    mut source: crate::pipeline::types::ItemStream,
    senders: Vec<mpsc::UnboundedSender<Result<PipeItem>>>,
    ctx: RunContext,
) -> Result<()> {
    loop {
        tokio::select! {
            () = ctx.cancellation().cancelled() => {
                return Err(RagStreamError::Cancelled { run_id: ctx.run_id });
            }
            next = source.next() => match next {
                Some(Ok(item)) => {
                    for tx in &senders {
                        let _ = tx.send(Ok(item.clone()));
                    }
                }
                Some(Err(error)) => return Err(error),
                None => return Ok(()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipeConfig;
    use crate::pipeline::pipe::{Pipe, PipeBase, PipeContext};
    use crate::pipeline::types::ItemStream;
    use async_trait::async_trait;
    use std::collections::BTreeMap;

    struct TagPipe {
        base: Arc<PipeBase>,
        tag: &'static str,
    }

    impl TagPipe {
        fn pipeline(name: &str, tag: &'static str, tracker: &Arc<RunTracker>) -> Pipeline {
            let mut pipeline = Pipeline::new(PipelineType::Ingestion, tracker.clone());
            pipeline
                .add_pipe(
                    Arc::new(Self {
                        base: PipeBase::new(PipeConfig::new(name).unwrap()),
                        tag,
                    }),
                    vec![],
                )
                .unwrap();
            pipeline
        }
    }

    #[async_trait]
    impl Pipe for TagPipe {
        fn base(&self) -> &Arc<PipeBase> {
            &self.base
        }

        async fn run_logic(
            &self,
            input: PipeInput,
            _state: Arc<SharedRunState>,
            _ctx: PipeContext,
        ) -> Result<ItemStream> {
            let tag = self.tag;
            Ok(input
                .message
                .map(move |item| {
                    item.map(|item| match item {
                        PipeItem::Text(text) => PipeItem::Text(format!("{tag}:{text}")),
                        other => other,
                    })
                })
                .boxed())
        }
    }

    fn multiset(items: &[PipeItem]) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for item in items {
            if let Some(text) = item.as_text() {
                *counts.entry(text.to_string()).or_insert(0) += 1;
            }
        }
        counts
    }

    #[tokio::test]
    async fn test_both_branches_see_every_item() {
        let tracker = Arc::new(RunTracker::new());
        let pipeline = IngestionPipeline::new(
            TagPipe::pipeline("parse", "p", &tracker),
            Some(TagPipe::pipeline("embed", "e", &tracker)),
            Some(TagPipe::pipeline("kg", "k", &tracker)),
            tracker.clone(),
        )
        .unwrap();

        let input = PipeInput::from_items(vec![
            PipeItem::Text("a".to_string()),
            PipeItem::Text("b".to_string()),
            PipeItem::Text("a".to_string()),
        ]);
        let outcome = pipeline.run(input).await.unwrap();

        let embedding = multiset(&outcome.embedding.unwrap());
        let expected: BTreeMap<String, usize> = [
            ("e:p:a".to_string(), 2),
            ("e:p:b".to_string(), 1),
        ]
        .into_iter()
        .collect();
        assert_eq!(embedding, expected);

        let kg = multiset(&outcome.kg.unwrap());
        let expected: BTreeMap<String, usize> = [
            ("k:p:a".to_string(), 2),
            ("k:p:b".to_string(), 1),
        ]
        .into_iter()
        .collect();
        assert_eq!(kg, expected);
    }

    #[tokio::test]
    async fn test_single_branch_allowed_but_not_zero() {
        let tracker = Arc::new(RunTracker::new());
        assert!(IngestionPipeline::new(
            TagPipe::pipeline("parse", "p", &tracker),
            None,
            None,
            tracker.clone(),
        )
        .is_err());

        let pipeline = IngestionPipeline::new(
            TagPipe::pipeline("parse", "p", &tracker),
            Some(TagPipe::pipeline("embed", "e", &tracker)),
            None,
            tracker.clone(),
        )
        .unwrap();
        let outcome = pipeline
            .run(PipeInput::from_items(vec![PipeItem::Text("x".to_string())]))
            .await
            .unwrap();
        assert_eq!(
            outcome.embedding.unwrap()[0].as_text(),
            Some("e:p:x")
        );
        assert!(outcome.kg.is_none());
    }
}
