//! End-to-end pipeline tests over the mock providers.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use ragstream_core::config::PipeConfig;
use ragstream_core::core::mock_providers::{
    MockEmbedder, MockGraphStore, MockLanguageModel, MockParser, MockVectorStore,
};
use ragstream_core::core::traits::GenerationOptions;
use ragstream_core::core::{Document, PipelineType};
use ragstream_core::pipeline::pipe::{PipeBase, PipeContext};
use ragstream_core::pipeline::rag::{RagOutcome, RagPipeline};
use ragstream_core::pipeline::{
    split_rag_stream, IngestionPipeline, Pipe, PipeInput, PipeItem, Pipeline, SearchPipeline,
};
use ragstream_core::pipes::{
    EmbeddingPipe, GenerationPipe, GraphSearchPipe, KgExtractionPipe, ParsingPipe,
    VectorSearchPipe,
};
use ragstream_core::telemetry::{keys, InMemorySink, TelemetrySink};
use ragstream_core::tracking::RunTracker;
use ragstream_core::{Result, SharedRunState};
use std::collections::BTreeMap;
use std::sync::Arc;

fn corpus() -> Vec<PipeItem> {
    vec![
        PipeItem::Document(Document::new(
            "d1",
            "rust is a systems language\nit has no garbage collector",
        )),
        PipeItem::Document(Document::new("d2", "pipelines move data in stages")),
    ]
}

fn single_pipe_pipeline(
    pipe: Arc<dyn Pipe>,
    pipeline_type: PipelineType,
    tracker: &Arc<RunTracker>,
) -> Pipeline {
    let mut pipeline = Pipeline::new(pipeline_type, tracker.clone());
    pipeline.add_pipe(pipe, vec![]).unwrap();
    pipeline
}

#[tokio::test]
async fn test_ingestion_fans_out_to_both_branches() {
    let tracker = Arc::new(RunTracker::new());
    let store = Arc::new(MockVectorStore::new());
    let graph = Arc::new(MockGraphStore::new());

    let parsing = single_pipe_pipeline(
        ParsingPipe::new(PipeConfig::new("parse").unwrap(), Arc::new(MockParser)),
        PipelineType::Ingestion,
        &tracker,
    );
    let embedding = single_pipe_pipeline(
        EmbeddingPipe::new(
            PipeConfig::new("embed").unwrap(),
            Arc::new(MockEmbedder::new(16)),
            store.clone(),
        )
        .unwrap(),
        PipelineType::Ingestion,
        &tracker,
    );
    let kg = single_pipe_pipeline(
        KgExtractionPipe::new(PipeConfig::new("kg").unwrap(), graph.clone()),
        PipelineType::Ingestion,
        &tracker,
    );

    let pipeline =
        IngestionPipeline::new(parsing, Some(embedding), Some(kg), tracker.clone()).unwrap();
    let outcome = pipeline.run(PipeInput::from_items(corpus())).await.unwrap();

    // Three extractions total; each branch must have consumed all of them.
    let vectors: usize = outcome
        .embedding
        .unwrap()
        .iter()
        .filter(|item| matches!(item, PipeItem::Vector(_)))
        .count();
    assert_eq!(vectors, 3);
    let kg_reports = outcome.kg.unwrap();
    assert_eq!(kg_reports.len(), 3);

    assert!(!store.is_empty());
    assert_eq!(
        tracker.pipeline_type_of(outcome.run_id),
        Some(PipelineType::Ingestion)
    );
}

async fn ingested_fixture(
    tracker: &Arc<RunTracker>,
) -> (Arc<MockVectorStore>, Arc<MockGraphStore>) {
    let store = Arc::new(MockVectorStore::new());
    let graph = Arc::new(MockGraphStore::new());
    let parsing = single_pipe_pipeline(
        ParsingPipe::new(PipeConfig::new("parse").unwrap(), Arc::new(MockParser)),
        PipelineType::Ingestion,
        tracker,
    );
    let embedding = single_pipe_pipeline(
        EmbeddingPipe::new(
            PipeConfig::new("embed").unwrap(),
            Arc::new(MockEmbedder::new(16)),
            store.clone(),
        )
        .unwrap(),
        PipelineType::Ingestion,
        tracker,
    );
    let kg = single_pipe_pipeline(
        KgExtractionPipe::new(PipeConfig::new("kg").unwrap(), graph.clone()),
        PipelineType::Ingestion,
        tracker,
    );
    IngestionPipeline::new(parsing, Some(embedding), Some(kg), tracker.clone())
        .unwrap()
        .run(PipeInput::from_items(corpus()))
        .await
        .unwrap();
    (store, graph)
}

fn search_pipeline(
    tracker: &Arc<RunTracker>,
    store: Arc<MockVectorStore>,
    graph: Arc<MockGraphStore>,
) -> SearchPipeline {
    let vector = single_pipe_pipeline(
        VectorSearchPipe::new(
            PipeConfig::new("vector_search").unwrap(),
            Arc::new(MockEmbedder::new(16)),
            store,
        )
        .unwrap(),
        PipelineType::Search,
        tracker,
    );
    let graph = single_pipe_pipeline(
        GraphSearchPipe::new(PipeConfig::new("graph_search").unwrap(), graph),
        PipelineType::Search,
        tracker,
    );
    SearchPipeline::new(Some(vector), Some(graph), tracker.clone()).unwrap()
}

#[tokio::test]
async fn test_search_aggregates_both_branches() {
    let sink = Arc::new(InMemorySink::new());
    let tracker = Arc::new(RunTracker::with_sink(sink.clone()));
    let (store, graph) = ingested_fixture(&tracker).await;

    let aggregate = search_pipeline(&tracker, store, graph)
        .run(vec!["rust systems language".to_string()])
        .await
        .unwrap();

    let vector = aggregate.vector_results.as_ref().unwrap();
    assert!(!vector.is_empty());
    for pair in vector.windows(2) {
        assert!(pair[0].score >= pair[1].score);
    }
    assert!(aggregate.graph_results.is_some());

    // Search telemetry landed under some run of type Search.
    let runs = sink.recent_runs(10, Some(PipelineType::Search)).await.unwrap();
    assert_eq!(runs.len(), 1);
    let events = sink
        .events_for_runs(&runs, 100)
        .await
        .unwrap()
        .remove(&runs[0])
        .unwrap_or_default();
    assert!(events.iter().any(|e| e.key == keys::SEARCH_QUERY));
}

#[tokio::test]
async fn test_rag_answer_cites_context() {
    let tracker = Arc::new(RunTracker::new());
    let (store, graph) = ingested_fixture(&tracker).await;

    let generation = GenerationPipe::new(
        PipeConfig::new("generate").unwrap(),
        Arc::new(MockLanguageModel),
        GenerationOptions::default(),
    );
    let rag = RagPipeline::new(
        search_pipeline(&tracker, store, graph),
        generation,
        tracker.clone(),
    );

    let RagOutcome::Completed { answer, search, .. } =
        rag.run("what is rust", false).await.unwrap()
    else {
        panic!("expected a completed outcome");
    };
    assert!(answer.contains("[1]"));
    assert!(!search.ranked().is_empty());
}

#[tokio::test]
async fn test_rag_streaming_protocol_is_well_formed() {
    let tracker = Arc::new(RunTracker::new());
    let (store, graph) = ingested_fixture(&tracker).await;

    let generation = GenerationPipe::new(
        PipeConfig::new("generate").unwrap(),
        Arc::new(MockLanguageModel),
        GenerationOptions::default(),
    );
    let rag = RagPipeline::new(
        search_pipeline(&tracker, store, graph),
        generation,
        tracker.clone(),
    );

    let RagOutcome::Streaming(chunks) = rag.run("what is rust", true).await.unwrap() else {
        panic!("expected a streaming outcome");
    };
    let chunks: Vec<String> = chunks
        .collect::<Vec<Result<String>>>()
        .await
        .into_iter()
        .collect::<Result<_>>()
        .unwrap();
    let full = chunks.concat();

    let sections = split_rag_stream(&full).unwrap();
    let results: serde_json::Value = serde_json::from_str(&sections.search).unwrap();
    assert!(results.is_array());
    let metadata: serde_json::Value = serde_json::from_str(&sections.metadata).unwrap();
    assert!(metadata.is_object());
    assert!(sections.context.contains("[1]"));
    assert!(!sections.completion.is_empty());
}

#[tokio::test]
async fn test_telemetry_round_trip_newest_first() {
    let sink = Arc::new(InMemorySink::new());
    let tracker = RunTracker::with_sink(sink.clone());
    let ctx = tracker.begin_run(PipelineType::Other).await;

    for i in 0..5 {
        ctx.log_info("step", serde_json::json!(i)).await;
    }

    let events = sink
        .events_for_runs(&[ctx.run_id], 10)
        .await
        .unwrap()
        .remove(&ctx.run_id)
        .unwrap_or_default();
    assert_eq!(events.len(), 5);
    let order: Vec<i64> = events
        .iter()
        .map(|e| e.value.as_i64().unwrap())
        .collect();
    assert_eq!(order, vec![4, 3, 2, 1, 0]);
}

/// Enqueues 150 events synchronously, far past the default queue capacity
/// of 100.
struct FloodingPipe {
    base: Arc<PipeBase>,
}

#[async_trait]
impl Pipe for FloodingPipe {
    fn base(&self) -> &Arc<PipeBase> {
        &self.base
    }

    async fn run_logic(
        &self,
        _input: PipeInput,
        _state: Arc<SharedRunState>,
        ctx: PipeContext,
    ) -> Result<ragstream_core::pipeline::ItemStream> {
        for i in 0..150 {
            ctx.enqueue_log("flood", serde_json::json!(i));
        }
        Ok(stream::empty().boxed())
    }
}

#[tokio::test]
async fn test_log_queue_overflow_drops_excess_but_completes() {
    let sink = Arc::new(InMemorySink::new());
    let tracker = Arc::new(RunTracker::with_sink(sink.clone()));

    let pipe = Arc::new(FloodingPipe {
        base: PipeBase::new(PipeConfig::new("flood").unwrap()),
    });
    let pipeline = single_pipe_pipeline(pipe, PipelineType::Other, &tracker);

    let items = pipeline
        .run(PipeInput::empty(), None, false, None)
        .await
        .unwrap()
        .items()
        .unwrap();
    assert!(items.is_empty());

    let runs = sink.recent_runs(1, None).await.unwrap();
    let events = sink
        .events_for_runs(&runs, 200)
        .await
        .unwrap()
        .remove(&runs[0])
        .unwrap_or_default();
    assert!(!events.is_empty());
    assert!(events.len() <= 100, "expected at most 100 events, got {}", events.len());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancellation_aborts_ingestion() {
    let tracker = Arc::new(RunTracker::new());

    // A parsing pipeline over a stream that never ends; cancelling the
    // run must abort the fan-out instead of hanging.
    let parsing = single_pipe_pipeline(
        ParsingPipe::new(PipeConfig::new("parse").unwrap(), Arc::new(MockParser)),
        PipelineType::Ingestion,
        &tracker,
    );
    let embedding = single_pipe_pipeline(
        EmbeddingPipe::new(
            PipeConfig::new("embed").unwrap(),
            Arc::new(MockEmbedder::new(8)),
            Arc::new(MockVectorStore::new()),
        )
        .unwrap(),
        PipelineType::Ingestion,
        &tracker,
    );
    let pipeline =
        IngestionPipeline::new(parsing, Some(embedding), None, tracker.clone()).unwrap();

    let documents = stream::unfold(0u64, |i| async move {
        Some((
            Ok(PipeItem::Document(Document::new(
                format!("d{i}"),
                "endless text",
            ))),
            i + 1,
        ))
    })
    .boxed();

    let ctx = tracker.begin_run(PipelineType::Ingestion).await;
    let task_ctx = ctx.clone();
    let run = tokio::spawn(async move {
        pipeline
            .run_with(PipeInput::from_stream(documents), &task_ctx)
            .await
    });
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    ctx.cancel();
    let result = run.await.unwrap();
    assert!(matches!(
        result,
        Err(ragstream_core::RagStreamError::Cancelled { .. })
    ));
}

#[tokio::test]
async fn test_two_stage_binding_multiset_preserved() {
    // Declared-order concatenation: the engine introduces no reordering.
    let tracker = Arc::new(RunTracker::new());
    let parsing = ParsingPipe::new(PipeConfig::new("parse").unwrap(), Arc::new(MockParser));
    let kg = KgExtractionPipe::new(
        PipeConfig::new("kg").unwrap(),
        Arc::new(MockGraphStore::new()),
    );

    let mut pipeline = Pipeline::new(PipelineType::Ingestion, tracker.clone());
    pipeline.add_pipe(parsing, vec![]).unwrap();
    pipeline.add_pipe(kg, vec![]).unwrap();

    let items = pipeline
        .run(PipeInput::from_items(corpus()), None, false, None)
        .await
        .unwrap()
        .items()
        .unwrap();

    let mut per_extraction: BTreeMap<String, u64> = BTreeMap::new();
    for item in &items {
        if let PipeItem::Value(value) = item {
            *per_extraction
                .entry(value["extraction_id"].as_str().unwrap().to_string())
                .or_insert(0) += 1;
        }
    }
    assert_eq!(per_extraction.len(), 3);
    assert!(per_extraction.values().all(|&count| count == 1));
}
