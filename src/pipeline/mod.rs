//! Pipeline execution engine
//!
//! The building blocks for composing ingestion, search, and RAG flows:
//! the [`Pipe`] trait and its lifecycle plumbing, the [`Pipeline`]
//! composition with cross-pipe bindings, the fan-out variants for
//! branching flows, and the streaming wire protocol for RAG responses.

pub mod ingestion;
pub mod logging;
pub mod pipe;
#[allow(clippy::module_inception)]
pub mod pipeline;
pub mod rag;
pub mod search;
pub mod streaming;
pub mod types;

pub use ingestion::{IngestionOutcome, IngestionPipeline};
pub use logging::{spawn_log_worker, LogWorker, PipeLogger};
pub use pipe::{Pipe, PipeBase, PipeContext, PipeState};
pub use pipeline::{Binding, Pipeline, PipelineOutput, MESSAGE_FIELD};
pub use rag::{RagOutcome, RagPipeline};
pub use search::SearchPipeline;
pub use streaming::{
    assemble_rag_stream, split_rag_stream, RagStreamPrelude, RagStreamSections,
    MARKER_COMPLETION_CLOSE, MARKER_COMPLETION_OPEN, MARKER_CONTEXT_CLOSE, MARKER_CONTEXT_OPEN,
    MARKER_METADATA_CLOSE, MARKER_METADATA_OPEN, MARKER_SEARCH_CLOSE, MARKER_SEARCH_OPEN,
};
pub use types::{ItemStream, PipeInput, PipeItem};
