//! # RagStream Core
//!
//! Streaming pipeline engine for retrieval-augmented generation.
//!
//! This crate provides:
//! - A composable [`Pipe`]/[`Pipeline`] engine with declared cross-pipe
//!   data bindings and true stage-to-stage streaming
//! - Fan-out pipeline variants for ingestion (parse once, embed and
//!   graph-extract concurrently) and search (vector and graph branches)
//! - A RAG pipeline producing either a cited answer or the framed
//!   streaming wire protocol
//! - Per-run shared state, run tracking, and pluggable telemetry sinks
//!   with read-side analytics
//!
//! ## Quick Start
//!
//! ```rust
//! use ragstream_core::config::PipeConfig;
//! use ragstream_core::core::mock_providers::MockParser;
//! use ragstream_core::core::{Document, PipelineType};
//! use ragstream_core::pipeline::{Pipeline, PipeInput, PipeItem};
//! use ragstream_core::pipes::ParsingPipe;
//! use ragstream_core::tracking::RunTracker;
//! use std::sync::Arc;
//!
//! # async fn example() -> ragstream_core::Result<()> {
//! let tracker = Arc::new(RunTracker::new());
//! let mut pipeline = Pipeline::new(PipelineType::Ingestion, tracker);
//! pipeline.add_pipe(
//!     ParsingPipe::new(PipeConfig::new("parse")?, Arc::new(MockParser)),
//!     vec![],
//! )?;
//!
//! let input = PipeInput::from_items(vec![PipeItem::Document(Document::new(
//!     "doc-1",
//!     "first line\nsecond line",
//! ))]);
//! let extractions = pipeline.run(input, None, false, None).await?.items()?;
//! assert_eq!(extractions.len(), 2);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod config;
pub mod core;
pub mod pipeline;
pub mod pipes;
pub mod state;
pub mod telemetry;
pub mod tracking;

pub use crate::config::PipeConfig;
pub use crate::core::{RagStreamError, Result};
pub use crate::pipeline::{Binding, Pipe, PipeInput, PipeItem, Pipeline};
pub use crate::state::SharedRunState;
pub use crate::telemetry::TelemetrySink;
pub use crate::tracking::{RunContext, RunTracker};
