//! Built-in pipes
//!
//! Ready-made [`crate::pipeline::Pipe`] implementations over the provider
//! traits in [`crate::core::traits`]: parsing, fragmenting + embedding,
//! knowledge-graph extraction, the two search pipes, and generation.

pub mod embedding;
pub mod generation;
pub mod kg;
pub mod parsing;
pub mod search;

pub use embedding::EmbeddingPipe;
pub use generation::GenerationPipe;
pub use kg::KgExtractionPipe;
pub use parsing::ParsingPipe;
pub use search::{GraphSearchPipe, VectorSearchPipe};
