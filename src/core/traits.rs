//! Collaborator capability traits
//!
//! The engine composes pipelines out of pipes; the pipes in turn depend on
//! external collaborators through these narrow async interfaces. Concrete
//! parsers, embedding providers, vector indexes, graph stores and language
//! models live behind these seams - their internals are not the engine's
//! concern.

use crate::core::{Document, Extraction, Result, SearchResult, Triple, VectorEntry};
use async_trait::async_trait;
use futures::stream::BoxStream;

/// A lazily-produced stream of extractions from a parser.
pub type ExtractionStream = BoxStream<'static, Result<Extraction>>;

/// A lazily-produced stream of completion token fragments.
pub type TokenStream = BoxStream<'static, Result<String>>;

/// Converts raw documents into a lazy stream of extractions.
#[async_trait]
pub trait Parser: Send + Sync {
    /// Parse one document. The returned stream is forward-only and
    /// non-restartable.
    async fn parse(&self, document: Document) -> Result<ExtractionStream>;
}

/// Converts text into fixed-dimension embedding vectors.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a batch of texts; the output order matches the input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Dimensionality of the produced vectors.
    fn dimension(&self) -> usize;
}

/// Stores embedding vectors and answers similarity queries.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Insert or replace entries by id.
    async fn upsert(&self, entries: Vec<VectorEntry>) -> Result<()>;

    /// Return up to `limit` most similar entries, best first.
    async fn search(&self, query: &[f32], limit: usize) -> Result<Vec<SearchResult>>;
}

/// Stores knowledge-graph triples and answers structured queries.
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Extract whatever graph structure the store supports from one
    /// extraction and persist it; returns the number of triples stored.
    async fn ingest(&self, extraction: Extraction) -> Result<usize>;

    /// Insert pre-built triples directly.
    async fn upsert_triples(&self, triples: Vec<Triple>) -> Result<()>;

    /// Run a structured query and return matching rows as search results.
    async fn structured_query(&self, query: &str) -> Result<Vec<SearchResult>>;
}

/// One chat message handed to the language model.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Message {
    /// Speaker role, e.g. "system" or "user"
    pub role: String,
    /// Message content
    pub content: String,
}

impl Message {
    /// A user-role message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    /// A system-role message.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }
}

/// Options controlling a single completion call.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct GenerationOptions {
    /// Model identifier understood by the provider
    pub model: String,
    /// Upper bound on generated tokens
    pub max_tokens: usize,
    /// Sampling temperature
    pub temperature: f32,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            model: "default".to_string(),
            max_tokens: 1024,
            temperature: 0.1,
        }
    }
}

/// A finished, non-streaming completion.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Completion {
    /// The generated text
    pub text: String,
}

/// Generates completions from chat messages, optionally as a token stream.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Generate one completion and return it whole.
    async fn complete(
        &self,
        messages: &[Message],
        options: &GenerationOptions,
    ) -> Result<Completion>;

    /// Generate one completion as a lazy stream of token fragments.
    async fn complete_stream(
        &self,
        messages: &[Message],
        options: &GenerationOptions,
    ) -> Result<TokenStream>;
}
