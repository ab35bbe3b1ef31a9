//! Core data structures and abstractions for the pipeline engine
//!
//! This module contains the fundamental types, traits, and error handling
//! that power the engine: newtype identifiers, the immutable data model
//! flowing through pipelines, and the collaborator capability traits.

pub mod error;
pub mod mock_providers;
pub mod traits;

pub use error::{RagStreamError, Result};
pub use traits::{
    Completion, Embedder, GenerationOptions, GraphStore, LanguageModel, Message, Parser,
    TokenStream, VectorStore,
};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Free-form metadata attached to documents, extractions and results.
///
/// A sorted map keeps serialized output deterministic.
pub type Metadata = BTreeMap<String, serde_json::Value>;

/// Unique identifier for documents
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocumentId(pub String);

impl DocumentId {
    /// Creates a new DocumentId from a string
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for DocumentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for DocumentId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Unique identifier for extractions
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExtractionId(pub String);

impl ExtractionId {
    /// Creates a new ExtractionId from a string
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for ExtractionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for fragments (embedding-sized sub-spans of an
/// extraction)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FragmentId(pub String);

impl FragmentId {
    /// Derives the deterministic fragment id for an extraction and ordinal.
    ///
    /// The same `(extraction, ordinal)` pair always yields the same id.
    pub fn derive(extraction: &ExtractionId, ordinal: usize) -> Self {
        Self(format!("{}:{ordinal}", extraction.0))
    }
}

impl std::fmt::Display for FragmentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for one top-level pipeline invocation.
///
/// Random and collision-resistant; every log event for the run references it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub Uuid);

impl RunId {
    /// Issues a fresh random run id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The fixed set of pipeline kinds the engine accepts.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PipelineType {
    /// Document ingestion (parsing fanned out into embedding/kg branches)
    Ingestion,
    /// Vector + graph search
    Search,
    /// Search followed by answer generation
    Rag,
    /// Evaluation runs
    Eval,
    /// Anything that is none of the above
    Other,
}

/// A raw source document prior to parsing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Unique document identifier
    pub id: DocumentId,
    /// Raw text payload
    pub text: String,
    /// Free-form metadata
    pub metadata: Metadata,
}

impl Document {
    /// Creates a document with empty metadata.
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: DocumentId::new(id),
            text: text.into(),
            metadata: Metadata::new(),
        }
    }
}

/// One parsed unit of a source document.
///
/// Produced by parsing, consumed by fragmenting/embedding and by graph
/// extraction. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Extraction {
    /// Unique extraction identifier
    pub id: ExtractionId,
    /// Raw text payload
    pub text: String,
    /// Free-form metadata
    pub metadata: Metadata,
    /// Owning document
    pub document_id: DocumentId,
}

/// An embedding-sized sub-span of an extraction.
///
/// The id is derived deterministically from the extraction id and the
/// fragment's ordinal; metadata inherits the extraction's metadata and may
/// extend it. Not mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fragment {
    /// Deterministic fragment identifier (`extraction_id:ordinal`)
    pub id: FragmentId,
    /// Fragment text
    pub text: String,
    /// Inherited + extended metadata
    pub metadata: Metadata,
    /// Back-reference to the owning extraction
    pub extraction_id: ExtractionId,
    /// Back-reference to the owning document
    pub document_id: DocumentId,
}

/// A stored embedding vector with its metadata.
///
/// Created by the embedding pipe; owned thereafter by the vector store
/// collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorEntry {
    /// Identifier (normally the fragment id)
    pub id: String,
    /// The embedding vector
    pub vector: Vec<f32>,
    /// Metadata stored alongside the vector; must carry enough of the
    /// original text for later context construction
    pub metadata: Metadata,
}

/// One retrieval hit from the vector store or graph store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    /// Identifier of the matched entry
    pub id: String,
    /// Relevance score, higher is better
    pub score: f32,
    /// Metadata including the original text/title
    pub metadata: Metadata,
}

impl SearchResult {
    /// Best-effort display text for context construction: `text`, then
    /// `title`, then the raw id.
    pub fn display_text(&self) -> String {
        for key in ["text", "title"] {
            if let Some(serde_json::Value::String(s)) = self.metadata.get(key) {
                return s.clone();
            }
        }
        self.id.clone()
    }
}

/// The joined result of the vector-search branch and the graph-search
/// branch for one query.
///
/// Either branch may be `None` when that sub-pipeline is not configured.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AggregateSearchResult {
    /// Results from the vector-search branch
    pub vector_results: Option<Vec<SearchResult>>,
    /// Results from the graph-search branch
    pub graph_results: Option<Vec<SearchResult>>,
}

impl AggregateSearchResult {
    /// All results in ranked order: vector results first, then graph
    /// results, each already sorted by score descending.
    pub fn ranked(&self) -> Vec<&SearchResult> {
        self.vector_results
            .iter()
            .flatten()
            .chain(self.graph_results.iter().flatten())
            .collect()
    }
}

/// A subject/predicate/object triple for the graph store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Triple {
    /// Subject entity
    pub subject: String,
    /// Relationship
    pub predicate: String,
    /// Object entity
    pub object: String,
    /// Provenance metadata
    pub metadata: Metadata,
}
