//! Deterministic mock collaborators
//!
//! In-memory implementations of the capability traits, used by the unit and
//! integration tests and handy for wiring up demo pipelines. All of them are
//! deterministic: the same input always produces the same output.

use crate::core::{
    Completion, Document, Embedder, Extraction, ExtractionId, GenerationOptions, GraphStore,
    LanguageModel, Message, Metadata, Parser, Result, SearchResult, Triple, VectorEntry,
    VectorStore,
};
use crate::core::traits::{ExtractionStream, TokenStream};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;

/// Splits a document into one extraction per non-empty line.
#[derive(Debug, Default)]
pub struct MockParser;

#[async_trait]
impl Parser for MockParser {
    async fn parse(&self, document: Document) -> Result<ExtractionStream> {
        let document_id = document.id.clone();
        let metadata = document.metadata.clone();
        let extractions: Vec<Result<Extraction>> = document
            .text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .enumerate()
            .map(|(ordinal, line)| {
                Ok(Extraction {
                    id: ExtractionId::new(format!("{}-{ordinal}", document_id)),
                    text: line.to_string(),
                    metadata: metadata.clone(),
                    document_id: document_id.clone(),
                })
            })
            .collect();
        Ok(stream::iter(extractions).boxed())
    }
}

/// Hash-based embedder: maps each text to a small deterministic vector.
#[derive(Debug)]
pub struct MockEmbedder {
    dimension: usize,
}

impl MockEmbedder {
    /// Creates a mock embedder of the given dimension.
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        // Character-rotation hash per lane; deterministic and cheap.
        let mut vector = vec![0.0f32; self.dimension];
        for (i, byte) in text.bytes().enumerate() {
            vector[i % self.dimension] += f32::from(byte) / 255.0;
        }
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

impl Default for MockEmbedder {
    fn default() -> Self {
        Self::new(16)
    }
}

#[async_trait]
impl Embedder for MockEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// In-memory vector store with brute-force cosine search.
#[derive(Debug, Default)]
pub struct MockVectorStore {
    entries: Mutex<Vec<VectorEntry>>,
}

impl MockVectorStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    fn cosine(a: &[f32], b: &[f32]) -> f32 {
        let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
        let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
        if na == 0.0 || nb == 0.0 {
            0.0
        } else {
            dot / (na * nb)
        }
    }
}

#[async_trait]
impl VectorStore for MockVectorStore {
    async fn upsert(&self, new_entries: Vec<VectorEntry>) -> Result<()> {
        let mut entries = self.entries.lock();
        for entry in new_entries {
            if let Some(existing) = entries.iter_mut().find(|e| e.id == entry.id) {
                *existing = entry;
            } else {
                entries.push(entry);
            }
        }
        Ok(())
    }

    async fn search(&self, query: &[f32], limit: usize) -> Result<Vec<SearchResult>> {
        let entries = self.entries.lock();
        let mut results: Vec<SearchResult> = entries
            .iter()
            .map(|entry| SearchResult {
                id: entry.id.clone(),
                score: Self::cosine(query, &entry.vector),
                metadata: entry.metadata.clone(),
            })
            .collect();
        // Stable sort preserves insertion order among equal scores.
        results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        results.truncate(limit);
        Ok(results)
    }
}

/// In-memory graph store: naive co-occurrence triples, substring matching.
#[derive(Debug, Default)]
pub struct MockGraphStore {
    triples: Mutex<Vec<Triple>>,
}

impl MockGraphStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored triples.
    pub fn triple_count(&self) -> usize {
        self.triples.lock().len()
    }
}

#[async_trait]
impl GraphStore for MockGraphStore {
    async fn ingest(&self, extraction: Extraction) -> Result<usize> {
        // One triple per word pair: (first, "mentions_with", next).
        let words: Vec<&str> = extraction.text.split_whitespace().collect();
        let mut metadata = extraction.metadata.clone();
        metadata.insert("extraction_id".to_string(), extraction.id.to_string().into());
        metadata.insert("text".to_string(), extraction.text.clone().into());
        let new_triples: Vec<Triple> = words
            .windows(2)
            .map(|pair| Triple {
                subject: pair[0].to_string(),
                predicate: "mentions_with".to_string(),
                object: pair[1].to_string(),
                metadata: metadata.clone(),
            })
            .collect();
        let stored = new_triples.len();
        self.triples.lock().extend(new_triples);
        Ok(stored)
    }

    async fn upsert_triples(&self, triples: Vec<Triple>) -> Result<()> {
        self.triples.lock().extend(triples);
        Ok(())
    }

    async fn structured_query(&self, query: &str) -> Result<Vec<SearchResult>> {
        let needle = query.to_lowercase();
        let triples = self.triples.lock();
        let results = triples
            .iter()
            .enumerate()
            .filter(|(_, t)| {
                t.subject.to_lowercase().contains(&needle)
                    || t.object.to_lowercase().contains(&needle)
            })
            .map(|(i, t)| SearchResult {
                id: format!("triple-{i}"),
                score: 1.0,
                metadata: {
                    let mut m = t.metadata.clone();
                    m.insert(
                        "title".to_string(),
                        format!("{} {} {}", t.subject, t.predicate, t.object).into(),
                    );
                    m
                },
            })
            .collect();
        Ok(results)
    }
}

/// Template language model that cites its context.
#[derive(Debug, Default)]
pub struct MockLanguageModel;

impl MockLanguageModel {
    fn render(messages: &[Message]) -> String {
        let prompt = messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        format!("Based on the provided context [1]: {prompt}")
    }
}

#[async_trait]
impl LanguageModel for MockLanguageModel {
    async fn complete(
        &self,
        messages: &[Message],
        _options: &GenerationOptions,
    ) -> Result<Completion> {
        Ok(Completion {
            text: Self::render(messages),
        })
    }

    async fn complete_stream(
        &self,
        messages: &[Message],
        _options: &GenerationOptions,
    ) -> Result<TokenStream> {
        let tokens: Vec<Result<String>> = Self::render(messages)
            .split_inclusive(' ')
            .map(|t| Ok(t.to_string()))
            .collect();
        Ok(stream::iter(tokens).boxed())
    }
}

/// Convenience helper used by tests: a metadata map with a `text` entry.
pub fn text_metadata(text: &str) -> Metadata {
    let mut metadata = Metadata::new();
    metadata.insert("text".to_string(), text.into());
    metadata
}
