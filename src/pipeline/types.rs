//! Items and input records flowing between pipes
//!
//! Every pipe consumes and produces a lazily-produced, forward-only,
//! non-restartable stream of [`PipeItem`]s. The enum covers the data model
//! the built-in pipes exchange plus generic text/JSON payloads for custom
//! pipes; [`PipeItem::Many`] allows a pipe to emit a nested batch that the
//! drain loop flattens recursively.

use crate::core::{
    AggregateSearchResult, Document, Extraction, Fragment, Result, SearchResult, VectorEntry,
};
use futures::stream::{self, BoxStream, StreamExt};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// A lazily-produced stream of pipe items. Forward-only: once consumed it
/// cannot be iterated again (see materialize-then-replay in the pipeline).
pub type ItemStream = BoxStream<'static, Result<PipeItem>>;

/// One unit of data flowing between pipes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PipeItem {
    /// A raw source document
    Document(Document),
    /// A parsed extraction
    Extraction(Extraction),
    /// An embedding-sized fragment
    Fragment(Fragment),
    /// A stored embedding vector
    Vector(VectorEntry),
    /// One retrieval hit
    SearchResult(SearchResult),
    /// A joined vector/graph search result
    Aggregate(AggregateSearchResult),
    /// Plain text (queries, generated tokens, answers)
    Text(String),
    /// Arbitrary JSON for custom pipes
    Value(serde_json::Value),
    /// A nested batch; flattened recursively when drained
    Many(Vec<PipeItem>),
}

impl PipeItem {
    /// The text payload, when this item is text.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            PipeItem::Text(text) => Some(text),
            _ => None,
        }
    }

    /// The search result payload, when this item is one.
    pub fn as_search_result(&self) -> Option<&SearchResult> {
        match self {
            PipeItem::SearchResult(result) => Some(result),
            _ => None,
        }
    }
}

/// Recursively flattens `item` into `out`.
///
/// Depth contract: recursion depth equals the `Many` nesting depth of the
/// item; pipes are expected to nest batches, not to build towers of them.
pub fn flatten_into(item: PipeItem, out: &mut Vec<PipeItem>) {
    match item {
        PipeItem::Many(items) => {
            for nested in items {
                flatten_into(nested, out);
            }
        }
        leaf => out.push(leaf),
    }
}

/// Flattens a batch of items into leaves.
pub fn flatten(items: Vec<PipeItem>) -> Vec<PipeItem> {
    let mut out = Vec::new();
    for item in items {
        flatten_into(item, &mut out);
    }
    out
}

/// The input record handed to a pipe: the `message` stream plus named
/// fields resolved from upstream pipes' recorded state.
pub struct PipeInput {
    /// The live (or replayed) upstream stream
    pub message: ItemStream,
    /// Named fields injected by pipeline bindings
    pub extras: IndexMap<String, serde_json::Value>,
}

impl PipeInput {
    /// An input with no items and no extras.
    pub fn empty() -> Self {
        Self {
            message: stream::empty().boxed(),
            extras: IndexMap::new(),
        }
    }

    /// An input replaying an already-materialized batch.
    pub fn from_items(items: Vec<PipeItem>) -> Self {
        Self {
            message: stream::iter(items.into_iter().map(Ok)).boxed(),
            extras: IndexMap::new(),
        }
    }

    /// An input wrapping a live stream.
    pub fn from_stream(message: ItemStream) -> Self {
        Self {
            message,
            extras: IndexMap::new(),
        }
    }

    /// Adds a named extra field.
    pub fn with_extra(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.extras.insert(key.into(), value);
        self
    }

    /// A required extra field; missing fields are a configuration error.
    pub fn require_extra(&self, key: &str) -> Result<&serde_json::Value> {
        self.extras.get(key).ok_or_else(|| {
            crate::core::RagStreamError::config(format!("missing required input field `{key}`"))
        })
    }
}

impl std::fmt::Debug for PipeInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipeInput")
            .field("extras", &self.extras)
            .finish_non_exhaustive()
    }
}
