//! Streaming RAG wire protocol
//!
//! A streamed RAG response is a flat concatenation of UTF-8 chunks
//! forming four framed sections in a fixed order: serialized search
//! results, the generated context text, a metadata object, and the raw
//! generation tokens. The markers are literal tag strings; the stream is
//! an ordered framing, not well-formed XML, so consumers must split on
//! the markers rather than parse markup.

use crate::core::{RagStreamError, Result, SearchResult};
use futures::stream::{self, BoxStream, StreamExt};

/// Opens the serialized search-result section.
pub const MARKER_SEARCH_OPEN: &str = "<search>";
/// Closes the search-result section.
pub const MARKER_SEARCH_CLOSE: &str = "</search>";
/// Opens the context-text section.
pub const MARKER_CONTEXT_OPEN: &str = "<context>";
/// Closes the context-text section.
pub const MARKER_CONTEXT_CLOSE: &str = "</context>";
/// Opens the metadata section.
pub const MARKER_METADATA_OPEN: &str = "<metadata>";
/// Closes the metadata section.
pub const MARKER_METADATA_CLOSE: &str = "</metadata>";
/// Opens the completion-token section.
pub const MARKER_COMPLETION_OPEN: &str = "<completion>";
/// Closes the completion-token section.
pub const MARKER_COMPLETION_CLOSE: &str = "</completion>";

/// Everything known before the first generation token: the ranked search
/// results, the context handed to the model, and response metadata.
#[derive(Debug, Clone)]
pub struct RagStreamPrelude {
    /// Ranked results cited by the context ordinals
    pub results: Vec<SearchResult>,
    /// The exact context text given to the generation stage
    pub context: String,
    /// Free-form response metadata, `{}` when there is none
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// Frames the prelude sections and chains the live token stream after
/// them, closing the completion section once the tokens end.
pub fn assemble_rag_stream(
    prelude: RagStreamPrelude,
    tokens: BoxStream<'static, Result<String>>,
) -> Result<BoxStream<'static, Result<String>>> {
    let results_json =
        serde_json::to_string(&prelude.results).map_err(RagStreamError::Json)?;
    let metadata_json =
        serde_json::to_string(&prelude.metadata).map_err(RagStreamError::Json)?;

    let head = [
        format!("{MARKER_SEARCH_OPEN}{results_json}{MARKER_SEARCH_CLOSE}"),
        format!("{MARKER_CONTEXT_OPEN}{}{MARKER_CONTEXT_CLOSE}", prelude.context),
        format!("{MARKER_METADATA_OPEN}{metadata_json}{MARKER_METADATA_CLOSE}"),
        MARKER_COMPLETION_OPEN.to_string(),
    ];
    let tail = [MARKER_COMPLETION_CLOSE.to_string()];

    Ok(stream::iter(head.into_iter().map(Ok))
        .chain(tokens)
        .chain(stream::iter(tail.into_iter().map(Ok)))
        .boxed())
}

/// The four sections of a fully assembled streamed response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RagStreamSections {
    /// Raw JSON array between the search markers
    pub search: String,
    /// Raw text between the context markers
    pub context: String,
    /// Raw JSON object between the metadata markers
    pub metadata: String,
    /// Concatenated tokens between the completion markers
    pub completion: String,
}

/// Splits a concatenated response into its four sections, verifying that
/// each appears exactly once and in protocol order.
pub fn split_rag_stream(full: &str) -> Result<RagStreamSections> {
    let mut rest = full;
    let mut take = |open: &str, close: &str| -> Result<String> {
        let after_open = rest.strip_prefix(open).ok_or_else(|| {
            RagStreamError::config(format!("stream does not continue with `{open}`"))
        })?;
        let end = after_open.find(close).ok_or_else(|| {
            RagStreamError::config(format!("stream is missing `{close}`"))
        })?;
        let body = &after_open[..end];
        rest = &after_open[end + close.len()..];
        Ok(body.to_string())
    };

    let search = take(MARKER_SEARCH_OPEN, MARKER_SEARCH_CLOSE)?;
    let context = take(MARKER_CONTEXT_OPEN, MARKER_CONTEXT_CLOSE)?;
    let metadata = take(MARKER_METADATA_OPEN, MARKER_METADATA_CLOSE)?;
    let completion = take(MARKER_COMPLETION_OPEN, MARKER_COMPLETION_CLOSE)?;
    if !rest.is_empty() {
        return Err(RagStreamError::config(format!(
            "trailing bytes after `{MARKER_COMPLETION_CLOSE}`"
        )));
    }

    Ok(RagStreamSections {
        search,
        context,
        metadata,
        completion,
    })
}
