//! Answer generation pipe

use crate::config::PipeConfig;
use crate::core::traits::{GenerationOptions, LanguageModel, Message};
use crate::core::{RagStreamError, Result};
use crate::pipeline::pipe::{Pipe, PipeBase, PipeContext};
use crate::pipeline::rag::{CONTEXT_FIELD, QUERY_FIELD, STREAM_FIELD};
use crate::pipeline::types::{ItemStream, PipeInput, PipeItem};
use crate::state::SharedRunState;
use crate::telemetry::keys;
use async_trait::async_trait;
use futures::stream::{self, StreamExt, TryStreamExt};
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;

/// Invokes the language model with `{query, context}` input fields.
///
/// With `stream = true` the output is one [`PipeItem::Text`] per token
/// fragment; otherwise a single text item holding the whole answer.
/// Generation latency is logged through the telemetry queue.
pub struct GenerationPipe {
    base: Arc<PipeBase>,
    model: Arc<dyn LanguageModel>,
    options: GenerationOptions,
}

impl GenerationPipe {
    /// Creates the pipe over a language-model provider.
    pub fn new(
        config: PipeConfig,
        model: Arc<dyn LanguageModel>,
        options: GenerationOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            base: PipeBase::new(config),
            model,
            options,
        })
    }

    fn messages(query: &str, context: &str) -> Vec<Message> {
        vec![
            Message::system(format!(
                "Answer using only the provided context. Cite sources by their \
                 ordinal references.\n\nContext:\n{context}"
            )),
            Message::user(query),
        ]
    }
}

#[async_trait]
impl Pipe for GenerationPipe {
    fn base(&self) -> &Arc<PipeBase> {
        &self.base
    }

    async fn run_logic(
        &self,
        input: PipeInput,
        _state: Arc<SharedRunState>,
        ctx: PipeContext,
    ) -> Result<ItemStream> {
        let query = require_string(&input, QUERY_FIELD)?;
        let context = require_string(&input, CONTEXT_FIELD)?;
        let streaming = input
            .extras
            .get(STREAM_FIELD)
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false);

        let messages = Self::messages(&query, &context);
        let started = Instant::now();

        if streaming {
            let tokens = self.model.complete_stream(&messages, &self.options).await?;
            ctx.enqueue_log(
                keys::GENERATION_LATENCY_MS,
                json!(started.elapsed().as_millis() as u64),
            );
            Ok(tokens.map_ok(PipeItem::Text).boxed())
        } else {
            let completion = self.model.complete(&messages, &self.options).await?;
            ctx.enqueue_log(
                keys::GENERATION_LATENCY_MS,
                json!(started.elapsed().as_millis() as u64),
            );
            Ok(stream::iter(vec![Ok(PipeItem::Text(completion.text))]).boxed())
        }
    }
}

fn require_string(input: &PipeInput, key: &str) -> Result<String> {
    match input.require_extra(key)? {
        serde_json::Value::String(s) => Ok(s.clone()),
        other => Err(RagStreamError::config(format!(
            "input field `{key}` must be a string, got {other}"
        ))),
    }
}
