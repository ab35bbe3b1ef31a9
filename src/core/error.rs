//! Unified error handling for the pipeline engine
//!
//! One central error type covers every failure the engine can surface:
//! configuration errors, uninitialized-use errors, dependency-resolution
//! errors, provider errors and telemetry errors. Stage failures propagate
//! through the pipeline drain loop unchanged in type; the pipeline never
//! converts an error into a partial result.

use super::RunId;
use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, RagStreamError>;

/// Main error type for the pipeline engine.
#[derive(Debug, Error)]
pub enum RagStreamError {
    /// Missing or invalid pipe/pipeline configuration. Raised at
    /// construction time, never silently defaulted.
    #[error("configuration error: {message}")]
    Config {
        /// What is wrong with the configuration
        message: String,
    },

    /// A pipe operation was invoked before the run-entry path assigned
    /// a run identifier.
    #[error("pipe `{pipe}` used before a run was started")]
    UninitializedPipe {
        /// Name of the offending pipe
        pipe: String,
    },

    /// A shared-state group was never created. Distinguishes "never
    /// written" from "written but missing this field".
    #[error("shared-state group `{group}` was never written")]
    StateGroupNotFound {
        /// The group that does not exist
        group: String,
    },

    /// A delete targeted a field that does not exist in its group.
    #[error("shared-state field `{group}.{field}` does not exist")]
    StateFieldNotFound {
        /// Group the field was expected in
        group: String,
        /// The missing field
        field: String,
    },

    /// A declared binding references a field no upstream pipe wrote.
    #[error("dependency resolution failed: `{group}.{field}` was never written by an upstream pipe")]
    DependencyResolution {
        /// Source pipe name the binding referenced
        group: String,
        /// Field the binding expected
        field: String,
    },

    /// An external collaborator (parser, embedder, vector store, graph
    /// store, language model) failed.
    #[error("{provider} provider error: {message}")]
    Provider {
        /// Which collaborator failed
        provider: String,
        /// The collaborator's error message
        message: String,
    },

    /// Answer generation failed.
    #[error("generation error: {message}")]
    Generation {
        /// Error message
        message: String,
    },

    /// A telemetry backend operation failed. Telemetry is best-effort;
    /// callers log these locally and never abort a run because of them.
    #[error("telemetry error: {message}")]
    Telemetry {
        /// Error message
        message: String,
    },

    /// A second run-info record was appended for a run id that already
    /// has one. Exactly one pipeline-type value is allowed per run.
    #[error("run info already recorded for run {run_id}")]
    DuplicateRunInfo {
        /// The run id that already has a record
        run_id: RunId,
    },

    /// The run's cancellation token fired while the pipeline was active.
    #[error("run {run_id} was cancelled")]
    Cancelled {
        /// The cancelled run
        run_id: RunId,
    },

    /// A background task (fan-out duplicator or branch runner) panicked
    /// or was aborted.
    #[error("background task failed: {message}")]
    Task {
        /// Join error description
        message: String,
    },

    /// I/O errors from the file-backed telemetry sink.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RagStreamError {
    /// Shorthand for a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Shorthand for a provider error.
    pub fn provider(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Provider {
            provider: provider.into(),
            message: message.into(),
        }
    }
}
