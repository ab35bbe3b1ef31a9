//! Pipe configuration
//!
//! Every pipe carries an explicit, validated configuration record. Overrides
//! are merged through the pure [`apply_overrides`] function and validated
//! once, at construction - configuration problems surface immediately and
//! are never silently defaulted away.

use crate::core::{RagStreamError, Result};
use serde::{Deserialize, Serialize};

/// Default capacity of a pipe's telemetry queue.
pub const DEFAULT_LOG_QUEUE_CAPACITY: usize = 100;

/// Configuration record for one pipe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipeConfig {
    /// Pipe name; used as the shared-state group key and as the source
    /// name in pipeline bindings. Must be non-empty.
    pub name: String,
    /// Capacity of the bounded telemetry queue opened per run. When the
    /// queue is full, further events are dropped rather than blocking.
    #[serde(default = "default_log_queue_capacity")]
    pub log_queue_capacity: usize,
    /// Pipe-specific settings the engine passes through untouched.
    #[serde(default)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn default_log_queue_capacity() -> usize {
    DEFAULT_LOG_QUEUE_CAPACITY
}

impl PipeConfig {
    /// Creates a validated configuration with default queue capacity.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let config = Self {
            name: name.into(),
            log_queue_capacity: DEFAULT_LOG_QUEUE_CAPACITY,
            extra: serde_json::Map::new(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration, failing fast on problems.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(RagStreamError::config("pipe name must not be empty"));
        }
        if self.log_queue_capacity == 0 {
            return Err(RagStreamError::config(format!(
                "pipe `{}`: log queue capacity must be at least 1",
                self.name
            )));
        }
        Ok(())
    }

    /// Reads a typed value out of the `extra` map.
    pub fn extra_value<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.extra
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

/// Merges a JSON object of overrides into a base configuration.
///
/// Pure function: the base is untouched, the merged copy is re-validated
/// before being returned. `overrides` must be a JSON object; typed fields
/// (`name`, `log_queue_capacity`) are replaced when present, everything
/// else lands in `extra`.
pub fn apply_overrides(base: &PipeConfig, overrides: &serde_json::Value) -> Result<PipeConfig> {
    let serde_json::Value::Object(map) = overrides else {
        return Err(RagStreamError::config(format!(
            "overrides for pipe `{}` must be a JSON object",
            base.name
        )));
    };

    let mut merged = base.clone();
    for (key, value) in map {
        match key.as_str() {
            "name" => {
                merged.name = value
                    .as_str()
                    .ok_or_else(|| RagStreamError::config("`name` override must be a string"))?
                    .to_string();
            }
            "log_queue_capacity" => {
                merged.log_queue_capacity = value
                    .as_u64()
                    .ok_or_else(|| {
                        RagStreamError::config("`log_queue_capacity` override must be an integer")
                    })? as usize;
            }
            _ => {
                merged.extra.insert(key.clone(), value.clone());
            }
        }
    }
    merged.validate()?;
    Ok(merged)
}
