//! Shared run state
//!
//! A concurrency-safe nested key/value store scoped to one pipeline
//! execution. Pipes publish named outputs here under their own name as the
//! group key; downstream pipes resolve declared bindings by reading them
//! back. The instance is dropped when the run completes, so nothing leaks
//! across runs.
//!
//! All operations serialize through a single coarse lock. Contention is low
//! (a handful of writes per pipe per run) and correctness matters more than
//! throughput here, so there is deliberately no per-group locking.

use crate::core::{RagStreamError, Result};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;

type Group = HashMap<String, Value>;

/// Per-run shared key/value store, keyed `(group, field) -> value`.
#[derive(Debug, Default)]
pub struct SharedRunState {
    groups: Mutex<HashMap<String, Group>>,
}

impl SharedRunState {
    /// Creates an empty state instance.
    pub fn new() -> Self {
        Self::default()
    }

    /// Merges `fields` into the named group, creating the group if absent.
    /// Later writes to the same field overwrite earlier ones.
    pub fn update(&self, group: &str, fields: HashMap<String, Value>) -> Result<()> {
        let mut groups = self.groups.lock();
        groups.entry(group.to_string()).or_default().extend(fields);
        Ok(())
    }

    /// Returns the stored value, or `default` when the group exists but the
    /// field does not. A group that was never written is an error - that
    /// distinguishes "never written" from "written but empty".
    pub fn get(&self, group: &str, field: &str, default: Option<Value>) -> Result<Value> {
        let groups = self.groups.lock();
        let entries = groups
            .get(group)
            .ok_or_else(|| RagStreamError::StateGroupNotFound {
                group: group.to_string(),
            })?;
        match entries.get(field) {
            Some(value) => Ok(value.clone()),
            None => Ok(default.unwrap_or(Value::Null)),
        }
    }

    /// Returns the stored value, or `None` when the group exists but the
    /// field was never written. Unlike [`SharedRunState::get`], a stored
    /// JSON `null` comes back as `Some(Value::Null)` rather than blending
    /// into the missing-field case. A group that was never written is
    /// still an error.
    pub fn try_get(&self, group: &str, field: &str) -> Result<Option<Value>> {
        let groups = self.groups.lock();
        let entries = groups
            .get(group)
            .ok_or_else(|| RagStreamError::StateGroupNotFound {
                group: group.to_string(),
            })?;
        Ok(entries.get(field).cloned())
    }

    /// Removes one field, or the entire group when `field` is `None`.
    /// Fails when the named group or field does not exist.
    pub fn delete(&self, group: &str, field: Option<&str>) -> Result<()> {
        let mut groups = self.groups.lock();
        match field {
            None => {
                groups
                    .remove(group)
                    .ok_or_else(|| RagStreamError::StateGroupNotFound {
                        group: group.to_string(),
                    })?;
                Ok(())
            }
            Some(field) => {
                let entries =
                    groups
                        .get_mut(group)
                        .ok_or_else(|| RagStreamError::StateGroupNotFound {
                            group: group.to_string(),
                        })?;
                entries
                    .remove(field)
                    .ok_or_else(|| RagStreamError::StateFieldNotFound {
                        group: group.to_string(),
                        field: field.to_string(),
                    })?;
                Ok(())
            }
        }
    }

    /// Whether the named group has been created.
    pub fn contains_group(&self, group: &str) -> bool {
        self.groups.lock().contains_key(group)
    }

    /// Names of every group written so far.
    pub fn group_names(&self) -> Vec<String> {
        self.groups.lock().keys().cloned().collect()
    }
}

/// Builds a one-entry field map, the common case for pipe outputs.
pub fn field(name: impl Into<String>, value: impl Into<Value>) -> HashMap<String, Value> {
    HashMap::from([(name.into(), value.into())])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_update_then_get_returns_exact_value() {
        let state = SharedRunState::new();
        state.update("parser", field("count", 3)).unwrap();
        assert_eq!(state.get("parser", "count", None).unwrap(), json!(3));
    }

    #[test]
    fn test_get_unwritten_field_returns_default() {
        let state = SharedRunState::new();
        state.update("parser", HashMap::new()).unwrap();
        assert_eq!(
            state.get("parser", "missing", Some(json!("fallback"))).unwrap(),
            json!("fallback")
        );
        assert_eq!(state.get("parser", "missing", None).unwrap(), Value::Null);
    }

    #[test]
    fn test_get_unwritten_group_is_an_error() {
        let state = SharedRunState::new();
        let err = state.get("never", "field", Some(json!(1))).unwrap_err();
        assert!(matches!(
            err,
            RagStreamError::StateGroupNotFound { group } if group == "never"
        ));
    }

    #[test]
    fn test_try_get_keeps_stored_null_apart_from_missing() {
        let state = SharedRunState::new();
        state.update("pipe", field("flag", Value::Null)).unwrap();
        assert_eq!(state.try_get("pipe", "flag").unwrap(), Some(Value::Null));
        assert_eq!(state.try_get("pipe", "missing").unwrap(), None);
        assert!(matches!(
            state.try_get("never", "flag").unwrap_err(),
            RagStreamError::StateGroupNotFound { .. }
        ));
    }

    #[test]
    fn test_overwrite_replaces_value() {
        let state = SharedRunState::new();
        state.update("pipe", field("x", 1)).unwrap();
        state.update("pipe", field("x", 2)).unwrap();
        assert_eq!(state.get("pipe", "x", None).unwrap(), json!(2));
    }

    #[test]
    fn test_delete_field_and_group() {
        let state = SharedRunState::new();
        state.update("pipe", field("x", 1)).unwrap();
        state.delete("pipe", Some("x")).unwrap();
        assert!(matches!(
            state.delete("pipe", Some("x")).unwrap_err(),
            RagStreamError::StateFieldNotFound { .. }
        ));
        state.delete("pipe", None).unwrap();
        assert!(!state.contains_group("pipe"));
        assert!(state.delete("pipe", None).is_err());
    }

    #[test]
    fn test_concurrent_writers_all_land() {
        let state = std::sync::Arc::new(SharedRunState::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let state = state.clone();
                std::thread::spawn(move || {
                    state.update("shared", field(format!("k{i}"), i)).unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        for i in 0..8 {
            assert_eq!(
                state.get("shared", &format!("k{i}"), None).unwrap(),
                json!(i)
            );
        }
    }
}
