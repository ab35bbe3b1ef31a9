//! Read-side analytics over stored log events
//!
//! A pure transform from raw [`LogEvent`]s to aggregate views: error-code
//! counts over time buckets, a pie-style error distribution, the full list
//! of retrieval relevance scores seen, and latency samples for graph
//! search and generation. Holds no state of its own - feed it whatever
//! window of events the sink returned.

use super::{keys, LogEvent};
use chrono::{DateTime, Duration, DurationRound, Utc};
use std::collections::HashMap;

/// Error-code count within one time bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorBucket {
    /// Start of the bucket (inclusive)
    pub bucket_start: DateTime<Utc>,
    /// Error code (the string payload of the error event)
    pub code: String,
    /// Occurrences within the bucket
    pub count: u64,
}

/// Aggregated analytics derived from a set of log events.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunAnalytics {
    /// Error counts per `(time bucket, code)`, oldest bucket first
    pub error_counts: Vec<ErrorBucket>,
    /// Total occurrences per error code across the whole window
    pub error_distribution: HashMap<String, u64>,
    /// Every retrieval relevance score seen, in event order
    pub relevance_scores: Vec<f32>,
    /// Graph-search latency samples in milliseconds, in event order
    pub graph_search_latencies_ms: Vec<f64>,
    /// Generation latency samples in milliseconds, in event order
    pub generation_latencies_ms: Vec<f64>,
}

/// Aggregates events with hourly error buckets.
pub fn analyze(events: &[LogEvent]) -> RunAnalytics {
    analyze_with_bucket(events, Duration::hours(1))
}

/// Aggregates events, bucketing error counts by `bucket`.
pub fn analyze_with_bucket(events: &[LogEvent], bucket: Duration) -> RunAnalytics {
    let mut analytics = RunAnalytics::default();
    let mut buckets: HashMap<(DateTime<Utc>, String), u64> = HashMap::new();

    for event in events {
        match event.key.as_str() {
            keys::ERROR => {
                let code = error_code(&event.value);
                *analytics.error_distribution.entry(code.clone()).or_default() += 1;
                let bucket_start = event
                    .timestamp
                    .duration_trunc(bucket)
                    .unwrap_or(event.timestamp);
                *buckets.entry((bucket_start, code)).or_default() += 1;
            }
            keys::RELEVANCE_SCORE => {
                if let Some(score) = event.value.as_f64() {
                    analytics.relevance_scores.push(score as f32);
                }
            }
            keys::SEARCH_RESULTS => {
                // Serialized result arrays also carry scores.
                if let Some(results) = event.value.as_array() {
                    for result in results {
                        if let Some(score) = result.get("score").and_then(|s| s.as_f64()) {
                            analytics.relevance_scores.push(score as f32);
                        }
                    }
                }
            }
            keys::GRAPH_SEARCH_LATENCY_MS => {
                if let Some(ms) = event.value.as_f64() {
                    analytics.graph_search_latencies_ms.push(ms);
                }
            }
            keys::GENERATION_LATENCY_MS => {
                if let Some(ms) = event.value.as_f64() {
                    analytics.generation_latencies_ms.push(ms);
                }
            }
            _ => {}
        }
    }

    let mut error_counts: Vec<ErrorBucket> = buckets
        .into_iter()
        .map(|((bucket_start, code), count)| ErrorBucket {
            bucket_start,
            code,
            count,
        })
        .collect();
    error_counts.sort_by(|a, b| {
        a.bucket_start
            .cmp(&b.bucket_start)
            .then_with(|| a.code.cmp(&b.code))
    });
    analytics.error_counts = error_counts;
    analytics
}

/// Error events may carry a bare string or an object with a `code` field.
fn error_code(value: &serde_json::Value) -> String {
    value
        .get("code")
        .and_then(|c| c.as_str())
        .or_else(|| value.as_str())
        .unwrap_or("unknown")
        .to_string()
}
