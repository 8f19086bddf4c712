//! Event sink system for observability.
//!
//! Sinks are injected into breakers, transactions and executors rather than
//! installed globally, so tests can give every component its own sink.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

use std::sync::Arc;

/// Returns the sink used when none is configured.
#[must_use]
pub fn noop_sink() -> Arc<dyn EventSink> {
    Arc::new(NoOpEventSink)
}

/// Adds an RFC 3339 `timestamp` field to an event payload object.
#[must_use]
pub fn stamped(mut payload: serde_json::Value) -> serde_json::Value {
    if let Some(map) = payload.as_object_mut() {
        map.insert(
            "timestamp".to_string(),
            serde_json::json!(chrono::Utc::now().to_rfc3339()),
        );
    }
    payload
}
