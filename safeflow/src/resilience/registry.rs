//! Shared breakers keyed by dependency name.

use super::breaker::{BreakerConfig, BreakerSnapshot, CircuitBreaker};
use crate::events::{noop_sink, EventSink};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;

/// Hands out one [`CircuitBreaker`] per dependency, shared by every caller.
///
/// Workers processing different documents concurrently must observe the same
/// breaker for "inference" or the failure streak would be split across them.
pub struct BreakerRegistry {
    defaults: BreakerConfig,
    overrides: HashMap<String, BreakerConfig>,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    event_sink: Arc<dyn EventSink>,
}

impl BreakerRegistry {
    /// Creates a registry whose breakers use `defaults`.
    #[must_use]
    pub fn new(defaults: BreakerConfig) -> Self {
        Self {
            defaults,
            overrides: HashMap::new(),
            breakers: DashMap::new(),
            event_sink: noop_sink(),
        }
    }

    /// Uses a specific config for one dependency.
    #[must_use]
    pub fn with_override(mut self, name: impl Into<String>, config: BreakerConfig) -> Self {
        self.overrides.insert(name.into(), config);
        self
    }

    /// Sets the event sink handed to every breaker created afterwards.
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    /// Returns the breaker for `name`, creating it on first use.
    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(name) {
            return existing.clone();
        }
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                let config = self
                    .overrides
                    .get(name)
                    .cloned()
                    .unwrap_or_else(|| self.defaults.clone());
                Arc::new(CircuitBreaker::new(name, config).with_event_sink(self.event_sink.clone()))
            })
            .clone()
    }

    /// Returns the breaker for `name` if one has been created.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(name).map(|b| b.clone())
    }

    /// Snapshots every breaker, keyed by dependency name.
    #[must_use]
    pub fn snapshot_all(&self) -> HashMap<String, BreakerSnapshot> {
        self.breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().snapshot()))
            .collect()
    }

    /// Forces every breaker back to Closed.
    pub fn reset_all(&self) {
        for entry in &self.breakers {
            entry.value().reset();
        }
    }

    /// Returns the number of breakers created so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    /// Returns true if no breaker has been created.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}

impl std::fmt::Debug for BreakerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BreakerRegistry")
            .field("defaults", &self.defaults)
            .field("breakers", &self.len())
            .finish()
    }
}
