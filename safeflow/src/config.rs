//! Aggregated configuration.
//!
//! Every field has a default, so a partial document only overrides what it
//! names.

use crate::compensation::CompensationConfig;
use crate::resilience::{BreakerConfig, BreakerRegistry, CallGuard, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Breaker, retry and compensation settings in one place.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafeflowConfig {
    /// Default breaker settings.
    pub breaker: BreakerConfig,
    /// Default retry policy.
    pub retry: RetryPolicy,
    /// Compensation settings.
    pub compensation: CompensationConfig,
    /// Per-dependency breaker overrides.
    pub breakers: HashMap<String, BreakerConfig>,
    /// Per-dependency retry overrides.
    pub retries: HashMap<String, RetryPolicy>,
}

impl SafeflowConfig {
    /// Parses a JSON document.
    ///
    /// # Errors
    ///
    /// Returns the parse error if the document is malformed.
    pub fn from_json_str(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Returns the retry policy for `dependency`.
    #[must_use]
    pub fn retry_for(&self, dependency: &str) -> RetryPolicy {
        self.retries
            .get(dependency)
            .cloned()
            .unwrap_or_else(|| self.retry.clone())
    }

    /// Builds a breaker registry honoring the overrides.
    #[must_use]
    pub fn breaker_registry(&self) -> BreakerRegistry {
        self.breakers.iter().fold(
            BreakerRegistry::new(self.breaker.clone()),
            |registry, (name, config)| registry.with_override(name.clone(), config.clone()),
        )
    }

    /// Builds the guard for `dependency` from `registry`.
    #[must_use]
    pub fn guard(&self, registry: &BreakerRegistry, dependency: &str) -> CallGuard {
        CallGuard::new(registry.get_or_create(dependency), self.retry_for(dependency))
    }
}
