//! Per-dispatch request context and feature switches.
//!
//! Every top-level operation constructs a fresh context and hands it down
//! the handler chain. Middleware and handlers may read the policy registry,
//! consult feature switches, and stash values in the bag for steps further
//! down the chain. The context lives for exactly one dispatch.

use std::collections::HashMap;
use std::sync::Arc;

use crate::registry::PolicyRegistry;

/// Evaluation result for a feature switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureStatus {
    /// Switch is explicitly enabled.
    On,
    /// Switch is explicitly disabled; gated middleware no-ops.
    Off,
    /// Switch is unknown to the registry; treated as enabled.
    Unset,
}

/// Source of feature switch states.
pub trait FeatureSwitches: Send + Sync {
    /// Status of the named switch.
    fn status(&self, key: &str) -> FeatureStatus;
}

/// Fixed-map feature switches for embedded use and tests.
#[derive(Debug, Default)]
pub struct StaticFeatureSwitches {
    switches: HashMap<String, bool>,
}

impl StaticFeatureSwitches {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a switch state.
    pub fn set(mut self, key: impl Into<String>, enabled: bool) -> Self {
        self.switches.insert(key.into(), enabled);
        self
    }
}

impl FeatureSwitches for StaticFeatureSwitches {
    fn status(&self, key: &str) -> FeatureStatus {
        match self.switches.get(key) {
            Some(true) => FeatureStatus::On,
            Some(false) => FeatureStatus::Off,
            None => FeatureStatus::Unset,
        }
    }
}

/// Propagation bag for one dispatch.
///
/// Single-writer: only the dispatch that created the context mutates it.
pub struct RequestContext {
    /// Named resilience policies available to middleware.
    pub policies: Arc<PolicyRegistry>,
    /// Feature switch registry, if configured.
    pub feature_switches: Option<Arc<dyn FeatureSwitches>>,
    /// Free-form values shared along the chain.
    pub bag: HashMap<String, serde_json::Value>,
}

impl RequestContext {
    /// Create a context carrying the given policy registry.
    pub fn new(policies: Arc<PolicyRegistry>) -> Self {
        Self {
            policies,
            feature_switches: None,
            bag: HashMap::new(),
        }
    }

    /// Attach a feature switch registry.
    pub fn with_feature_switches(mut self, switches: Arc<dyn FeatureSwitches>) -> Self {
        self.feature_switches = Some(switches);
        self
    }

    /// Evaluate a feature switch; `Unset` when no registry is attached.
    pub fn feature_status(&self, key: &str) -> FeatureStatus {
        self.feature_switches
            .as_ref()
            .map(|s| s.status(key))
            .unwrap_or(FeatureStatus::Unset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_switches() {
        let switches = StaticFeatureSwitches::new()
            .set("retries", true)
            .set("audit", false);

        assert_eq!(switches.status("retries"), FeatureStatus::On);
        assert_eq!(switches.status("audit"), FeatureStatus::Off);
        assert_eq!(switches.status("unknown"), FeatureStatus::Unset);
    }

    #[test]
    fn test_context_without_registry_is_unset() {
        let ctx = RequestContext::new(Arc::new(PolicyRegistry::with_defaults()));
        assert_eq!(ctx.feature_status("anything"), FeatureStatus::Unset);
    }

    #[test]
    fn test_context_bag_round_trip() {
        let mut ctx = RequestContext::new(Arc::new(PolicyRegistry::with_defaults()));
        ctx.bag
            .insert("attempt".to_string(), serde_json::json!(3));
        assert_eq!(ctx.bag["attempt"], serde_json::json!(3));
    }
}
