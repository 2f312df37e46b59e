use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::PodSpec;

use super::{BlockError, PodBlocker};

pub const DEFAULT_NODE_SELECTOR_KEY: &str = "pacekeeper.io/do-not-schedule";

/// Blocks a pod by adding a reserved key to its node selector, making it
/// unschedulable while keeping identity, creation timestamp and owner
/// references intact. This is the strategy the pacing path uses: the
/// controller releases blocked pods by eviction and lets the owning
/// workload re-create them.
pub struct NodeSelectorBlocker {
    key: String,
    value: String,
}

impl NodeSelectorBlocker {
    pub fn new() -> Self {
        Self {
            key: DEFAULT_NODE_SELECTOR_KEY.to_string(),
            value: String::new(),
        }
    }
}

impl Default for NodeSelectorBlocker {
    fn default() -> Self {
        Self::new()
    }
}

impl PodBlocker for NodeSelectorBlocker {
    fn block(&self, spec: &mut PodSpec) {
        spec.node_selector
            .get_or_insert_with(BTreeMap::new)
            .insert(self.key.clone(), self.value.clone());
    }

    fn unblock(&self, spec: &mut PodSpec) -> Result<(), BlockError> {
        if let Some(selector) = spec.node_selector.as_mut() {
            selector.remove(&self.key);
        }
        Ok(())
    }

    fn is_blocked(&self, spec: &PodSpec) -> bool {
        spec.node_selector
            .as_ref()
            .map(|s| s.contains_key(&self.key))
            .unwrap_or(false)
    }
}
