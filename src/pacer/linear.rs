use std::sync::Arc;

use k8s_openapi::api::core::v1::Pod;
use tracing::debug;

use super::{GroupStanding, Pacer, PacerFactory, sort_for_release};

#[derive(Clone, Copy, Debug)]
pub struct Config {
    /// Number of ready pods after which pacing is disabled.
    pub max_stagger: usize,
    /// Number of pods added at each step.
    pub step: usize,
}

/// Arithmetic pacer that unblocks pods in fixed steps: 5 => 10 => 15 => ...
pub struct LinearPacer {
    key: String,
    config: Config,
}

impl LinearPacer {
    pub fn new(key: impl Into<String>, config: Config) -> Self {
        Self {
            key: key.into(),
            config,
        }
    }
}

impl Pacer for LinearPacer {
    fn pace(&self, standing: &GroupStanding) -> Vec<Pod> {
        if standing.ready.len() >= self.config.max_stagger {
            debug!(
                pacer = %self.id(),
                "max stagger reached, admitting all blocked pods"
            );
            return standing.blocked.clone();
        }

        let remainder = standing.ready.len() % self.config.step;
        let allow = self.config.step - remainder;
        if allow <= standing.starting.len() {
            return Vec::new();
        }

        let mut candidates = standing.blocked.clone();
        sort_for_release(&mut candidates);
        candidates.truncate(allow);
        candidates
    }

    fn id(&self) -> String {
        format!("linear[{}]", self.key)
    }
}

pub struct LinearFactory {
    config: Config,
}

impl LinearFactory {
    pub fn new(config: Config) -> Self {
        Self { config }
    }
}

impl PacerFactory for LinearFactory {
    fn new_pacer(&self, key: &str) -> Arc<dyn Pacer> {
        Arc::new(LinearPacer::new(key, self.config))
    }
}
