use std::sync::Arc;

use k8s_openapi::api::core::v1::Pod;
use tracing::debug;

use super::{GroupStanding, Pacer, PacerFactory, sort_for_release};

#[derive(Clone, Copy, Debug)]
pub struct Config {
    /// Minimum number of pods to initially allow.
    pub min_initial: usize,
    /// Number of ready pods after which pacing is disabled.
    pub max_stagger: usize,
    /// Exponential growth multiplier between wave targets.
    pub multiplier: f64,
}

/// Releases pods in waves whose targets follow
/// `min_initial * multiplier^e`. Pods already admitted but not yet ready
/// count toward the current wave, preventing over-admission within it.
pub struct ExponentialPacer {
    key: String,
    config: Config,
}

impl ExponentialPacer {
    pub fn new(key: impl Into<String>, config: Config) -> Self {
        Self {
            key: key.into(),
            config,
        }
    }
}

impl Pacer for ExponentialPacer {
    fn pace(&self, standing: &GroupStanding) -> Vec<Pod> {
        if standing.ready.len() >= self.config.max_stagger {
            debug!(
                pacer = %self.id(),
                "max stagger reached, admitting all blocked pods"
            );
            return standing.blocked.clone();
        }

        let ready = standing.ready.len();
        let starting = standing.starting.len();
        let blocked = standing.blocked.len();
        let allowed = allowed_count(
            ready,
            starting,
            blocked,
            self.config.min_initial,
            self.config.multiplier,
        );

        let mut candidates = standing.blocked.clone();
        sort_for_release(&mut candidates);
        candidates.truncate(allowed);

        debug!(
            pacer = %self.id(),
            ready,
            starting,
            blocked,
            admitted = candidates.len(),
            "pacing decision"
        );
        candidates
    }

    fn id(&self) -> String {
        format!("exponential[{}]", self.key)
    }
}

/// Finds the next wave target past the ready count and returns how many
/// blocked pods still fit in it.
fn allowed_count(
    ready: usize,
    starting: usize,
    blocked: usize,
    min_initial: usize,
    multiplier: f64,
) -> usize {
    let mut exponent = 0u32;
    let mut next_target =
        (min_initial as f64 * multiplier.powi(exponent as i32)) as usize;
    while next_target <= ready {
        exponent += 1;
        next_target =
            (min_initial as f64 * multiplier.powi(exponent as i32)) as usize;
    }

    next_target
        .saturating_sub(ready + starting)
        .min(blocked)
}

pub struct ExponentialFactory {
    name: String,
    config: Config,
}

impl ExponentialFactory {
    pub fn new(name: impl Into<String>, config: Config) -> Self {
        Self {
            name: name.into(),
            config,
        }
    }

    pub fn policy_name(&self) -> &str {
        &self.name
    }
}

impl PacerFactory for ExponentialFactory {
    fn new_pacer(&self, key: &str) -> Arc<dyn Pacer> {
        Arc::new(ExponentialPacer::new(key, self.config))
    }
}
