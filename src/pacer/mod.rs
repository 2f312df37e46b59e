pub mod composite;
pub mod exponential;
pub mod linear;

use std::sync::Arc;

use k8s_openapi::api::core::v1::Pod;

pub use composite::CompositePacer;

/// Break-down of a pacing group's current population.
#[derive(Clone, Debug, Default)]
pub struct GroupStanding {
    /// Pods whose Ready condition is True.
    pub ready: Vec<Pod>,
    /// Pods admitted but not yet Ready.
    pub starting: Vec<Pod>,
    /// Pods held back by the blocker.
    pub blocked: Vec<Pod>,
}

/// Decides which blocked pods in a group may advance.
///
/// Pacers own no mutable state; every decision is derived from the standing
/// passed in, so they are safe to share across concurrent callers.
pub trait Pacer: Send + Sync {
    /// Returns the subset of `standing.blocked` allowed to proceed.
    fn pace(&self, standing: &GroupStanding) -> Vec<Pod>;

    /// Stable identifier combining the pacer type and its grouping key.
    fn id(&self) -> String;
}

/// Produces a pacer for a grouping key.
pub trait PacerFactory: Send + Sync {
    fn new_pacer(&self, key: &str) -> Arc<dyn Pacer>;
}

/// Stable identity of a pod for intersection and self-lookup.
///
/// Pods at admission time may carry only a generateName and no UID yet, so
/// identity falls back from UID to namespace plus name or generateName.
pub fn pod_identity(pod: &Pod) -> String {
    if let Some(uid) = pod.metadata.uid.as_deref() {
        if !uid.is_empty() {
            return uid.to_string();
        }
    }
    let name = pod
        .metadata
        .name
        .as_deref()
        .filter(|n| !n.is_empty())
        .or(pod.metadata.generate_name.as_deref())
        .unwrap_or_default();
    format!(
        "{}/{}",
        pod.metadata.namespace.as_deref().unwrap_or_default(),
        name
    )
}

/// Sorts blocked pods into release order: creation timestamp ascending,
/// ties broken by namespaced name so decisions are deterministic.
pub(crate) fn sort_for_release(pods: &mut [Pod]) {
    pods.sort_by(|a, b| {
        let at = a.metadata.creation_timestamp.as_ref().map(|t| t.0);
        let bt = b.metadata.creation_timestamp.as_ref().map(|t| t.0);
        at.cmp(&bt).then_with(|| {
            let an = (
                a.metadata.namespace.as_deref().unwrap_or_default(),
                a.metadata.name.as_deref().unwrap_or_default(),
            );
            let bn = (
                b.metadata.namespace.as_deref().unwrap_or_default(),
                b.metadata.name.as_deref().unwrap_or_default(),
            );
            an.cmp(&bn)
        })
    });
}
