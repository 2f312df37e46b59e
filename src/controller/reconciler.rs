use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DeleteParams, EvictParams};
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use super::standing::{StandingError, StandingSource};
use super::{GROUP_ID_LABEL, is_enabled};
use crate::classifier::GroupClassifier;
use crate::metrics::PacingMetrics;
use crate::pacer::GroupStanding;

#[derive(Debug, Error)]
pub enum ReconcileErr {
    /// The group cache was evicted while a blocked pod outlived it; the
    /// framework retries so the group can be re-derived.
    #[error("pacing group not found: {0}")]
    GroupNotFound(String),
    #[error("failed to classify pod group: {0}")]
    Standing(#[from] StandingError),
}

#[derive(Clone)]
pub struct ReconcilerContext {
    pub client: Client,
    pub classifier: Arc<GroupClassifier>,
    pub standing: Arc<dyn StandingSource>,
    pub metrics: Arc<PacingMetrics>,
    pub enable_label: String,
    pub resync: Duration,
}

/// Responds to pod changes: re-runs the group's pacer and releases the
/// next wave by evicting blocked pods. The owning workload re-creates
/// evicted pods, which then pass through admission again.
#[instrument(skip_all, fields(ns = %pod.namespace().unwrap_or_default(), name = %pod.name_any()))]
pub async fn reconcile(
    pod: Arc<Pod>,
    ctx: Arc<ReconcilerContext>,
) -> Result<Action, ReconcileErr> {
    if !is_enabled(&pod.metadata, &ctx.enable_label) {
        return Ok(Action::await_change());
    }
    let Some(group_id) = pod
        .metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(GROUP_ID_LABEL))
        .filter(|id| !id.is_empty())
    else {
        debug!("pod does not carry a group ID label");
        return Ok(Action::await_change());
    };

    let Some(group) = ctx.classifier.classify_by_group_id(group_id) else {
        return Err(ReconcileErr::GroupNotFound(group_id.clone()));
    };
    debug!(group_id = %group.id, pacer = %group.pacer.id(), "pacing group");

    let standing = ctx.standing.classify_group(&group.id).await?;
    debug!(
        ready = standing.ready.len(),
        starting = standing.starting.len(),
        blocked = standing.blocked.len(),
        "group break down"
    );

    let released = group.pacer.pace(&standing);
    for unblocked in &released {
        info!(
            name = unblocked.name_any(),
            namespace = unblocked.namespace().unwrap_or_default(),
            "evicting pod to unblock"
        );
        if let Err(err) = evict_pod(&ctx.client, unblocked).await {
            warn!(error = %err, "failed to evict pod");
            continue;
        }
        ctx.metrics.record_eviction(&group.id);
    }

    let self_released = released.iter().any(|p| same_namespaced_name(p, &pod));
    let decision = next_step(
        self_released,
        blocked_age(&pod, &standing),
        group.max_blocked,
        ctx.resync,
    );
    match decision {
        NextStep::Done => Ok(Action::await_change()),
        NextStep::EvictNow => {
            info!(
                group_id = %group.id,
                "pod exceeded max blocked duration, evicting"
            );
            if let Err(err) = evict_pod(&ctx.client, &pod).await {
                warn!(error = %err, "failed to evict overdue pod");
            } else {
                ctx.metrics.record_eviction(&group.id);
            }
            Ok(Action::await_change())
        }
        NextStep::RequeueAfter(delay) => Ok(Action::requeue(delay)),
    }
}

pub fn error_policy(
    _pod: Arc<Pod>,
    error: &ReconcileErr,
    _ctx: Arc<ReconcilerContext>,
) -> Action {
    warn!(error = %error, "reconcile error");
    Action::requeue(Duration::from_secs(10))
}

#[derive(Debug, PartialEq, Eq)]
enum NextStep {
    Done,
    EvictNow,
    RequeueAfter(Duration),
}

/// Age of the pod if it is currently part of the blocked set.
fn blocked_age(pod: &Pod, standing: &GroupStanding) -> Option<Duration> {
    let in_blocked = standing
        .blocked
        .iter()
        .any(|p| same_namespaced_name(p, pod));
    if !in_blocked {
        return None;
    }
    let created = pod.metadata.creation_timestamp.as_ref()?;
    (chrono::Utc::now() - created.0).to_std().ok()
}

/// Decides how the reconcile pass ends: released pods are done, overdue
/// blocked pods are force-evicted, everything else is re-examined after
/// `min(resync, time left until the max blocked duration expires)`.
fn next_step(
    self_released: bool,
    blocked_age: Option<Duration>,
    max_blocked: Option<Duration>,
    resync: Duration,
) -> NextStep {
    if self_released {
        return NextStep::Done;
    }
    match (blocked_age, max_blocked) {
        (Some(age), Some(max)) if age >= max => NextStep::EvictNow,
        (Some(age), Some(max)) => {
            NextStep::RequeueAfter(resync.min(max - age))
        }
        _ => NextStep::RequeueAfter(resync),
    }
}

fn same_namespaced_name(a: &Pod, b: &Pod) -> bool {
    a.metadata.name == b.metadata.name
        && a.metadata.namespace == b.metadata.namespace
}

async fn evict_pod(client: &Client, pod: &Pod) -> kube::Result<()> {
    let Some(name) = pod.metadata.name.as_deref() else {
        return Ok(());
    };
    let namespace = pod.metadata.namespace.as_deref().unwrap_or("default");
    let api: Api<Pod> = Api::namespaced(client.clone(), namespace);
    let params = EvictParams {
        delete_options: Some(DeleteParams {
            grace_period_seconds: Some(0),
            ..DeleteParams::default()
        }),
        ..EvictParams::default()
    };
    api.evict(name, &params).await.map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    const RESYNC: Duration = Duration::from_secs(300);

    #[test]
    fn released_pod_is_done() {
        let step = next_step(
            true,
            Some(Duration::from_secs(10)),
            Some(Duration::from_secs(5)),
            RESYNC,
        );
        assert_eq!(step, NextStep::Done);
    }

    #[test]
    fn overdue_blocked_pod_is_evicted() {
        let step = next_step(
            false,
            Some(Duration::from_secs(600)),
            Some(Duration::from_secs(300)),
            RESYNC,
        );
        assert_eq!(step, NextStep::EvictNow);
    }

    #[test]
    fn requeue_is_capped_by_time_to_expiry() {
        let step = next_step(
            false,
            Some(Duration::from_secs(250)),
            Some(Duration::from_secs(300)),
            RESYNC,
        );
        assert_eq!(
            step,
            NextStep::RequeueAfter(Duration::from_secs(50))
        );
    }

    #[test]
    fn requeue_defaults_to_resync() {
        assert_eq!(
            next_step(false, None, None, RESYNC),
            NextStep::RequeueAfter(RESYNC)
        );
        assert_eq!(
            next_step(false, Some(Duration::from_secs(10)), None, RESYNC),
            NextStep::RequeueAfter(RESYNC)
        );
        // not blocked, so the max blocked policy does not apply
        assert_eq!(
            next_step(false, None, Some(Duration::from_secs(1)), RESYNC),
            NextStep::RequeueAfter(RESYNC)
        );
    }

    #[test]
    fn blocked_age_requires_membership() {
        let mut pod = Pod::default();
        pod.metadata.name = Some("pod-1".to_string());
        pod.metadata.namespace = Some("ns".to_string());
        pod.metadata.creation_timestamp = Some(
            k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(
                chrono::Utc::now() - chrono::Duration::minutes(10),
            ),
        );

        let empty = GroupStanding::default();
        assert!(blocked_age(&pod, &empty).is_none());

        let standing = GroupStanding {
            ready: vec![],
            starting: vec![],
            blocked: vec![pod.clone()],
        };
        let age = blocked_age(&pod, &standing).unwrap();
        assert!(age >= Duration::from_secs(9 * 60));
    }
}
