use std::sync::Arc;

use k8s_openapi::api::batch::v1::{
    Job, PodFailurePolicy, PodFailurePolicyOnPodConditionsPattern,
    PodFailurePolicyRule,
};
use k8s_openapi::api::core::v1::Pod;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::flight::FlightWaiter;
use super::standing::{StandingError, StandingSource};
use super::{DEFAULT_FLIGHT_WAIT, GROUP_ID_LABEL, PACED_LABEL, is_enabled};
use crate::blocker::PodBlocker;
use crate::classifier::{ClassifyError, GroupClassifier};
use crate::metrics::PacingMetrics;

const DISRUPTION_TARGET: &str = "DisruptionTarget";
const ACTION_IGNORE: &str = "Ignore";

#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("failed to classify pod: {0}")]
    Classify(#[from] ClassifyError),
    #[error("failed to classify pod group: {0}")]
    Standing(#[from] StandingError),
}

/// Synchronous admission decision for pods and jobs.
pub struct Admission {
    classifier: Arc<GroupClassifier>,
    standing: Arc<dyn StandingSource>,
    blocker: Arc<dyn PodBlocker>,
    flights: Arc<dyn FlightWaiter>,
    metrics: Arc<PacingMetrics>,
    enable_label: String,
    job_pod_label: String,
    bypass_failures: bool,
}

impl Admission {
    pub fn new(
        classifier: Arc<GroupClassifier>,
        standing: Arc<dyn StandingSource>,
        blocker: Arc<dyn PodBlocker>,
        flights: Arc<dyn FlightWaiter>,
        metrics: Arc<PacingMetrics>,
        enable_label: impl Into<String>,
        bypass_failures: bool,
    ) -> Self {
        Self {
            classifier,
            standing,
            blocker,
            flights,
            metrics,
            enable_label: enable_label.into(),
            job_pod_label: super::JOB_POD_LABEL.to_string(),
            bypass_failures,
        }
    }

    pub fn bypass_failures(&self) -> bool {
        self.bypass_failures
    }

    /// Decides whether an arriving pod may proceed, mutating it in place.
    /// The pod is always created; a negative decision only marks its spec
    /// unschedulable.
    pub async fn mutate_pod(
        &self,
        pod: &mut Pod,
    ) -> Result<(), AdmissionError> {
        if !is_enabled(&pod.metadata, &self.enable_label) {
            debug!("skipping not enabled pod");
            return Ok(());
        }

        // Job pods are blocked outright: pods are immutable once created,
        // so eviction-based release is the only safe path and the job
        // object itself is patched at its own admission.
        if pod
            .metadata
            .labels
            .as_ref()
            .map(|l| l.contains_key(&self.job_pod_label))
            .unwrap_or(false)
        {
            self.block_pod(pod);
            return Ok(());
        }

        let Some(group) = self.classifier.classify(pod)? else {
            info!("pod does not belong to any pacing group");
            return Ok(());
        };
        debug!(group_id = %group.id, pacer = %group.pacer.id(), "classified pod");

        let labels = pod.metadata.labels.get_or_insert_default();
        labels.insert(GROUP_ID_LABEL.to_string(), group.id.clone());
        labels.insert(PACED_LABEL.to_string(), "1".to_string());

        if let Err(err) =
            self.flights.wait_one(&group.id, DEFAULT_FLIGHT_WAIT).await
        {
            debug!(error = %err, "flight wait elapsed, proceeding");
        }

        let mut standing = self.standing.classify_group(&group.id).await?;
        // append the arriving pod and see whether it would be released
        standing.blocked.push(pod.clone());
        let released = group.pacer.pace(&standing);
        let allowed = released.iter().any(|candidate| is_same_pod(candidate, pod));

        self.metrics
            .record_decisions(&group.policy_names, allowed);
        if allowed {
            info!(group_id = %group.id, "pacer allows pod");
        } else {
            info!(group_id = %group.id, "pacer will not allow pod");
            self.block_pod(pod);
        }

        if let Err(err) = self.flights.track(&group.id, &pod.metadata) {
            warn!(error = %err, "failed to track pod flight");
        }
        Ok(())
    }

    /// Prepares a job for eviction-based pacing of its pods.
    ///
    /// The job controller counts deleted pods against backoffLimit, so the
    /// pod failure policy must ignore DisruptionTarget conditions before
    /// any of the job's pods can be released by eviction.
    pub async fn mutate_job(
        &self,
        job: &mut Job,
    ) -> Result<(), AdmissionError> {
        let template_meta = job
            .spec
            .as_ref()
            .and_then(|spec| spec.template.metadata.as_ref());
        let enabled = template_meta
            .map(|meta| is_enabled(meta, &self.enable_label))
            .unwrap_or(false);
        if !enabled {
            debug!("skipping not enabled job");
            return Ok(());
        }

        let existing = job
            .spec
            .as_ref()
            .and_then(|spec| spec.pod_failure_policy.as_ref())
            .and_then(disruption_rule_action);
        match existing {
            Some(action) if action != ACTION_IGNORE => {
                info!(
                    "job already defines a DisruptionTarget policy, bypassing"
                );
                Ok(())
            }
            Some(_) => Ok(()),
            None => {
                info!("patching job to ignore pod disruptions");
                let Some(spec) = job.spec.as_mut() else {
                    return Ok(());
                };
                let policy = spec
                    .pod_failure_policy
                    .get_or_insert_with(PodFailurePolicy::default);
                policy.rules.push(PodFailurePolicyRule {
                    action: ACTION_IGNORE.to_string(),
                    on_pod_conditions: Some(vec![
                        PodFailurePolicyOnPodConditionsPattern {
                            type_: DISRUPTION_TARGET.to_string(),
                            status: "True".to_string(),
                        },
                    ]),
                    ..PodFailurePolicyRule::default()
                });
                Ok(())
            }
        }
    }

    fn block_pod(&self, pod: &mut Pod) {
        debug!(
            name = pod.metadata.name.as_deref().unwrap_or_default(),
            namespace = pod.metadata.namespace.as_deref().unwrap_or_default(),
            "blocking pod"
        );
        let spec = pod.spec.get_or_insert_default();
        self.blocker.block(spec);
    }
}

/// Returns the action of the first rule matching DisruptionTarget=True.
fn disruption_rule_action(policy: &PodFailurePolicy) -> Option<String> {
    for rule in &policy.rules {
        let matches = rule
            .on_pod_conditions
            .as_ref()
            .map(|conditions| {
                conditions.iter().any(|c| {
                    c.type_ == DISRUPTION_TARGET && c.status == "True"
                })
            })
            .unwrap_or(false);
        if matches {
            return Some(rule.action.clone());
        }
    }
    None
}

fn is_same_pod(a: &Pod, b: &Pod) -> bool {
    a.metadata.name == b.metadata.name
        && a.metadata.namespace == b.metadata.namespace
        && a.metadata.generate_name == b.metadata.generate_name
}
