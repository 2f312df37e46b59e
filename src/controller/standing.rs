use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams};
use kube::Client;
use thiserror::Error;
use tracing::debug;

use crate::blocker::PodBlocker;
use crate::pacer::GroupStanding;

#[derive(Debug, Error)]
pub enum StandingError {
    #[error("failed to list group pods: {0}")]
    List(#[from] kube::Error),
}

/// Supplies the Ready / Starting / Blocked break-down of a pacing group.
#[async_trait]
pub trait StandingSource: Send + Sync {
    async fn classify_group(
        &self,
        group_id: &str,
    ) -> Result<GroupStanding, StandingError>;
}

/// Partitions the live population of a group by listing every pod that
/// carries the group identifier label. Best-effort snapshot: nothing locks
/// the cluster while pacing decisions are made on the result.
pub struct GroupStandingQuery {
    client: Client,
    group_label: String,
    blocker: Arc<dyn PodBlocker>,
}

impl GroupStandingQuery {
    pub fn new(
        client: Client,
        group_label: impl Into<String>,
        blocker: Arc<dyn PodBlocker>,
    ) -> Self {
        Self {
            client,
            group_label: group_label.into(),
            blocker,
        }
    }
}

#[async_trait]
impl StandingSource for GroupStandingQuery {
    async fn classify_group(
        &self,
        group_id: &str,
    ) -> Result<GroupStanding, StandingError> {
        let api: Api<Pod> = Api::all(self.client.clone());
        let params = ListParams::default()
            .labels(&format!("{}={}", self.group_label, group_id));
        let pods = api.list(&params).await?;

        let mut standing = GroupStanding::default();
        for pod in pods {
            let blocked = pod
                .spec
                .as_ref()
                .map(|spec| self.blocker.is_blocked(spec))
                .unwrap_or(false);
            if blocked {
                standing.blocked.push(pod);
            } else if is_pod_ready(&pod) {
                standing.ready.push(pod);
            } else {
                standing.starting.push(pod);
            }
        }

        debug!(
            group_id,
            ready = standing.ready.len(),
            starting = standing.starting.len(),
            blocked = standing.blocked.len(),
            "group standing"
        );
        Ok(standing)
    }
}

pub fn is_pod_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false)
}
