pub mod admission;
pub mod flight;
pub mod reconciler;
pub mod standing;

use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::Api;
use kube::runtime::{Controller, WatchStreamExt, watcher};
use kube::Client;
use tracing::{debug, info, warn};

use crate::classifier::GroupClassifier;
use crate::metrics::PacingMetrics;
use flight::FlightTracker;
use reconciler::ReconcilerContext;
use standing::StandingSource;

pub const DEFAULT_ENABLE_LABEL: &str = "pacekeeper.io/enable";
pub const GROUP_ID_LABEL: &str = "pacekeeper.io/group";
pub const PACED_LABEL: &str = "pacekeeper.io/paced";
pub const JOB_POD_LABEL: &str = "pacekeeper.io/job-pod";
pub const DEFAULT_FLIGHT_WAIT: Duration = Duration::from_millis(500);

/// A pod is subject to pacing only when the enable label equals "1".
pub fn is_enabled(meta: &ObjectMeta, enable_label: &str) -> bool {
    match meta
        .labels
        .as_ref()
        .and_then(|labels| labels.get(enable_label))
    {
        Some(value) if value == "1" => true,
        Some(value) => {
            debug!(enable_label, value, "enable label has unexpected value");
            false
        }
        None => false,
    }
}

/// Runs the pacing reconciler and the flight observer until one of them
/// terminates. Both watch streams are scoped to pods carrying the enable
/// label.
pub async fn run_controllers(
    client: Client,
    classifier: Arc<GroupClassifier>,
    standing: Arc<dyn StandingSource>,
    tracker: Arc<FlightTracker>,
    metrics: Arc<PacingMetrics>,
    enable_label: String,
    resync: Duration,
) -> anyhow::Result<()> {
    let api: Api<Pod> = Api::all(client.clone());
    let watch_config = watcher::Config::default().labels(&enable_label);

    let ctx = Arc::new(ReconcilerContext {
        client,
        classifier,
        standing,
        metrics,
        enable_label,
        resync,
    });

    info!("starting pacing reconciler");
    let reconciler = Controller::new(api.clone(), watch_config.clone())
        .shutdown_on_signal()
        .run(reconciler::reconcile, reconciler::error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((_ref, action)) => {
                    debug!(?action, "reconciled")
                }
                Err(err) => warn!(error = %err, "reconcile failed"),
            }
        });

    info!("starting flight observer");
    let observer = run_flight_observer(api, watch_config, tracker);

    tokio::select! {
        _ = reconciler => Ok(()),
        result = observer => result,
    }
}

/// Feeds watch events to the flight tracker so admitted pods land and
/// deleted pods are forgotten.
async fn run_flight_observer(
    api: Api<Pod>,
    config: watcher::Config,
    tracker: Arc<FlightTracker>,
) -> anyhow::Result<()> {
    let mut stream = pin!(watcher(api, config).default_backoff());
    while let Some(event) = stream.try_next().await? {
        match event {
            watcher::Event::Apply(pod)
            | watcher::Event::InitApply(pod) => tracker.observe(&pod),
            watcher::Event::Delete(pod) => tracker.forget(&pod),
            watcher::Event::Init | watcher::Event::InitDone => {}
        }
    }
    Ok(())
}
