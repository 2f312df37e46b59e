//! Service assembly: builds the classifier from configuration and runs
//! the webhook, controllers, health probes and metrics exposer until one
//! fails or a shutdown signal arrives.

use std::sync::Arc;

use kube::Client;
use prometheus::Registry;
use tracing::info;

use crate::blocker::{NodeSelectorBlocker, PodBlocker};
use crate::config::{PolicyFile, ServiceArgs, build_classifier};
use crate::controller::admission::Admission;
use crate::controller::flight::{FlightTracker, FlightWaiter};
use crate::controller::standing::{GroupStandingQuery, StandingSource};
use crate::controller::{GROUP_ID_LABEL, run_controllers};
use crate::metrics::{PacingMetrics, run_metrics_server};
use crate::webhook::{run_health_server, run_webhook_server};

pub async fn run_service(args: ServiceArgs) -> anyhow::Result<()> {
    let policies = PolicyFile::load(&args.config_path)?;
    let classifier = Arc::new(build_classifier(&policies)?);
    info!(policies = policies.policies.len(), "compiled pacing policies");

    let client = Client::try_default().await?;
    let registry = Registry::new();
    let metrics = Arc::new(PacingMetrics::new(&registry)?);

    let blocker: Arc<dyn PodBlocker> = Arc::new(NodeSelectorBlocker::new());
    let tracker =
        FlightTracker::spawn(args.max_flight_duration(), GROUP_ID_LABEL);
    let standing: Arc<dyn StandingSource> = Arc::new(GroupStandingQuery::new(
        client.clone(),
        GROUP_ID_LABEL,
        blocker.clone(),
    ));
    let admission = Arc::new(Admission::new(
        classifier.clone(),
        standing.clone(),
        blocker,
        tracker.clone() as Arc<dyn FlightWaiter>,
        metrics.clone(),
        args.enable_label.clone(),
        args.bypass_failures,
    ));

    if args.leader_election {
        // coordination is provided by the deployment (single replica or an
        // external elector); the flag is accepted for compatibility
        info!(id = %args.leader_election_id, "leader election requested");
    }

    let controllers = run_controllers(
        client,
        classifier,
        standing,
        tracker,
        metrics.clone(),
        args.enable_label.clone(),
        args.resync(),
    );
    let webhook = run_webhook_server(
        args.tls_port,
        args.tls_paths(),
        admission,
        metrics.clone(),
    );
    let health = run_health_server(args.health_probe_bind_address);
    let exposer = run_metrics_server(args.metrics_listen, registry);

    tokio::select! {
        _ = shutdown_signal() => {
            info!("shutdown signal received, exiting");
            Ok(())
        }
        result = controllers => result,
        result = webhook => result,
        result = health => result,
        result = exposer => result,
    }
}

async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}
