use std::net::SocketAddr;

use axum::{Router, http::StatusCode, response::IntoResponse, routing::get};
use prometheus::{
    Encoder, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use tracing::info;

const NAMESPACE: &str = "pacekeeper";

#[derive(Clone)]
pub struct PacingMetrics {
    build_info: IntGaugeVec,
    decisions_total: IntCounterVec,
    evictions_total: IntCounterVec,
    admission_errors_total: IntCounter,
}

impl PacingMetrics {
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let metrics = Self::unregistered();
        registry.register(Box::new(metrics.build_info.clone()))?;
        registry.register(Box::new(metrics.decisions_total.clone()))?;
        registry.register(Box::new(metrics.evictions_total.clone()))?;
        registry
            .register(Box::new(metrics.admission_errors_total.clone()))?;
        Ok(metrics)
    }

    /// Metrics bound to no registry; the constructors below cannot fail on
    /// valid static names.
    pub fn unregistered() -> Self {
        let build_info = IntGaugeVec::new(
            Opts::new("build_info", "pacekeeper build information")
                .namespace(NAMESPACE),
            &["version"],
        )
        .expect("valid metric definition");
        build_info
            .with_label_values(&[env!("CARGO_PKG_VERSION")])
            .set(1);

        let decisions_total = IntCounterVec::new(
            Opts::new(
                "pacing_decisions_total",
                "Admission pacing decisions by policy and decision",
            )
            .namespace(NAMESPACE),
            &["policy", "decision"],
        )
        .expect("valid metric definition");

        let evictions_total = IntCounterVec::new(
            Opts::new(
                "evictions_total",
                "Pods evicted to release them from pacing, by group",
            )
            .namespace(NAMESPACE),
            &["group"],
        )
        .expect("valid metric definition");

        let admission_errors_total = IntCounter::with_opts(
            Opts::new(
                "admission_errors_total",
                "Admission requests that failed and were bypassed or rejected",
            )
            .namespace(NAMESPACE),
        )
        .expect("valid metric definition");

        Self {
            build_info,
            decisions_total,
            evictions_total,
            admission_errors_total,
        }
    }

    pub fn record_decisions(&self, policies: &[String], allowed: bool) {
        let decision = if allowed { "allow" } else { "block" };
        for policy in policies {
            self.decisions_total
                .with_label_values(&[policy, decision])
                .inc();
        }
    }

    pub fn record_eviction(&self, group: &str) {
        self.evictions_total.with_label_values(&[group]).inc();
    }

    pub fn record_admission_error(&self) {
        self.admission_errors_total.inc();
    }
}

async fn metrics_handler(
    axum::extract::State(registry): axum::extract::State<Registry>,
) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    match encoder.encode(&registry.gather(), &mut buffer) {
        Ok(()) => (StatusCode::OK, buffer).into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to encode metrics: {err}"),
        )
            .into_response(),
    }
}

/// Serves the Prometheus exposition endpoint.
pub async fn run_metrics_server(
    addr: SocketAddr,
    registry: Registry,
) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(registry);

    info!(%addr, "metrics exposer listening");
    axum::serve(tokio::net::TcpListener::bind(addr).await?, app).await?;
    Ok(())
}
