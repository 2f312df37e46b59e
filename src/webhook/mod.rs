//! Mutating admission webhook frontend.
//!
//! Serves `AdmissionReview` requests for pods and jobs over TLS and
//! expresses every mutation as a JSON patch against the submitted object.
//! Decisions themselves live in [`crate::controller::admission`]; this
//! module only translates between the review wire format and the
//! defaulter.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use axum::{Json, Router, extract::State, routing::get, routing::post};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Pod;
use kube::core::DynamicObject;
use kube::core::admission::{
    AdmissionRequest, AdmissionResponse, AdmissionReview,
};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::controller::admission::Admission;
use crate::metrics::PacingMetrics;

#[derive(Clone)]
pub struct TlsPaths {
    pub dir: PathBuf,
    pub cert_filename: String,
    pub key_filename: String,
}

impl TlsPaths {
    fn cert_path(&self) -> PathBuf {
        self.dir.join(&self.cert_filename)
    }

    fn key_path(&self) -> PathBuf {
        self.dir.join(&self.key_filename)
    }
}

#[derive(Clone)]
struct WebhookState {
    admission: Arc<Admission>,
    metrics: Arc<PacingMetrics>,
}

pub fn webhook_router(
    admission: Arc<Admission>,
    metrics: Arc<PacingMetrics>,
) -> Router {
    Router::new()
        .route("/mutate/pods", post(mutate_pods))
        .route("/mutate/jobs", post(mutate_jobs))
        .with_state(WebhookState { admission, metrics })
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
}

async fn mutate_pods(
    State(state): State<WebhookState>,
    Json(review): Json<AdmissionReview<Pod>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let request: AdmissionRequest<Pod> = match review.try_into() {
        Ok(request) => request,
        Err(err) => {
            warn!(error = %err, "invalid pod admission review");
            return Json(
                AdmissionResponse::invalid(err.to_string()).into_review(),
            );
        }
    };

    let mut response = AdmissionResponse::from(&request);
    if let Some(original) = request.object.as_ref() {
        let mut mutated = original.clone();
        response = match state.admission.mutate_pod(&mut mutated).await {
            Ok(()) => finalize(response, original, &mutated),
            Err(err) => {
                state.metrics.record_admission_error();
                if state.admission.bypass_failures() {
                    warn!(error = %err, "pod admission failed, allowing");
                    response
                } else {
                    AdmissionResponse::invalid(err.to_string())
                }
            }
        };
    }
    Json(response.into_review())
}

async fn mutate_jobs(
    State(state): State<WebhookState>,
    Json(review): Json<AdmissionReview<Job>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let request: AdmissionRequest<Job> = match review.try_into() {
        Ok(request) => request,
        Err(err) => {
            warn!(error = %err, "invalid job admission review");
            return Json(
                AdmissionResponse::invalid(err.to_string()).into_review(),
            );
        }
    };

    let mut response = AdmissionResponse::from(&request);
    if let Some(original) = request.object.as_ref() {
        let mut mutated = original.clone();
        response = match state.admission.mutate_job(&mut mutated).await {
            Ok(()) => finalize(response, original, &mutated),
            Err(err) => {
                state.metrics.record_admission_error();
                if state.admission.bypass_failures() {
                    warn!(error = %err, "job admission failed, allowing");
                    response
                } else {
                    AdmissionResponse::invalid(err.to_string())
                }
            }
        };
    }
    Json(response.into_review())
}

/// Attaches the patch between the submitted and mutated object, if any.
fn finalize<T: Serialize>(
    response: AdmissionResponse,
    original: &T,
    mutated: &T,
) -> AdmissionResponse {
    let before = match serde_json::to_value(original) {
        Ok(value) => value,
        Err(err) => return AdmissionResponse::invalid(err.to_string()),
    };
    let after = match serde_json::to_value(mutated) {
        Ok(value) => value,
        Err(err) => return AdmissionResponse::invalid(err.to_string()),
    };
    if before == after {
        return response;
    }
    match response.with_patch(json_patch::diff(&before, &after)) {
        Ok(patched) => patched,
        Err(err) => AdmissionResponse::invalid(err.to_string()),
    }
}

fn load_server_config(tls: &TlsPaths) -> anyhow::Result<rustls::ServerConfig> {
    use std::fs::File;
    use std::io::BufReader;

    let cert_path = tls.cert_path();
    let key_path = tls.key_path();

    let mut cert_reader = BufReader::new(
        File::open(&cert_path)
            .with_context(|| format!("opening {}", cert_path.display()))?,
    );
    let certs = rustls_pemfile::certs(&mut cert_reader)
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("reading {}", cert_path.display()))?;

    let mut key_reader = BufReader::new(
        File::open(&key_path)
            .with_context(|| format!("opening {}", key_path.display()))?,
    );
    let key = rustls_pemfile::private_key(&mut key_reader)
        .with_context(|| format!("reading {}", key_path.display()))?
        .with_context(|| {
            format!("no private key found in {}", key_path.display())
        })?;

    rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("building TLS server config")
}

/// Accepts TLS connections and serves the webhook router on each.
pub async fn run_webhook_server(
    port: u16,
    tls: TlsPaths,
    admission: Arc<Admission>,
    metrics: Arc<PacingMetrics>,
) -> anyhow::Result<()> {
    let _ = rustls::crypto::ring::default_provider().install_default();
    let config = load_server_config(&tls)?;
    let acceptor = TlsAcceptor::from(Arc::new(config));

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "webhook listening");

    let app = webhook_router(admission, metrics);
    loop {
        let (stream, peer) = listener.accept().await?;
        let acceptor = acceptor.clone();
        let tower_service = app.clone();
        tokio::spawn(async move {
            let stream = match acceptor.accept(stream).await {
                Ok(stream) => stream,
                Err(err) => {
                    debug!(%peer, error = %err, "TLS handshake failed");
                    return;
                }
            };
            let service =
                hyper_util::service::TowerToHyperService::new(tower_service);
            let result = hyper_util::server::conn::auto::Builder::new(
                hyper_util::rt::TokioExecutor::new(),
            )
            .serve_connection(hyper_util::rt::TokioIo::new(stream), service)
            .await;
            if let Err(err) = result {
                debug!(%peer, error = %err, "webhook connection error");
            }
        });
    }
}

/// Serves liveness and readiness probes.
pub async fn run_health_server(addr: SocketAddr) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(|| async { "ok" }));

    info!(%addr, "health probes listening");
    axum::serve(TcpListener::bind(addr).await?, app).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn identical_objects_produce_no_patch() {
        let pod = Pod::default();
        let response = finalize(
            AdmissionResponse::invalid("seed".to_string()),
            &pod,
            &pod,
        );
        assert!(response.patch.is_none());
    }

    #[test]
    fn label_mutation_produces_a_patch() {
        let original = Pod::default();
        let mut mutated = original.clone();
        mutated.metadata.labels = Some(BTreeMap::from([(
            "pacekeeper.io/group".to_string(),
            "abc".to_string(),
        )]));

        let response = finalize(
            AdmissionResponse::invalid("seed".to_string()),
            &original,
            &mutated,
        );
        let patch = response.patch.expect("patch expected");
        let ops: serde_json::Value =
            serde_json::from_slice(&patch).expect("patch is json");
        let rendered = ops.to_string();
        assert!(rendered.contains("/metadata/labels"));
        assert!(rendered.contains("abc"));
    }
}
