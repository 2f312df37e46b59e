use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Parser, Subcommand};

use crate::controller::DEFAULT_ENABLE_LABEL;
use crate::webhook::TlsPaths;

#[derive(Parser, Debug)]
#[command(
    name = "pacekeeper",
    version,
    about = "Admission pacing controller for Kubernetes workload rollouts"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the admission controller and reconciler service.
    Service(ServiceArgs),
}

#[derive(clap::Args, Clone, Debug)]
pub struct ServiceArgs {
    /// Path to the pacing policy YAML file.
    #[arg(long, env = "PACEKEEPER_CONFIG_PATH")]
    pub config_path: PathBuf,

    /// Pod label that opts a workload into pacing.
    #[arg(long, default_value = DEFAULT_ENABLE_LABEL)]
    pub enable_label: String,

    /// Do not block admission on internal errors.
    #[arg(long, action = ArgAction::Set, default_value_t = true)]
    pub bypass_failures: bool,

    /// Maximum time in milliseconds to wait for a pod between admission
    /// and observation, after which it is assumed committed.
    #[arg(long, default_value_t = 1000)]
    pub max_flight_duration_ms: u64,

    /// Directory containing the TLS PEM files.
    #[arg(long, default_value = ".")]
    pub tls_dir: PathBuf,

    /// TLS certificate file name inside the TLS directory.
    #[arg(long, default_value = "tls.crt")]
    pub tls_cert_filename: String,

    /// TLS key file name inside the TLS directory.
    #[arg(long, default_value = "tls.key")]
    pub tls_key_filename: String,

    /// Port to listen on for webhook admission requests.
    #[arg(long, default_value_t = 9443)]
    pub tls_port: u16,

    /// Address to bind for the HTTP health server.
    #[arg(long, default_value = "0.0.0.0:9444")]
    pub health_probe_bind_address: SocketAddr,

    /// Prometheus exposer listen address.
    #[arg(long, default_value = "0.0.0.0:8080")]
    pub metrics_listen: SocketAddr,

    /// Enable kubernetes leader election.
    #[arg(long, action = ArgAction::Set, default_value_t = true)]
    pub leader_election: bool,

    /// Identity used for kubernetes leader election.
    #[arg(long, default_value = "pacekeeper")]
    pub leader_election_id: String,

    /// Baseline requeue interval in seconds for blocked pods.
    #[arg(long, default_value_t = 300)]
    pub resync_seconds: u64,
}

impl ServiceArgs {
    pub fn max_flight_duration(&self) -> Duration {
        Duration::from_millis(self.max_flight_duration_ms)
    }

    pub fn resync(&self) -> Duration {
        Duration::from_secs(self.resync_seconds)
    }

    pub fn tls_paths(&self) -> TlsPaths {
        TlsPaths {
            dir: self.tls_dir.clone(),
            cert_filename: self.tls_cert_filename.clone(),
            key_filename: self.tls_key_filename.clone(),
        }
    }
}
