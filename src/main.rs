use clap::Parser;
use pacekeeper::config::{Cli, Commands};
use pacekeeper::init_tracing;

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    init_tracing("info");

    let cli = Cli::parse();
    match cli.command {
        Commands::Service(args) => pacekeeper::runtime::run_service(args).await,
    }
}
