//! gokp CLI
//!
//! Creates a GitOps-managed Kubernetes cluster that manages itself.

use clap::Parser;
use tracing::error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use gokp_cli::Cli;

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let cli = Cli::parse();
    if let Err(e) = cli.run().await {
        error!(kind = %e.kind(), "{}", e);
        eprintln!("error [{}]: {}", e.kind(), e);
        std::process::exit(1);
    }
}
