//! gokp CLI library
//!
//! The installer creates a disposable kind cluster, provisions the real
//! cluster on AWS through Cluster API, publishes its definition to a fresh
//! GitHub repository, installs Argo CD and then pivots the Cluster API
//! objects onto the new cluster so it manages itself.

pub mod apply;
pub mod bootstrap;
pub mod commands;
pub mod gitops;
pub mod manifest;
pub mod orchestrator;
pub mod pivot;
pub mod process;
pub mod provision;
pub mod render;
pub mod run;
pub mod workspace;

pub use gokp_common::{Error, ErrorKind, Result};

use clap::{Parser, Subcommand};

/// gokp - GitOps Kubernetes Platform installer
#[derive(Parser, Debug)]
#[command(name = "gokp")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create a self-managing cluster on a cloud provider
    CreateCluster(commands::create_cluster::CreateClusterArgs),
    /// Show the persisted state of a workspace or cluster archive
    Status(commands::status::StatusArgs),
}

impl Cli {
    /// Run the CLI command
    pub async fn run(self) -> Result<()> {
        match self.command {
            Commands::CreateCluster(args) => commands::create_cluster::run(args).await,
            Commands::Status(args) => commands::status::run(args).await,
        }
    }
}
