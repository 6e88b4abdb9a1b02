//! create-cluster command - install a self-managing cluster
//!
//! Builds the production components, wires Ctrl-C to the run's
//! cancellation token and hands over to the [`Orchestrator`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use clap::{ArgAction, Args, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bootstrap::KindBootstrap;
use crate::gitops::GitHubPublisher;
use crate::orchestrator::Orchestrator;
use crate::pivot::CapiPivot;
use crate::provision::{AwsCredentials, CapaProvisioner, InfraSpec};
use crate::render::KustomizeRenderer;
use crate::run::RunConfig;
use crate::workspace::ArtifactWorkspace;
use crate::Result;

/// Create a cluster
#[derive(Args, Debug)]
pub struct CreateClusterArgs {
    #[command(subcommand)]
    pub provider: Provider,
}

/// Supported infrastructure providers
#[derive(Subcommand, Debug)]
pub enum Provider {
    /// Create the cluster on AWS with Cluster API Provider AWS
    Aws(AwsArgs),
}

/// Flags of `create-cluster aws`
#[derive(Args)]
pub struct AwsArgs {
    /// GitHub personal access token with repo scope
    #[arg(long, env = "GITHUB_TOKEN", hide_env_values = true)]
    pub github_token: String,

    /// Name of the cluster and of its GitOps repository
    #[arg(long)]
    pub cluster_name: String,

    /// Create the GitOps repository as private
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub private_repo: bool,

    /// AWS region to deploy into
    #[arg(long, default_value = "us-east-1")]
    pub aws_region: String,

    /// AWS access key id
    #[arg(long, env = "AWS_ACCESS_KEY_ID", hide_env_values = true)]
    pub aws_access_key: String,

    /// AWS secret access key
    #[arg(long, env = "AWS_SECRET_ACCESS_KEY", hide_env_values = true)]
    pub aws_secret_key: String,

    /// Existing EC2 key pair for the instances
    #[arg(long, default_value = "default")]
    pub aws_ssh_key: String,

    /// Instance type of control plane machines
    #[arg(long, default_value = "m4.xlarge")]
    pub aws_control_plane_machine: String,

    /// Instance type of worker machines
    #[arg(long, default_value = "m4.xlarge")]
    pub aws_node_machine: String,

    /// Run three control plane machines
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub ha: bool,

    /// Skip creating the IAM CloudFormation stack (it already exists)
    #[arg(long, default_value_t = false, action = ArgAction::Set)]
    pub skip_cloud_formation: bool,

    /// Kubernetes version of the cluster
    #[arg(long, default_value = "v1.28.3")]
    pub kubernetes_version: String,

    /// How long to wait for the cluster to become ready, in seconds
    #[arg(long, default_value = "2400")]
    pub provision_timeout_secs: u64,
}

impl fmt::Debug for AwsArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AwsArgs")
            .field("github_token", &"<redacted>")
            .field("cluster_name", &self.cluster_name)
            .field("private_repo", &self.private_repo)
            .field("aws_region", &self.aws_region)
            .field("aws_access_key", &self.aws_access_key)
            .field("aws_secret_key", &"<redacted>")
            .field("aws_ssh_key", &self.aws_ssh_key)
            .field("aws_control_plane_machine", &self.aws_control_plane_machine)
            .field("aws_node_machine", &self.aws_node_machine)
            .field("ha", &self.ha)
            .field("skip_cloud_formation", &self.skip_cloud_formation)
            .field("kubernetes_version", &self.kubernetes_version)
            .field("provision_timeout_secs", &self.provision_timeout_secs)
            .finish()
    }
}

impl AwsArgs {
    /// Run input built from the flags
    pub fn run_config(&self) -> RunConfig {
        RunConfig {
            cluster_name: self.cluster_name.clone(),
            private_repo: self.private_repo,
            credentials: AwsCredentials {
                region: self.aws_region.clone(),
                access_key_id: self.aws_access_key.clone(),
                secret_access_key: self.aws_secret_key.clone(),
                ssh_key_name: self.aws_ssh_key.clone(),
            },
            infra: InfraSpec {
                kubernetes_version: self.kubernetes_version.clone(),
                control_plane_machine: self.aws_control_plane_machine.clone(),
                node_machine: self.aws_node_machine.clone(),
                ha: self.ha,
                skip_cloud_formation: self.skip_cloud_formation,
                provision_timeout: Duration::from_secs(self.provision_timeout_secs),
            },
        }
    }
}

pub async fn run(args: CreateClusterArgs) -> Result<()> {
    match args.provider {
        Provider::Aws(aws) => run_aws(aws).await,
    }
}

async fn run_aws(args: AwsArgs) -> Result<()> {
    let config = args.run_config();

    info!("Cluster: {}", config.cluster_name);
    info!("Region: {}", config.credentials.region);
    info!(
        "Control plane: {} x {}",
        config.infra.control_plane_count(),
        config.infra.control_plane_machine
    );
    info!("Kubernetes version: {}", config.infra.kubernetes_version);

    let renderer = Arc::new(KustomizeRenderer::default());
    let orchestrator = Orchestrator::new(
        ArtifactWorkspace::from_home()?,
        Arc::new(KindBootstrap::default()),
        Arc::new(CapaProvisioner::default()),
        Arc::new(GitHubPublisher::new(args.github_token, renderer)?),
        Arc::new(CapiPivot::default()),
    );

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    let signal = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping at the next safe point");
            on_interrupt.cancel();
        }
    });

    let result = orchestrator
        .with_cancellation(cancel)
        .run(config)
        .await;
    signal.abort();

    let archive = result?;
    info!(
        "Cluster Successfully installed! Everything you need is under: {}",
        archive.display()
    );
    Ok(())
}
