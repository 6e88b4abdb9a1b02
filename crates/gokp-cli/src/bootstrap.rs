//! Ephemeral bootstrap cluster on kind

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{info, warn};

#[cfg(test)]
use mockall::automock;

use gokp_common::kube_utils::{create_client, wait_for_nodes_ready};
use gokp_common::{Error, Result};

use crate::process::{run_captured, NO_ENV};
use crate::run::ClusterEndpoint;

/// Name of the temporary control plane
pub const BOOTSTRAP_CLUSTER_NAME: &str = "gokp-bootstrapper";

/// Single-node kind cluster
const KIND_CONFIG: &str = r#"kind: Cluster
apiVersion: kind.x-k8s.io/v1alpha4
nodes:
- role: control-plane
"#;

/// Creates and destroys the local control plane used to provision the target
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BootstrapCluster: Send + Sync {
    /// Create the cluster and write its kubeconfig to `kubeconfig`
    async fn create(&self, name: &str, kubeconfig: &Path) -> Result<ClusterEndpoint>;

    /// Delete the cluster. Deleting a cluster that does not exist succeeds.
    async fn destroy(&self, name: &str) -> Result<()>;
}

/// [`BootstrapCluster`] backed by the kind CLI
#[derive(Debug, Clone)]
pub struct KindBootstrap {
    nodes_ready_timeout: Duration,
}

impl Default for KindBootstrap {
    fn default() -> Self {
        Self {
            nodes_ready_timeout: Duration::from_secs(120),
        }
    }
}

impl KindBootstrap {
    async fn check_container_runtime(&self) -> Result<()> {
        run_captured("docker", &["info"], NO_ENV, None)
            .await
            .map(|_| ())
            .map_err(|e| {
                Error::infrastructure("docker", format!("container runtime unavailable: {}", e))
            })
    }

    async fn existing_clusters(&self) -> Result<Vec<String>> {
        let stdout = run_captured("kind", &["get", "clusters"], NO_ENV, None).await?;
        Ok(parse_cluster_list(&stdout))
    }

    async fn delete(&self, name: &str) -> Result<()> {
        run_captured("kind", &["delete", "cluster", "--name", name], NO_ENV, None)
            .await
            .map(|_| ())
    }

    /// Export the kubeconfig of a freshly created cluster and wait for its node
    async fn connect(&self, name: &str, kubeconfig: &Path) -> Result<ClusterEndpoint> {
        let kubeconfig_str = kubeconfig
            .to_str()
            .ok_or_else(|| Error::resource(kubeconfig, "path is not valid UTF-8"))?;
        run_captured(
            "kind",
            &["export", "kubeconfig", "--name", name, "--kubeconfig", kubeconfig_str],
            NO_ENV,
            None,
        )
        .await?;

        let client = create_client(kubeconfig).await?;
        wait_for_nodes_ready(&client, self.nodes_ready_timeout).await?;

        Ok(ClusterEndpoint::bootstrap(name, kubeconfig))
    }
}

#[async_trait]
impl BootstrapCluster for KindBootstrap {
    async fn create(&self, name: &str, kubeconfig: &Path) -> Result<ClusterEndpoint> {
        self.check_container_runtime().await?;

        if self.existing_clusters().await?.iter().any(|c| c == name) {
            return Err(Error::conflict(
                format!("kind cluster {}", name),
                "left from an earlier run; inspect it and delete it with `kind delete cluster`",
            ));
        }

        info!("Creating temporary control plane: {}", name);

        let mut child = Command::new("kind")
            .args(["create", "cluster", "--name", name, "--config", "-"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::infrastructure("kind", format!("failed to start kind: {}", e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(KIND_CONFIG.as_bytes())
                .await
                .map_err(|e| Error::infrastructure("kind", e.to_string()))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| Error::infrastructure("kind", e.to_string()))?;
        if !output.status.success() {
            return Err(Error::infrastructure(
                "kind",
                format!(
                    "kind create cluster failed: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            ));
        }

        match self.connect(name, kubeconfig).await {
            Ok(endpoint) => Ok(endpoint),
            Err(e) => {
                warn!(error = %e, "Bootstrap cluster unusable, deleting it");
                if let Err(cleanup) = self.delete(name).await {
                    warn!(error = %cleanup, "Failed to delete half-created bootstrap cluster");
                }
                Err(e)
            }
        }
    }

    async fn destroy(&self, name: &str) -> Result<()> {
        if !self.existing_clusters().await?.iter().any(|c| c == name) {
            info!("Kind cluster {} does not exist, nothing to delete", name);
            return Ok(());
        }

        info!("Deleting temporary control plane: {}", name);
        self.delete(name).await
    }
}

/// Cluster names from `kind get clusters`
fn parse_cluster_list(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with("No kind clusters"))
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cluster_list_parsing() {
        assert_eq!(
            parse_cluster_list("gokp-bootstrapper\nkind\n"),
            vec!["gokp-bootstrapper", "kind"]
        );
        assert!(parse_cluster_list("No kind clusters found.\n").is_empty());
        assert!(parse_cluster_list("").is_empty());
    }

    #[test]
    fn kind_config_is_single_node() {
        let config: serde_yaml::Value = serde_yaml::from_str(KIND_CONFIG).unwrap();
        assert_eq!(config["nodes"].as_sequence().unwrap().len(), 1);
        assert_eq!(config["nodes"][0]["role"], "control-plane");
    }
}
