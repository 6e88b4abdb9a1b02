//! Argo CD installation on the target cluster

use std::path::Path;
use std::time::Duration;

use kube::Client;
use serde_json::{json, Value};
use tracing::info;

use gokp_common::kube_utils::wait_for_deployment;
use gokp_common::{Error, Result};

use crate::apply::Applier;
use crate::manifest::{ManifestDocument, ManifestSet};
use crate::render::{render_to_workspace, ManifestRenderer};
use crate::workspace::{ARGOCD_INSTALL_DIR, ARGOCD_INSTALL_FILE};

use super::skeleton::{
    APPLICATIONSETS_DIR, APPLICATIONS_DIR, ARGOCD_NAMESPACE, BOOTSTRAP_OVERLAY,
    CLUSTER_DEFINITION_DIR,
};
use super::RepositoryHandle;

/// Deployments that must be Available before Applications are created
pub const ARGOCD_DEPLOYMENTS: [&str; 3] = ["argocd-server", "argocd-repo-server", "argocd-redis"];

const DEPLOYMENT_TIMEOUT: Duration = Duration::from_secs(600);

/// Repository credential Secret Argo CD uses to pull over SSH
pub fn repository_secret(handle: &RepositoryHandle, private_key: &str) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "Secret",
        "metadata": {
            "name": format!("repo-{}", handle.name),
            "namespace": ARGOCD_NAMESPACE,
            "labels": {
                "argocd.argoproj.io/secret-type": "repository"
            }
        },
        "type": "Opaque",
        "stringData": {
            "type": "git",
            "url": handle.ssh_url,
            "sshPrivateKey": private_key
        }
    })
}

/// Install Argo CD from the repository's bootstrap overlay, give it access to
/// the repository and create the repository's Applications.
pub async fn install(
    renderer: &dyn ManifestRenderer,
    client: &Client,
    handle: &RepositoryHandle,
    workdir: &Path,
) -> Result<()> {
    let overlay = handle.local_path.join(BOOTSTRAP_OVERLAY);
    let manifests = render_to_workspace(
        renderer,
        &overlay,
        &workdir.join(ARGOCD_INSTALL_FILE),
        &workdir.join(ARGOCD_INSTALL_DIR),
    )
    .await?;

    let applier = Applier::new(client.clone());
    info!(documents = manifests.len(), "Installing Argo CD");
    applier.apply(&manifests).await?;

    for deployment in ARGOCD_DEPLOYMENTS {
        wait_for_deployment(client, deployment, ARGOCD_NAMESPACE, DEPLOYMENT_TIMEOUT).await?;
    }
    info!("Argo CD is available");

    let key_path = &handle.deploy_key.private_key_path;
    let private_key = std::fs::read_to_string(key_path)
        .map_err(|e| Error::resource(key_path, format!("failed to read deploy key: {}", e)))?;
    let secret = serde_yaml::to_string(&repository_secret(handle, &private_key))
        .map_err(|e| Error::apply("repository secret", e))?;
    applier
        .apply(&ManifestSet::new(vec![ManifestDocument::new(
            "repository-secret.yaml",
            secret,
        )]))
        .await?;

    for dir in [APPLICATIONS_DIR, APPLICATIONSETS_DIR] {
        let set = ManifestSet::read_from(&handle.local_path.join(dir))?;
        info!(documents = set.len(), dir = %dir, "Applying Argo CD resources");
        applier.apply(&set).await?;
    }

    Ok(())
}

/// Let Argo CD reconcile the exported cluster definition. Only safe once the
/// target's own controllers hold the Cluster API objects.
pub async fn sync_cluster_definition(client: &Client, handle: &RepositoryHandle) -> Result<()> {
    let set = ManifestSet::read_from(&handle.local_path.join(CLUSTER_DEFINITION_DIR))?;
    info!(documents = set.len(), "Enabling cluster definition sync");
    Applier::new(client.clone()).apply(&set).await
}
