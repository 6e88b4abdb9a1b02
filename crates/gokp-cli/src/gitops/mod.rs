//! GitOps publishing: repository, skeleton, pushes and Argo CD
//!
//! [`GitHubPublisher`] creates one repository per cluster with a read-write
//! deploy key, seeds it with the Argo CD bootstrap skeleton, pushes the
//! exported cluster definition and installs Argo CD on the target so the
//! cluster reconciles from its own repository.

pub mod argocd;
pub mod git;
pub mod github;
pub mod skeleton;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

#[cfg(test)]
use mockall::automock;

use gokp_common::retry::{retry_when, RetryConfig};
use gokp_common::{Error, Result};

use crate::render::ManifestRenderer;
use crate::run::ClusterEndpoint;

use self::git::PushAuth;
use self::github::GitHubClient;

/// Branch every repository is created with
pub const DEFAULT_BRANCH: &str = "main";

/// Commit message of the skeleton commit
pub const SEED_COMMIT_MESSAGE: &str = "initial commit";

/// Deploy key generated for a repository
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployKey {
    /// OpenSSH private key file, mode 0600
    pub private_key_path: PathBuf,
    /// OpenSSH public key line
    pub public_key: String,
}

/// A created repository and its local clone
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryHandle {
    /// Browser URL
    pub html_url: String,
    /// HTTPS clone URL, used as `origin`
    pub clone_url: String,
    /// SSH URL, used by Argo CD with the deploy key
    pub ssh_url: String,
    /// Owning account
    pub owner: String,
    /// Repository name, the cluster name
    pub name: String,
    /// Branch pushed to
    pub default_branch: String,
    /// Whether the repository is private
    pub private: bool,
    /// Local clone
    pub local_path: PathBuf,
    /// Read-write deploy key
    pub deploy_key: DeployKey,
}

/// Publishes a cluster's desired state and installs the GitOps controller
#[cfg_attr(test, automock)]
#[async_trait]
pub trait GitOpsPublisher: Send + Sync {
    /// Create the remote repository, its deploy key and a local clone
    async fn create_repository(
        &self,
        name: &str,
        private: bool,
        workdir: &Path,
    ) -> Result<RepositoryHandle>;

    /// Write the skeleton into the clone, commit and push it
    async fn seed(&self, handle: &RepositoryHandle, cluster: &str) -> Result<()>;

    /// Commit everything in the clone and push it
    async fn publish(&self, handle: &RepositoryHandle, message: &str) -> Result<()>;

    /// Install Argo CD and the repository's applications on the target
    async fn install_controller(
        &self,
        target: &ClusterEndpoint,
        handle: &RepositoryHandle,
        workdir: &Path,
    ) -> Result<()>;

    /// Start syncing the exported cluster definition on the target
    async fn sync_cluster_definition(
        &self,
        target: &ClusterEndpoint,
        handle: &RepositoryHandle,
    ) -> Result<()>;
}

/// [`GitOpsPublisher`] for GitHub
pub struct GitHubPublisher {
    github: GitHubClient,
    auth: PushAuth,
    renderer: Arc<dyn ManifestRenderer>,
    deploy_key_retry: RetryConfig,
}

impl GitHubPublisher {
    /// Create a publisher authenticating with `token`
    pub fn new(token: impl Into<String>, renderer: Arc<dyn ManifestRenderer>) -> Result<Self> {
        let token = token.into();
        Ok(Self {
            github: GitHubClient::new(token.clone())?,
            auth: PushAuth::token(token),
            renderer,
            deploy_key_retry: RetryConfig::with_max_attempts(5),
        })
    }
}

#[async_trait]
impl GitOpsPublisher for GitHubPublisher {
    async fn create_repository(
        &self,
        name: &str,
        private: bool,
        workdir: &Path,
    ) -> Result<RepositoryHandle> {
        let owner = self.github.current_user().await?;
        info!(owner = %owner, repo = %name, private, "Creating GitOps repository");

        let repo = self.github.create_repository(name, private).await?;

        let deploy_key = github::generate_deploy_key(workdir, name)?;
        let title = format!("gokp-{}", name);
        retry_when(
            &self.deploy_key_retry,
            "register deploy key",
            || self.github.add_deploy_key(&repo.owner, name, &title, &deploy_key.public_key),
            Error::is_retryable,
        )
        .await?;

        let local_path = workdir.join(name);
        git::init_repository(&local_path, &repo.clone_url)?;

        info!(url = %repo.html_url, "Repository created");
        Ok(RepositoryHandle {
            html_url: repo.html_url,
            clone_url: repo.clone_url,
            ssh_url: repo.ssh_url,
            owner: repo.owner,
            name: name.to_string(),
            default_branch: DEFAULT_BRANCH.to_string(),
            private,
            local_path,
            deploy_key,
        })
    }

    async fn seed(&self, handle: &RepositoryHandle, cluster: &str) -> Result<()> {
        let context = skeleton::SkeletonContext::new(cluster, handle);
        skeleton::write_skeleton(&handle.local_path, &context)?;
        self.publish(handle, SEED_COMMIT_MESSAGE).await
    }

    async fn publish(&self, handle: &RepositoryHandle, message: &str) -> Result<()> {
        let path = handle.local_path.clone();
        let auth = self.auth.clone();
        let msg = message.to_string();
        let commit = tokio::task::spawn_blocking(move || {
            let commit = git::commit_all(&path, &msg)?;
            git::push(&path, &auth)?;
            Ok::<_, Error>(commit)
        })
        .await
        .map_err(|e| Error::resource(&handle.local_path, format!("git task failed: {}", e)))??;
        info!(commit = %commit, message = %message, "Pushed to {}", handle.html_url);
        Ok(())
    }

    async fn install_controller(
        &self,
        target: &ClusterEndpoint,
        handle: &RepositoryHandle,
        workdir: &Path,
    ) -> Result<()> {
        let client = target.client().await?;
        argocd::install(self.renderer.as_ref(), &client, handle, workdir).await
    }

    async fn sync_cluster_definition(
        &self,
        target: &ClusterEndpoint,
        handle: &RepositoryHandle,
    ) -> Result<()> {
        let client = target.client().await?;
        argocd::sync_cluster_definition(&client, handle).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::MockManifestRenderer;
    use git2::Repository;

    #[tokio::test]
    async fn publish_commits_and_pushes_to_origin() {
        let dir = tempfile::tempdir().unwrap();
        let remote = dir.path().join("remote.git");
        Repository::init_bare(&remote).unwrap();
        let local = dir.path().join("demo1");
        git::init_repository(&local, remote.to_str().unwrap()).unwrap();
        std::fs::write(local.join("README.md"), "# demo1\n").unwrap();

        let publisher =
            GitHubPublisher::new("ghp_test", Arc::new(MockManifestRenderer::new())).unwrap();
        let handle = RepositoryHandle {
            html_url: "https://github.com/octo/demo1".to_string(),
            clone_url: remote.to_string_lossy().into_owned(),
            ssh_url: "git@github.com:octo/demo1.git".to_string(),
            owner: "octo".to_string(),
            name: "demo1".to_string(),
            default_branch: DEFAULT_BRANCH.to_string(),
            private: true,
            local_path: local,
            deploy_key: DeployKey {
                private_key_path: dir.path().join("demo1_deploy_key"),
                public_key: "ssh-ed25519 AAAA gokp-demo1".to_string(),
            },
        };

        publisher.publish(&handle, SEED_COMMIT_MESSAGE).await.unwrap();

        let bare = Repository::open_bare(&remote).unwrap();
        let head = bare
            .find_reference("refs/heads/main")
            .unwrap()
            .peel_to_commit()
            .unwrap();
        assert_eq!(head.message(), Some(SEED_COMMIT_MESSAGE));
    }
}
