//! Artifact workspace: the per-run scratch directory and its archive
//!
//! Every run works inside `~/.gokp/.gokpinstall<random>`. A successful run
//! renames it to `~/.gokp/<cluster>` and prunes the intermediate files, so
//! the archive holds only what an operator needs afterwards.

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use gokp_common::{Error, Result, GOKP_DIR_NAME};

/// Prefix of per-run workspace directories
pub const WORKSPACE_PREFIX: &str = ".gokpinstall";

/// Persisted run state
pub const RUN_FILE: &str = "gokp-run.json";
/// Kubeconfig of the bootstrap cluster
pub const KIND_KUBECONFIG: &str = "kind.kubeconfig";
/// Rendered Cluster API request
pub const INSTALL_CLUSTER_FILE: &str = "install-cluster.yaml";
/// Split Cluster API request
pub const CAPI_INSTALL_DIR: &str = "capi-install-yamls-output";
/// Downloaded CNI manifest
pub const CNI_FILE: &str = "cni.yaml";
/// Split CNI manifest
pub const CNI_DIR: &str = "cni-output";
/// Rendered Argo CD install
pub const ARGOCD_INSTALL_FILE: &str = "argocd-install.yaml";
/// Split Argo CD install
pub const ARGOCD_INSTALL_DIR: &str = "argocd-install-output";

/// Directories removed from the archive after promotion
pub const PRUNE_DIRS: [&str; 3] = [ARGOCD_INSTALL_DIR, CAPI_INSTALL_DIR, CNI_DIR];
/// Files removed from the archive after promotion
pub const PRUNE_FILES: [&str; 4] = [
    ARGOCD_INSTALL_FILE,
    CNI_FILE,
    INSTALL_CLUSTER_FILE,
    KIND_KUBECONFIG,
];

/// Kubeconfig file name of the target cluster
pub fn target_kubeconfig_name(cluster: &str) -> String {
    format!("{}.kubeconfig", cluster)
}

/// The `~/.gokp` root that holds workspaces and archives
#[derive(Debug, Clone)]
pub struct ArtifactWorkspace {
    root: PathBuf,
}

impl ArtifactWorkspace {
    /// Use an explicit root directory
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Locate `~/.gokp` from the user's home directory
    pub fn from_home() -> Result<Self> {
        let home = dirs::home_dir()
            .ok_or_else(|| Error::resource("~", "cannot determine the home directory"))?;
        Ok(Self::new(home.join(GOKP_DIR_NAME)))
    }

    /// Where the archive of `cluster` lives once promoted
    pub fn archive_path(&self, cluster: &str) -> PathBuf {
        self.root.join(cluster)
    }

    /// Refuse to start if an archive for `cluster` already exists
    pub fn preflight(&self, cluster: &str) -> Result<()> {
        let archive = self.archive_path(cluster);
        if archive.exists() {
            return Err(Error::conflict(
                format!("archive {}", archive.display()),
                "stray artifacts from a previous install; move or delete them first",
            ));
        }
        Ok(())
    }

    /// Create a fresh, private workspace directory under the root
    pub fn acquire(&self) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.root)
            .map_err(|e| Error::resource(&self.root, format!("failed to create root: {}", e)))?;

        let dir = tempfile::Builder::new()
            .prefix(WORKSPACE_PREFIX)
            .tempdir_in(&self.root)
            .map_err(|e| {
                Error::resource(&self.root, format!("failed to create workspace: {}", e))
            })?
            .keep();

        info!(workspace = %dir.display(), "Acquired workspace");
        Ok(dir)
    }

    /// Rename the workspace to the cluster archive and prune intermediates.
    ///
    /// Returns the archive path.
    pub fn promote(&self, workspace: &Path, cluster: &str) -> Result<PathBuf> {
        let archive = self.archive_path(cluster);
        if archive.exists() {
            return Err(Error::conflict(
                format!("archive {}", archive.display()),
                "refusing to overwrite an existing archive",
            ));
        }

        std::fs::rename(workspace, &archive).map_err(|e| {
            Error::resource(workspace, format!("failed to promote workspace: {}", e))
        })?;

        for dir in PRUNE_DIRS {
            remove_if_present(&archive.join(dir), true)?;
        }
        for file in PRUNE_FILES {
            remove_if_present(&archive.join(file), false)?;
        }

        info!(archive = %archive.display(), "Promoted workspace");
        Ok(archive)
    }

    /// Best-effort recursive delete of a workspace
    pub fn release(workspace: &Path) {
        match std::fs::remove_dir_all(workspace) {
            Ok(()) => debug!(workspace = %workspace.display(), "Released workspace"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                workspace = %workspace.display(),
                error = %e,
                "Failed to release workspace"
            ),
        }
    }
}

fn remove_if_present(path: &Path, is_dir: bool) -> Result<()> {
    let result = if is_dir {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    };
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::resource(path, format!("failed to prune: {}", e))),
    }
}
