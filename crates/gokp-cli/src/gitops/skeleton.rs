//! Argo CD bootstrap skeleton committed as the first commit of every repository

use std::path::Path;

use minijinja::Environment;
use serde::Serialize;
use tracing::debug;

use gokp_common::{Error, Result};

use super::RepositoryHandle;

/// Upstream Argo CD manifest the bootstrap base builds on
pub const ARGOCD_INSTALL_URL: &str =
    "https://raw.githubusercontent.com/argoproj/argo-cd/v2.8.4/manifests/install.yaml";

/// Namespace Argo CD is installed into
pub const ARGOCD_NAMESPACE: &str = "argocd";

/// Overlay rendered to install Argo CD, relative to the repository root
pub const BOOTSTRAP_OVERLAY: &str = "cluster/bootstrap/overlays/default";

/// Applications applied after Argo CD is up
pub const APPLICATIONS_DIR: &str = "cluster/components/applications";

/// ApplicationSets applied after the Applications
pub const APPLICATIONSETS_DIR: &str = "cluster/components/applicationsets";

/// Application syncing the exported cluster definition, applied after the pivot
pub const CLUSTER_DEFINITION_DIR: &str = "cluster/components/cluster-definition";

/// Template name and repository path of every skeleton file
const SKELETON: &[(&str, &str, &str)] = &[
    ("README.md", "README.md", include_str!("../../templates/README.md.j2")),
    (
        "bootstrap-base-kustomization",
        "cluster/bootstrap/base/kustomization.yaml",
        include_str!("../../templates/bootstrap-base-kustomization.yaml.j2"),
    ),
    (
        "argocd-namespace",
        "cluster/bootstrap/base/argocd-namespace.yaml",
        include_str!("../../templates/argocd-namespace.yaml.j2"),
    ),
    (
        "bootstrap-overlay-kustomization",
        "cluster/bootstrap/overlays/default/kustomization.yaml",
        include_str!("../../templates/bootstrap-overlay-kustomization.yaml.j2"),
    ),
    (
        "argocd-cm",
        "cluster/bootstrap/overlays/default/argocd-cm.yaml",
        include_str!("../../templates/argocd-cm.yaml.j2"),
    ),
    (
        "core-components-appset",
        "cluster/components/applicationsets/core-components-appset.yaml",
        include_str!("../../templates/core-components-appset.yaml.j2"),
    ),
    (
        "argocd-application",
        "cluster/components/applications/argocd.yaml",
        include_str!("../../templates/argocd-application.yaml.j2"),
    ),
    (
        "cluster-definition-application",
        "cluster/components/cluster-definition/capi.yaml",
        include_str!("../../templates/cluster-definition-application.yaml.j2"),
    ),
    (
        "gitops-controller-kustomization",
        "cluster/core/gitops-controller/kustomization.yaml",
        include_str!("../../templates/gitops-controller-kustomization.yaml.j2"),
    ),
];

/// Values substituted into the skeleton templates
#[derive(Debug, Clone, Serialize)]
pub struct SkeletonContext {
    pub cluster_name: String,
    pub repo_ssh_url: String,
    pub repo_html_url: String,
    pub argocd_install_url: String,
    pub namespace: String,
}

impl SkeletonContext {
    pub fn new(cluster: &str, handle: &RepositoryHandle) -> Self {
        Self {
            cluster_name: cluster.to_string(),
            repo_ssh_url: handle.ssh_url.clone(),
            repo_html_url: handle.html_url.clone(),
            argocd_install_url: ARGOCD_INSTALL_URL.to_string(),
            namespace: ARGOCD_NAMESPACE.to_string(),
        }
    }
}

fn environment() -> Result<Environment<'static>> {
    let mut env = Environment::new();
    for (name, _, source) in SKELETON {
        env.add_template(*name, *source)
            .map_err(|e| Error::render(*name, format!("invalid template: {}", e)))?;
    }
    Ok(env)
}

/// Render every skeleton file as `(repository path, content)`
pub fn render_skeleton(context: &SkeletonContext) -> Result<Vec<(&'static str, String)>> {
    let env = environment()?;
    SKELETON
        .iter()
        .map(|(name, path, _)| {
            env.get_template(name)
                .and_then(|t| t.render(context))
                .map(|content| (*path, content))
                .map_err(|e| Error::render(*path, e.to_string()))
        })
        .collect()
}

/// Write the rendered skeleton under `repo_dir`
pub fn write_skeleton(repo_dir: &Path, context: &SkeletonContext) -> Result<()> {
    for (relative, content) in render_skeleton(context)? {
        let path = repo_dir.join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::resource(parent, format!("failed to create directory: {}", e)))?;
        }
        std::fs::write(&path, format!("{}\n", content.trim_end()))
            .map_err(|e| Error::resource(&path, format!("failed to write: {}", e)))?;
        debug!(file = %relative, "Wrote skeleton file");
    }
    Ok(())
}
