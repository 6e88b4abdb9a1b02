//! Local artifact handling without any cluster or network
//!
//! Covers the parts of a run that only touch the filesystem: the archive
//! guard, splitting rendered output, seeding a repository with the skeleton
//! and promoting a workspace into its archive.

use std::path::Path;

use git2::Repository;

use gokp_cli::gitops::git::{commit_all, init_repository, push, PushAuth};
use gokp_cli::gitops::skeleton::{write_skeleton, SkeletonContext, APPLICATIONS_DIR};
use gokp_cli::gitops::{DeployKey, RepositoryHandle, DEFAULT_BRANCH, SEED_COMMIT_MESSAGE};
use gokp_cli::manifest::{split, ManifestSet};
use gokp_cli::orchestrator::EXPORT_COMMIT_MESSAGE;
use gokp_cli::workspace::{
    target_kubeconfig_name, ArtifactWorkspace, ARGOCD_INSTALL_DIR, ARGOCD_INSTALL_FILE,
    CAPI_INSTALL_DIR, CNI_DIR, CNI_FILE, INSTALL_CLUSTER_FILE, KIND_KUBECONFIG, RUN_FILE,
};
use gokp_cli::ErrorKind;

const CNI: &str = "\
---
# Source: calico/templates/calico-config.yaml
kind: ConfigMap
apiVersion: v1
metadata:
  name: calico-config
  namespace: kube-system
---
apiVersion: v1
kind: ServiceAccount
metadata:
  name: calico-node
  namespace: kube-system
";

fn handle(name: &str, workdir: &Path, remote: &Path) -> RepositoryHandle {
    RepositoryHandle {
        html_url: format!("https://github.com/octo/{}", name),
        clone_url: remote.display().to_string(),
        ssh_url: format!("git@github.com:octo/{}.git", name),
        owner: "octo".to_string(),
        name: name.to_string(),
        default_branch: DEFAULT_BRANCH.to_string(),
        private: true,
        local_path: workdir.join(name),
        deploy_key: DeployKey {
            private_key_path: workdir.join(format!("{}_deploy_key", name)),
            public_key: format!("ssh-ed25519 AAAA gokp-{}", name),
        },
    }
}

/// Story: the same render split twice produces byte-identical files
#[test]
fn split_output_is_reproducible() {
    let dir = tempfile::tempdir().unwrap();

    let first = split(CNI, "cni");
    let second = split(CNI, "cni");
    assert_eq!(first, second);

    let written = first.write_to(&dir.path().join(CNI_DIR)).unwrap();
    assert_eq!(written.len(), 2);

    let reread = ManifestSet::read_from(&dir.path().join(CNI_DIR)).unwrap();
    assert_eq!(reread, first);
}

/// Story: a seeded repository carries the skeleton and the export as two
/// commits on main
#[test]
fn seeded_repository_has_skeleton_then_export() {
    let dir = tempfile::tempdir().unwrap();
    let remote = dir.path().join("remote.git");
    Repository::init_bare(&remote).unwrap();

    let repo = handle("demo1", dir.path(), &remote);
    init_repository(&repo.local_path, &repo.clone_url).unwrap();

    write_skeleton(&repo.local_path, &SkeletonContext::new("demo1", &repo)).unwrap();
    commit_all(&repo.local_path, SEED_COMMIT_MESSAGE).unwrap();
    push(&repo.local_path, &PushAuth::None).unwrap();

    let capi = repo.local_path.join("cluster/capi");
    std::fs::create_dir_all(&capi).unwrap();
    std::fs::write(capi.join("00-cluster-demo1.yaml"), "kind: Cluster\n").unwrap();
    commit_all(&repo.local_path, EXPORT_COMMIT_MESSAGE).unwrap();
    push(&repo.local_path, &PushAuth::None).unwrap();

    let bare = Repository::open_bare(&remote).unwrap();
    let head = bare
        .find_reference("refs/heads/main")
        .unwrap()
        .peel_to_commit()
        .unwrap();
    assert_eq!(head.message(), Some(EXPORT_COMMIT_MESSAGE));
    assert_eq!(head.parent(0).unwrap().message(), Some(SEED_COMMIT_MESSAGE));

    let tree = head.tree().unwrap();
    assert!(tree.get_path(Path::new("cluster/capi/00-cluster-demo1.yaml")).is_ok());
    assert!(tree
        .get_path(&Path::new(APPLICATIONS_DIR).join("argocd.yaml"))
        .is_ok());
}

/// Story: a finished workspace becomes `~/.gokp/<cluster>` without scratch files
#[test]
fn promoted_archive_keeps_only_durable_artifacts() {
    let home = tempfile::tempdir().unwrap();
    let workspaces = ArtifactWorkspace::new(home.path().join(".gokp"));

    workspaces.preflight("demo1").unwrap();
    let dir = workspaces.acquire().unwrap();

    for file in [KIND_KUBECONFIG, INSTALL_CLUSTER_FILE, CNI_FILE, ARGOCD_INSTALL_FILE, RUN_FILE] {
        std::fs::write(dir.join(file), "x").unwrap();
    }
    for sub in [CAPI_INSTALL_DIR, CNI_DIR, ARGOCD_INSTALL_DIR, "demo1"] {
        std::fs::create_dir_all(dir.join(sub)).unwrap();
    }
    std::fs::write(dir.join(target_kubeconfig_name("demo1")), "x").unwrap();
    std::fs::write(dir.join("demo1_deploy_key"), "x").unwrap();

    let archive = workspaces.promote(&dir, "demo1").unwrap();

    assert_eq!(archive, home.path().join(".gokp/demo1"));
    assert!(!dir.exists());
    for kept in ["demo1.kubeconfig", "demo1", "demo1_deploy_key", RUN_FILE] {
        assert!(archive.join(kept).exists(), "{} should be kept", kept);
    }
    for pruned in [
        KIND_KUBECONFIG,
        INSTALL_CLUSTER_FILE,
        CNI_FILE,
        ARGOCD_INSTALL_FILE,
        CAPI_INSTALL_DIR,
        CNI_DIR,
        ARGOCD_INSTALL_DIR,
    ] {
        assert!(!archive.join(pruned).exists(), "{} should be pruned", pruned);
    }

    let err = workspaces.preflight("demo1").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
}
