//! Installation state machine
//!
//! Drives one run from pre-flight checks to the promoted archive. Every
//! state is journaled before the next step starts. The first failure ends
//! the run: nothing is retried or rolled back, and the bootstrap cluster is
//! only destroyed once the target owns its Cluster API objects.

use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use gokp_common::{Error, ErrorKind, Result};

use crate::bootstrap::{BootstrapCluster, BOOTSTRAP_CLUSTER_NAME};
use crate::gitops::GitOpsPublisher;
use crate::pivot::PivotController;
use crate::process::warn_missing_tools;
use crate::provision::Provisioner;
use crate::run::{validate_cluster_name, RunConfig, WorkflowRun, WorkflowState};
use crate::workspace::ArtifactWorkspace;

/// Commit message of the exported cluster definition
pub const EXPORT_COMMIT_MESSAGE: &str = "exporting existing YAML";

/// Runs installations against a set of component implementations
pub struct Orchestrator {
    workspace: ArtifactWorkspace,
    bootstrap: Arc<dyn BootstrapCluster>,
    provisioner: Arc<dyn Provisioner>,
    publisher: Arc<dyn GitOpsPublisher>,
    pivot: Arc<dyn PivotController>,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        workspace: ArtifactWorkspace,
        bootstrap: Arc<dyn BootstrapCluster>,
        provisioner: Arc<dyn Provisioner>,
        publisher: Arc<dyn GitOpsPublisher>,
        pivot: Arc<dyn PivotController>,
    ) -> Self {
        Self {
            workspace,
            bootstrap,
            provisioner,
            publisher,
            pivot,
            cancel: CancellationToken::new(),
        }
    }

    /// Stop the run at the next safe point once `token` is cancelled
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Install one cluster and return its archive directory
    pub async fn run(&self, config: RunConfig) -> Result<PathBuf> {
        validate_cluster_name(&config.cluster_name)?;
        warn_missing_tools();
        self.workspace.preflight(&config.cluster_name)?;

        let dir = self.workspace.acquire()?;
        let archive = self.workspace.archive_path(&config.cluster_name);
        let run = WorkflowRun::new(config, dir, archive);

        match self.execute(&run).await {
            Ok(archive) => Ok(archive),
            Err(e) => Err(self.abort(&run, e)),
        }
    }

    async fn execute(&self, run: &WorkflowRun) -> Result<PathBuf> {
        let name = run.cluster_name.as_str();
        run.transition(WorkflowState::WorkspaceAcquired)?;

        self.checkpoint(run)?;
        info!("[Phase 1] Creating bootstrap cluster...");
        let bootstrap = self
            .bootstrap
            .create(BOOTSTRAP_CLUSTER_NAME, &run.kind_kubeconfig())
            .await?;
        run.journal().update(|s| {
            s.bootstrap = Some(bootstrap.clone());
            s.state = WorkflowState::BootstrapUp;
        })?;

        self.checkpoint(run)?;
        info!("[Phase 2] Provisioning cluster {}...", name);
        let target = self
            .provisioner
            .provision(&bootstrap, &run.infra, run, &self.cancel)
            .await?;
        run.journal().update(|s| {
            s.target = Some(target.clone());
            s.state = WorkflowState::TargetProvisioned;
        })?;

        self.checkpoint(run)?;
        info!("[Phase 3] Creating GitOps repository...");
        let repo = self
            .publisher
            .create_repository(name, run.private_repo, &run.workspace)
            .await?;
        run.journal().update(|s| {
            s.repository = Some(repo.clone());
            s.state = WorkflowState::RepoCreated;
        })?;

        self.checkpoint(run)?;
        info!("[Phase 4] Seeding repository...");
        self.publisher.seed(&repo, name).await?;
        run.transition(WorkflowState::RepoSeeded)?;

        self.checkpoint(run)?;
        info!("[Phase 5] Exporting cluster definition...");
        self.pivot
            .export_definitions(&bootstrap, name, &repo.local_path)
            .await?;
        run.transition(WorkflowState::ClusterYamlExported)?;

        self.checkpoint(run)?;
        info!("[Phase 6] Pushing cluster definition...");
        self.publisher.publish(&repo, EXPORT_COMMIT_MESSAGE).await?;
        run.transition(WorkflowState::RepoPushed)?;

        self.checkpoint(run)?;
        info!("[Phase 7] Installing Argo CD...");
        self.publisher
            .install_controller(&target, &repo, &run.workspace)
            .await?;
        run.transition(WorkflowState::GitOpsInstalled)?;

        self.checkpoint(run)?;
        info!("[Phase 8] Pivoting Cluster API objects to {}...", name);
        self.provisioner.prepare_management(&target, run).await?;
        self.pivot
            .move_pivot_objects(&bootstrap, &target, name, run.journal(), &self.cancel)
            .await?;
        run.transition(WorkflowState::Pivoted)?;
        self.publisher.sync_cluster_definition(&target, &repo).await?;

        info!("[Phase 9] Deleting bootstrap cluster...");
        self.bootstrap.destroy(BOOTSTRAP_CLUSTER_NAME).await?;
        run.transition(WorkflowState::BootstrapDown)?;

        info!("[Phase 10] Moving assets to {}...", run.archive.display());
        let archive = self.workspace.promote(&run.workspace, name)?;
        run.journal().relocate(&archive);
        run.transition(WorkflowState::ArtifactsPromoted)?;
        run.transition(WorkflowState::Done)?;

        Ok(archive)
    }

    /// Cancellation is honoured only while the bootstrap cluster still owns
    /// every Cluster API object
    fn checkpoint(&self, run: &WorkflowRun) -> Result<()> {
        if self.cancel.is_cancelled() && !run.source_touched() {
            return Err(Error::cancelled(run.state().to_string()));
        }
        Ok(())
    }

    fn abort(&self, run: &WorkflowRun, err: Error) -> Error {
        let at = run.state();
        let err = if at >= WorkflowState::Pivoted && err.kind() != ErrorKind::Inconsistency {
            Error::inconsistency(&run.cluster_name, err.to_string())
        } else {
            err
        };

        if let Err(e) = run.abort(&err) {
            warn!(error = %e, "Failed to record abort");
        }

        // A written kind kubeconfig means a bootstrap cluster may still be running
        if at < WorkflowState::BootstrapUp && !run.kind_kubeconfig().exists() {
            ArtifactWorkspace::release(&run.workspace);
        } else {
            error!(
                state = %at,
                kind = %err.kind(),
                workspace = %run.workspace.display(),
                "Run aborted; artifacts kept for inspection"
            );
        }
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    use gokp_move::{MoveResult, PivotPhase};

    use crate::bootstrap::MockBootstrapCluster;
    use crate::gitops::{DeployKey, MockGitOpsPublisher, RepositoryHandle, DEFAULT_BRANCH};
    use crate::pivot::{MockPivotController, CAPI_EXPORT_DIR};
    use crate::provision::MockProvisioner;
    use crate::run::tests::test_config;
    use crate::run::{ClusterEndpoint, RunState};
    use crate::workspace::{
        ARGOCD_INSTALL_DIR, CAPI_INSTALL_DIR, INSTALL_CLUSTER_FILE, KIND_KUBECONFIG,
        WORKSPACE_PREFIX,
    };

    struct Mocks {
        bootstrap: MockBootstrapCluster,
        provisioner: MockProvisioner,
        publisher: MockGitOpsPublisher,
        pivot: MockPivotController,
    }

    impl Mocks {
        fn new() -> Self {
            Self {
                bootstrap: MockBootstrapCluster::new(),
                provisioner: MockProvisioner::new(),
                publisher: MockGitOpsPublisher::new(),
                pivot: MockPivotController::new(),
            }
        }

        fn into_orchestrator(self, root: &Path) -> Orchestrator {
            Orchestrator::new(
                ArtifactWorkspace::new(root),
                Arc::new(self.bootstrap),
                Arc::new(self.provisioner),
                Arc::new(self.publisher),
                Arc::new(self.pivot),
            )
        }
    }

    fn handle(name: &str, workdir: &Path) -> RepositoryHandle {
        RepositoryHandle {
            html_url: format!("https://github.com/octo/{}", name),
            clone_url: format!("https://github.com/octo/{}.git", name),
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

    fn workspaces(root: &Path) -> Vec<PathBuf> {
        match std::fs::read_dir(root) {
            Ok(entries) => entries
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| {
                    p.file_name()
                        .is_some_and(|n| n.to_string_lossy().starts_with(WORKSPACE_PREFIX))
                })
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Bootstrap and provisioning succeed and leave their files behind
    fn expect_cluster_up(mocks: &mut Mocks) {
        mocks.bootstrap.expect_create().times(1).returning(|name, kubeconfig| {
            std::fs::write(kubeconfig, "apiVersion: v1\nkind: Config\n").unwrap();
            Ok(ClusterEndpoint::bootstrap(name, kubeconfig))
        });
        mocks
            .provisioner
            .expect_provision()
            .times(1)
            .returning(|_, _, run, _| {
                std::fs::write(run.workspace.join(INSTALL_CLUSTER_FILE), "kind: Cluster\n").unwrap();
                std::fs::create_dir_all(run.workspace.join(CAPI_INSTALL_DIR)).unwrap();
                std::fs::write(run.target_kubeconfig(), "apiVersion: v1\nkind: Config\n").unwrap();
                Ok(ClusterEndpoint::target(run.cluster_name.clone(), run.target_kubeconfig()))
            });
    }

    #[tokio::test]
    async fn happy_path_promotes_and_prunes() {
        let home = tempfile::tempdir().unwrap();
        let root = home.path().join(".gokp");
        let mut mocks = Mocks::new();
        expect_cluster_up(&mut mocks);

        mocks
            .publisher
            .expect_create_repository()
            .times(1)
            .returning(|name, private, workdir| {
                assert!(private);
                let repo = handle(name, workdir);
                std::fs::create_dir_all(&repo.local_path).unwrap();
                Ok(repo)
            });
        mocks
            .publisher
            .expect_seed()
            .times(1)
            .returning(|_, _| Ok(()));
        mocks
            .pivot
            .expect_export_definitions()
            .times(1)
            .returning(|_, _, repo_dir| {
                let dir = repo_dir.join(CAPI_EXPORT_DIR);
                std::fs::create_dir_all(&dir).unwrap();
                std::fs::write(dir.join("00-cluster-demo1.yaml"), "kind: Cluster\n").unwrap();
                Ok(())
            });
        mocks
            .publisher
            .expect_publish()
            .withf(|_, message| message == EXPORT_COMMIT_MESSAGE)
            .times(1)
            .returning(|_, _| Ok(()));
        mocks
            .publisher
            .expect_install_controller()
            .times(1)
            .returning(|_, _, workdir| {
                std::fs::create_dir_all(workdir.join(ARGOCD_INSTALL_DIR)).unwrap();
                Ok(())
            });
        mocks
            .provisioner
            .expect_prepare_management()
            .times(1)
            .returning(|_, _| Ok(()));
        mocks
            .pivot
            .expect_move_pivot_objects()
            .times(1)
            .returning(|source, dest, _, recorder, _| {
                assert_eq!(source.name, BOOTSTRAP_CLUSTER_NAME);
                assert_eq!(dest.name, "demo1");
                recorder
                    .update(|s| s.pivot_phase = Some(PivotPhase::SourceCleared))
                    .unwrap();
                Ok(MoveResult {
                    move_id: "test".to_string(),
                    objects_moved: 12,
                    objects_deleted: 12,
                })
            });
        mocks
            .publisher
            .expect_sync_cluster_definition()
            .withf(|target, repo| target.name == "demo1" && repo.name == "demo1")
            .times(1)
            .returning(|_, _| Ok(()));
        mocks
            .bootstrap
            .expect_destroy()
            .withf(|name| name == BOOTSTRAP_CLUSTER_NAME)
            .times(1)
            .returning(|_| Ok(()));

        let orchestrator = mocks.into_orchestrator(&root);
        let archive = orchestrator.run(test_config("demo1")).await.unwrap();

        assert_eq!(archive, root.join("demo1"));
        assert!(archive.join("demo1.kubeconfig").is_file());
        assert!(archive.join("demo1").join(CAPI_EXPORT_DIR).is_dir());
        assert!(!archive.join(KIND_KUBECONFIG).exists());
        assert!(!archive.join(INSTALL_CLUSTER_FILE).exists());
        assert!(!archive.join(CAPI_INSTALL_DIR).exists());
        assert!(!archive.join(ARGOCD_INSTALL_DIR).exists());
        assert!(workspaces(&root).is_empty());

        let state = RunState::load(&archive).unwrap();
        assert_eq!(state.state, WorkflowState::Done);
        assert!(state.aborted.is_none());
        assert!(state.target_is_authoritative());
        assert_eq!(state.repository.unwrap().name, "demo1");
    }

    #[tokio::test]
    async fn repository_conflict_keeps_bootstrap_and_workspace() {
        let home = tempfile::tempdir().unwrap();
        let root = home.path().join(".gokp");
        let mut mocks = Mocks::new();
        expect_cluster_up(&mut mocks);

        mocks
            .publisher
            .expect_create_repository()
            .times(1)
            .returning(|name, _, _| {
                Err(Error::conflict(format!("repository {}", name), "name already exists"))
            });
        mocks.publisher.expect_seed().never();
        mocks.publisher.expect_install_controller().never();
        mocks.pivot.expect_move_pivot_objects().never();
        mocks.bootstrap.expect_destroy().never();

        let orchestrator = mocks.into_orchestrator(&root);
        let err = orchestrator.run(test_config("demo1")).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert!(!root.join("demo1").exists());

        let kept = workspaces(&root);
        assert_eq!(kept.len(), 1);
        let state = RunState::load(&kept[0]).unwrap();
        let aborted = state.aborted.unwrap();
        assert_eq!(aborted.at, WorkflowState::TargetProvisioned);
        assert_eq!(aborted.kind, ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn existing_archive_fails_before_side_effects() {
        let home = tempfile::tempdir().unwrap();
        let root = home.path().join(".gokp");
        std::fs::create_dir_all(root.join("demo1")).unwrap();

        let mut mocks = Mocks::new();
        mocks.bootstrap.expect_create().never();

        let orchestrator = mocks.into_orchestrator(&root);
        let err = orchestrator.run(test_config("demo1")).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert!(workspaces(&root).is_empty());
    }

    #[tokio::test]
    async fn bootstrap_failure_releases_workspace() {
        let home = tempfile::tempdir().unwrap();
        let root = home.path().join(".gokp");
        let mut mocks = Mocks::new();
        mocks
            .bootstrap
            .expect_create()
            .times(1)
            .returning(|_, _| Err(Error::infrastructure("docker", "container runtime unavailable")));
        mocks.provisioner.expect_provision().never();

        let orchestrator = mocks.into_orchestrator(&root);
        let err = orchestrator.run(test_config("demo1")).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Infrastructure);
        assert!(workspaces(&root).is_empty());
    }

    #[tokio::test]
    async fn half_created_bootstrap_keeps_its_kubeconfig() {
        let home = tempfile::tempdir().unwrap();
        let root = home.path().join(".gokp");
        let mut mocks = Mocks::new();
        mocks
            .bootstrap
            .expect_create()
            .times(1)
            .returning(|_, kubeconfig| {
                std::fs::write(kubeconfig, "apiVersion: v1\nkind: Config\n").unwrap();
                Err(Error::timeout(
                    "bootstrap nodes to become Ready",
                    std::time::Duration::from_secs(120),
                ))
            });
        mocks.provisioner.expect_provision().never();

        let orchestrator = mocks.into_orchestrator(&root);
        let err = orchestrator.run(test_config("demo1")).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Timeout);
        let kept = workspaces(&root);
        assert_eq!(kept.len(), 1);
        assert!(kept[0].join(KIND_KUBECONFIG).is_file());
        let state = RunState::load(&kept[0]).unwrap();
        assert_eq!(state.aborted.unwrap().at, WorkflowState::WorkspaceAcquired);
    }

    #[tokio::test]
    async fn failure_after_pivot_is_an_inconsistency() {
        let home = tempfile::tempdir().unwrap();
        let root = home.path().join(".gokp");
        let mut mocks = Mocks::new();
        expect_cluster_up(&mut mocks);

        mocks
            .publisher
            .expect_create_repository()
            .returning(|name, _, workdir| Ok(handle(name, workdir)));
        mocks.publisher.expect_seed().returning(|_, _| Ok(()));
        mocks.publisher.expect_publish().returning(|_, _| Ok(()));
        mocks
            .publisher
            .expect_install_controller()
            .returning(|_, _, _| Ok(()));
        mocks
            .pivot
            .expect_export_definitions()
            .returning(|_, _, _| Ok(()));
        mocks
            .provisioner
            .expect_prepare_management()
            .returning(|_, _| Ok(()));
        mocks
            .pivot
            .expect_move_pivot_objects()
            .returning(|_, _, _, recorder, _| {
                recorder
                    .update(|s| s.pivot_phase = Some(PivotPhase::SourceCleared))
                    .unwrap();
                Ok(MoveResult {
                    move_id: "test".to_string(),
                    objects_moved: 3,
                    objects_deleted: 3,
                })
            });
        mocks
            .publisher
            .expect_sync_cluster_definition()
            .returning(|_, _| Ok(()));
        mocks
            .bootstrap
            .expect_destroy()
            .times(1)
            .returning(|_| Err(Error::infrastructure("kind", "kind delete cluster failed")));

        let orchestrator = mocks.into_orchestrator(&root);
        let err = orchestrator.run(test_config("demo1")).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Inconsistency);
        assert!(err.to_string().contains("kind delete cluster failed"));

        let kept = workspaces(&root);
        assert_eq!(kept.len(), 1);
        let state = RunState::load(&kept[0]).unwrap();
        assert_eq!(state.aborted.unwrap().at, WorkflowState::Pivoted);
    }

    #[tokio::test]
    async fn pivot_failure_keeps_its_category() {
        let home = tempfile::tempdir().unwrap();
        let root = home.path().join(".gokp");
        let mut mocks = Mocks::new();
        expect_cluster_up(&mut mocks);

        mocks
            .publisher
            .expect_create_repository()
            .returning(|name, _, workdir| Ok(handle(name, workdir)));
        mocks.publisher.expect_seed().returning(|_, _| Ok(()));
        mocks.publisher.expect_publish().returning(|_, _| Ok(()));
        mocks
            .publisher
            .expect_install_controller()
            .returning(|_, _, _| Ok(()));
        mocks
            .pivot
            .expect_export_definitions()
            .returning(|_, _, _| Ok(()));
        mocks
            .provisioner
            .expect_prepare_management()
            .returning(|_, _| Ok(()));
        mocks
            .pivot
            .expect_move_pivot_objects()
            .returning(|_, _, cluster, _, _| Err(Error::pivot(cluster, "create failed")));
        mocks.publisher.expect_sync_cluster_definition().never();
        mocks.bootstrap.expect_destroy().never();

        let orchestrator = mocks.into_orchestrator(&root);
        let err = orchestrator.run(test_config("demo1")).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Pivot);
        assert_eq!(workspaces(&root).len(), 1);
    }

    #[tokio::test]
    async fn invalid_name_is_rejected() {
        let home = tempfile::tempdir().unwrap();
        let root = home.path().join(".gokp");

        let orchestrator = Mocks::new().into_orchestrator(&root);
        let err = orchestrator.run(test_config("Demo_1")).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(!root.exists());
    }

    #[tokio::test]
    async fn cancelled_run_stops_before_bootstrap() {
        let home = tempfile::tempdir().unwrap();
        let root = home.path().join(".gokp");
        let mut mocks = Mocks::new();
        mocks.bootstrap.expect_create().never();

        let token = CancellationToken::new();
        token.cancel();
        let orchestrator = mocks.into_orchestrator(&root).with_cancellation(token);
        let err = orchestrator.run(test_config("demo1")).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert!(workspaces(&root).is_empty());
    }

    #[tokio::test]
    async fn cancellation_after_provisioning_keeps_workspace() {
        let home = tempfile::tempdir().unwrap();
        let root = home.path().join(".gokp");
        let token = CancellationToken::new();
        let mut mocks = Mocks::new();

        mocks
            .bootstrap
            .expect_create()
            .returning(|name, kubeconfig| Ok(ClusterEndpoint::bootstrap(name, kubeconfig)));
        let cancel = token.clone();
        mocks
            .provisioner
            .expect_provision()
            .returning(move |_, _, run, _| {
                cancel.cancel();
                Ok(ClusterEndpoint::target(run.cluster_name.clone(), run.target_kubeconfig()))
            });
        mocks.publisher.expect_create_repository().never();
        mocks.bootstrap.expect_destroy().never();

        let orchestrator = mocks.into_orchestrator(&root).with_cancellation(token);
        let err = orchestrator.run(test_config("demo1")).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Cancelled);
        let kept = workspaces(&root);
        assert_eq!(kept.len(), 1);
        assert_eq!(
            RunState::load(&kept[0]).unwrap().aborted.unwrap().at,
            WorkflowState::TargetProvisioned
        );
    }
}
