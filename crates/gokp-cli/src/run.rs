//! Run context and its persisted state
//!
//! A [`WorkflowRun`] is created by the orchestrator once the workspace
//! exists and is passed by reference to every component. Its progress is
//! journaled to `gokp-run.json` inside the workspace before each step
//! starts, so a crashed run can be diagnosed with `gokp status`.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kube::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use gokp_common::kube_utils::create_client;
use gokp_common::{Error, ErrorKind, Result};
use gokp_move::{MoveError, PhaseRecorder, PivotPhase};

use crate::gitops::RepositoryHandle;
use crate::provision::{AwsCredentials, InfraSpec};
use crate::workspace::{target_kubeconfig_name, KIND_KUBECONFIG, RUN_FILE};

/// Which side of the pivot an endpoint is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndpointRole {
    /// The disposable kind cluster
    Bootstrap,
    /// The cluster being created
    Target,
}

/// A reachable cluster and the kubeconfig to reach it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterEndpoint {
    /// Bootstrap or target
    pub role: EndpointRole,
    /// Cluster name
    pub name: String,
    /// Kubeconfig inside the workspace
    pub kubeconfig: PathBuf,
}

impl ClusterEndpoint {
    /// The bootstrap cluster endpoint
    pub fn bootstrap(name: impl Into<String>, kubeconfig: impl Into<PathBuf>) -> Self {
        Self {
            role: EndpointRole::Bootstrap,
            name: name.into(),
            kubeconfig: kubeconfig.into(),
        }
    }

    /// The target cluster endpoint
    pub fn target(name: impl Into<String>, kubeconfig: impl Into<PathBuf>) -> Self {
        Self {
            role: EndpointRole::Target,
            name: name.into(),
            kubeconfig: kubeconfig.into(),
        }
    }

    /// Build a kube client from the endpoint's kubeconfig
    pub async fn client(&self) -> Result<Client> {
        create_client(&self.kubeconfig).await
    }
}

/// Workflow states in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum WorkflowState {
    /// Validating input and running pre-flight checks
    Init,
    /// Private workspace exists
    WorkspaceAcquired,
    /// Bootstrap cluster is running
    BootstrapUp,
    /// Target cluster is reachable with CNI installed
    TargetProvisioned,
    /// Remote repository and deploy key exist
    RepoCreated,
    /// Skeleton committed and pushed
    RepoSeeded,
    /// Cluster definition exported into the clone
    ClusterYamlExported,
    /// Exported definition pushed
    RepoPushed,
    /// Argo CD and its applications are installed on the target
    GitOpsInstalled,
    /// Target owns its Cluster API objects
    Pivoted,
    /// Bootstrap cluster destroyed
    BootstrapDown,
    /// Workspace renamed to the cluster archive
    ArtifactsPromoted,
    /// Finished
    Done,
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Why a run stopped
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbortRecord {
    /// Last state the run reached before the failure
    pub at: WorkflowState,
    /// Error category
    pub kind: ErrorKind,
    /// Full error message
    pub error: String,
}

/// Persisted view of a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunState {
    /// Cluster being created
    pub cluster_name: String,
    /// Last state reached
    pub state: WorkflowState,
    /// Pivot progress, once the pivot started
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pivot_phase: Option<PivotPhase>,
    /// Set when the run aborted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aborted: Option<AbortRecord>,
    /// Bootstrap endpoint, once up
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bootstrap: Option<ClusterEndpoint>,
    /// Target endpoint, once provisioned
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<ClusterEndpoint>,
    /// Repository, once created
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<RepositoryHandle>,
    /// Last write
    pub updated_at: DateTime<Utc>,
}

impl RunState {
    fn new(cluster_name: &str) -> Self {
        Self {
            cluster_name: cluster_name.to_string(),
            state: WorkflowState::Init,
            pivot_phase: None,
            aborted: None,
            bootstrap: None,
            target: None,
            repository: None,
            updated_at: Utc::now(),
        }
    }

    /// Load a run file, or the run file inside a workspace or archive
    pub fn load(path: &Path) -> Result<Self> {
        let file = if path.is_dir() {
            path.join(RUN_FILE)
        } else {
            path.to_path_buf()
        };
        let content = std::fs::read_to_string(&file)
            .map_err(|e| Error::resource(&file, format!("failed to read run state: {}", e)))?;
        serde_json::from_str(&content)
            .map_err(|e| Error::resource(&file, format!("invalid run state: {}", e)))
    }

    /// Whether authority has moved to the target cluster
    pub fn target_is_authoritative(&self) -> bool {
        self.pivot_phase.is_some_and(|p| p.source_touched())
    }

    /// The endpoint that currently owns the Cluster API objects
    pub fn authoritative(&self) -> Option<&ClusterEndpoint> {
        if self.target_is_authoritative() {
            self.target.as_ref()
        } else {
            self.bootstrap.as_ref()
        }
    }
}

/// Journal writing [`RunState`] to disk on every change
pub struct RunJournal {
    path: Mutex<PathBuf>,
    state: Mutex<RunState>,
}

impl RunJournal {
    fn new(path: PathBuf, cluster_name: &str) -> Self {
        Self {
            path: Mutex::new(path),
            state: Mutex::new(RunState::new(cluster_name)),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, RunState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_path(&self) -> MutexGuard<'_, PathBuf> {
        self.path.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Snapshot of the current state
    pub fn snapshot(&self) -> RunState {
        self.lock_state().clone()
    }

    /// Where the journal is written
    pub fn path(&self) -> PathBuf {
        self.lock_path().clone()
    }

    /// Apply `change` and persist the result
    pub fn update(&self, change: impl FnOnce(&mut RunState)) -> Result<()> {
        let snapshot = {
            let mut state = self.lock_state();
            change(&mut state);
            state.updated_at = Utc::now();
            state.clone()
        };
        self.write(&snapshot)
    }

    /// Follow the workspace after it has been renamed
    pub fn relocate(&self, dir: &Path) {
        *self.lock_path() = dir.join(RUN_FILE);
    }

    fn write(&self, state: &RunState) -> Result<()> {
        let path = self.path();
        let json = serde_json::to_string_pretty(state)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)
            .map_err(|e| Error::resource(&tmp, format!("failed to write run state: {}", e)))?;
        std::fs::rename(&tmp, &path)
            .map_err(|e| Error::resource(&path, format!("failed to write run state: {}", e)))?;
        debug!(state = %state.state, path = %path.display(), "Persisted run state");
        Ok(())
    }
}

#[async_trait]
impl PhaseRecorder for RunJournal {
    async fn record(&self, phase: PivotPhase) -> std::result::Result<(), MoveError> {
        self.update(|state| state.pivot_phase = Some(phase))
            .map_err(|e| MoveError::PhaseRecord(e.to_string()))
    }
}

/// User input for a run
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Cluster name, also the repository name
    pub cluster_name: String,
    /// Create the repository as private
    pub private_repo: bool,
    /// AWS credentials
    pub credentials: AwsCredentials,
    /// Cluster shape
    pub infra: InfraSpec,
}

/// Context of one installation, owned by the orchestrator
pub struct WorkflowRun {
    /// Cluster name
    pub cluster_name: String,
    /// Private scratch directory
    pub workspace: PathBuf,
    /// Final archive location
    pub archive: PathBuf,
    /// Create the repository as private
    pub private_repo: bool,
    /// AWS credentials
    pub credentials: AwsCredentials,
    /// Cluster shape
    pub infra: InfraSpec,
    journal: RunJournal,
}

impl WorkflowRun {
    /// Create a run inside an acquired workspace
    pub fn new(config: RunConfig, workspace: PathBuf, archive: PathBuf) -> Self {
        let journal = RunJournal::new(workspace.join(RUN_FILE), &config.cluster_name);
        Self {
            cluster_name: config.cluster_name,
            workspace,
            archive,
            private_repo: config.private_repo,
            credentials: config.credentials,
            infra: config.infra,
            journal,
        }
    }

    /// The run journal, also the pivot's phase recorder
    pub fn journal(&self) -> &RunJournal {
        &self.journal
    }

    /// Last state reached
    pub fn state(&self) -> WorkflowState {
        self.journal.snapshot().state
    }

    /// Record reaching `state`
    pub fn transition(&self, state: WorkflowState) -> Result<()> {
        self.journal.update(|s| s.state = state)
    }

    /// Record the failure that ends the run
    pub fn abort(&self, error: &Error) -> Result<()> {
        self.journal.update(|s| {
            s.aborted = Some(AbortRecord {
                at: s.state,
                kind: error.kind(),
                error: error.to_string(),
            })
        })
    }

    /// Whether the pivot has started deleting from the bootstrap cluster
    pub fn source_touched(&self) -> bool {
        self.journal.snapshot().target_is_authoritative()
    }

    /// Kubeconfig of the bootstrap cluster
    pub fn kind_kubeconfig(&self) -> PathBuf {
        self.workspace.join(KIND_KUBECONFIG)
    }

    /// Kubeconfig of the target cluster
    pub fn target_kubeconfig(&self) -> PathBuf {
        self.workspace.join(target_kubeconfig_name(&self.cluster_name))
    }

}

/// Validate a cluster name as a DNS-1123 label
pub fn validate_cluster_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 63 {
        return Err(Error::validation(format!(
            "cluster name '{}' must be 1-63 characters",
            name
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(Error::validation(format!(
            "cluster name '{}' may only contain lowercase letters, digits and '-'",
            name
        )));
    }
    if name.starts_with('-') || name.ends_with('-') {
        return Err(Error::validation(format!(
            "cluster name '{}' must start and end with a letter or digit",
            name
        )));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::time::Duration;

    pub(crate) fn test_config(name: &str) -> RunConfig {
        RunConfig {
            cluster_name: name.to_string(),
            private_repo: true,
            credentials: AwsCredentials {
                region: "us-east-1".to_string(),
                access_key_id: "AKIATEST".to_string(),
                secret_access_key: "secret".to_string(),
                ssh_key_name: "default".to_string(),
            },
            infra: InfraSpec {
                kubernetes_version: "v1.28.3".to_string(),
                control_plane_machine: "m4.xlarge".to_string(),
                node_machine: "m4.xlarge".to_string(),
                ha: true,
                skip_cloud_formation: false,
                provision_timeout: Duration::from_secs(2400),
            },
        }
    }

    #[test]
    fn cluster_names_are_dns_labels() {
        validate_cluster_name("demo1").unwrap();
        validate_cluster_name("a").unwrap();
        validate_cluster_name(&"a".repeat(63)).unwrap();

        let long = "a".repeat(64);
        for bad in ["", "Demo", "-demo", "demo-", "de_mo", "de.mo", long.as_str()] {
            let err = validate_cluster_name(bad).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Validation, "{}", bad);
        }
    }

    #[test]
    fn states_are_ordered_by_execution() {
        use WorkflowState::*;
        let order = [
            Init,
            WorkspaceAcquired,
            BootstrapUp,
            TargetProvisioned,
            RepoCreated,
            RepoSeeded,
            ClusterYamlExported,
            RepoPushed,
            GitOpsInstalled,
            Pivoted,
            BootstrapDown,
            ArtifactsPromoted,
            Done,
        ];
        assert!(order.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn transitions_are_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let run = WorkflowRun::new(
            test_config("demo1"),
            dir.path().to_path_buf(),
            dir.path().join("archive"),
        );

        run.transition(WorkflowState::WorkspaceAcquired).unwrap();
        run.transition(WorkflowState::BootstrapUp).unwrap();

        let loaded = RunState::load(dir.path()).unwrap();
        assert_eq!(loaded.cluster_name, "demo1");
        assert_eq!(loaded.state, WorkflowState::BootstrapUp);
        assert!(loaded.aborted.is_none());
        assert!(!dir.path().join("gokp-run.json.tmp").exists());
    }

    #[test]
    fn abort_records_state_and_kind() {
        let dir = tempfile::tempdir().unwrap();
        let run = WorkflowRun::new(
            test_config("demo1"),
            dir.path().to_path_buf(),
            dir.path().join("archive"),
        );
        run.transition(WorkflowState::TargetProvisioned).unwrap();

        run.abort(&Error::conflict("repository demo1", "name already exists"))
            .unwrap();

        let loaded = RunState::load(&dir.path().join(RUN_FILE)).unwrap();
        let aborted = loaded.aborted.unwrap();
        assert_eq!(aborted.at, WorkflowState::TargetProvisioned);
        assert_eq!(aborted.kind, ErrorKind::Conflict);
        assert!(aborted.error.contains("demo1"));
    }

    #[tokio::test]
    async fn pivot_phases_move_authority() {
        let dir = tempfile::tempdir().unwrap();
        let run = WorkflowRun::new(
            test_config("demo1"),
            dir.path().to_path_buf(),
            dir.path().join("archive"),
        );
        let bootstrap = ClusterEndpoint::bootstrap("gokp-bootstrapper", run.kind_kubeconfig());
        let target = ClusterEndpoint::target("demo1", run.target_kubeconfig());
        run.journal()
            .update(|s| {
                s.bootstrap = Some(bootstrap.clone());
                s.target = Some(target.clone());
            })
            .unwrap();

        run.journal().record(PivotPhase::DualExistence).await.unwrap();
        assert_eq!(run.journal().snapshot().authoritative(), Some(&bootstrap));
        assert!(!run.source_touched());

        run.journal().record(PivotPhase::SourceClearing).await.unwrap();
        assert_eq!(run.journal().snapshot().authoritative(), Some(&target));
        assert!(run.source_touched());

        let loaded = RunState::load(dir.path()).unwrap();
        assert_eq!(loaded.pivot_phase, Some(PivotPhase::SourceClearing));
    }

    #[test]
    fn relocated_journal_writes_into_archive() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = dir.path().join("ws");
        let archive = dir.path().join("demo1");
        std::fs::create_dir_all(&workspace).unwrap();

        let run = WorkflowRun::new(test_config("demo1"), workspace.clone(), archive.clone());
        run.transition(WorkflowState::BootstrapDown).unwrap();

        std::fs::rename(&workspace, &archive).unwrap();
        run.journal().relocate(&archive);
        run.transition(WorkflowState::ArtifactsPromoted).unwrap();

        assert_eq!(
            RunState::load(&archive).unwrap().state,
            WorkflowState::ArtifactsPromoted
        );
    }

    #[test]
    fn loading_garbage_is_a_resource_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(RUN_FILE), "not json").unwrap();
        let err = RunState::load(dir.path()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Resource);
    }

    #[test]
    fn workspace_paths_follow_layout() {
        let run = WorkflowRun::new(
            test_config("demo1"),
            PathBuf::from("/w"),
            PathBuf::from("/a"),
        );
        assert_eq!(run.kind_kubeconfig(), PathBuf::from("/w/kind.kubeconfig"));
        assert_eq!(run.target_kubeconfig(), PathBuf::from("/w/demo1.kubeconfig"));
    }
}
