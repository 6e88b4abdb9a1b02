//! Pivot orchestration between two locally reachable clusters
//!
//! Pauses the source, copies the cluster's object graph to the destination in
//! ownership order, waits for the destination controllers to adopt it, then
//! clears the source. Until the destination is confirmed the source stays
//! authoritative and every failure is rolled back to that state.

use std::collections::HashSet;
use std::time::Duration;

use kube::Client;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use gokp_common::kube_utils::wait_with_timeout;
use gokp_common::ErrorKind;

use crate::api::{KubeMoveApi, MoveClusterApi};
use crate::error::MoveError;
use crate::graph::{GraphNode, ObjectGraph};
use crate::phase::{PhaseRecorder, PivotPhase};
use crate::sequence::{extract_nodes_for_group, MoveSequence};
use crate::target::TargetWriter;

/// Configuration for a cluster move
#[derive(Debug, Clone)]
pub struct MoverConfig {
    /// Namespace holding the cluster's objects (same on both sides)
    pub namespace: String,
    /// Cluster to move
    pub cluster_name: String,
    /// Move operation ID, for log correlation
    pub move_id: String,
    /// How long the destination controllers get to report the captured status
    pub confirm_timeout: Duration,
    /// Interval between adoption checks
    pub poll_interval: Duration,
}

impl MoverConfig {
    /// Create a new config
    pub fn new(namespace: &str, cluster_name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            cluster_name: cluster_name.to_string(),
            move_id: uuid::Uuid::new_v4().to_string(),
            confirm_timeout: Duration::from_secs(600),
            poll_interval: Duration::from_secs(10),
        }
    }

    /// Override the adoption timeout
    pub fn with_confirm_timeout(mut self, timeout: Duration) -> Self {
        self.confirm_timeout = timeout;
        self
    }
}

/// Result of a move operation
#[derive(Debug, Clone)]
pub struct MoveResult {
    /// Move operation ID
    pub move_id: String,
    /// Number of objects created (or adopted) on the destination
    pub objects_moved: u32,
    /// Number of objects deleted from the source
    pub objects_deleted: u32,
}

/// Readiness-relevant status of a Cluster, captured on the source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterStatusSnapshot {
    /// Cluster name
    pub name: String,
    /// `status.phase`
    pub phase: Option<String>,
    /// `status.controlPlaneReady`
    pub control_plane_ready: bool,
    /// `status.infrastructureReady`
    pub infrastructure_ready: bool,
}

impl ClusterStatusSnapshot {
    /// Capture from a Cluster object. Returns `None` without a name.
    pub fn from_object(obj: &Value) -> Option<Self> {
        let name = obj.pointer("/metadata/name")?.as_str()?.to_string();
        let status = obj.get("status");
        let flag = |field: &str| {
            status
                .and_then(|s| s.get(field))
                .and_then(Value::as_bool)
                .unwrap_or(false)
        };

        Some(Self {
            name,
            phase: status
                .and_then(|s| s.get("phase"))
                .and_then(Value::as_str)
                .map(String::from),
            control_plane_ready: flag("controlPlaneReady"),
            infrastructure_ready: flag("infrastructureReady"),
        })
    }

    /// Whether `observed` reports the same phase and readiness
    pub fn matches(&self, observed: &Value) -> bool {
        Self::from_object(observed).is_some_and(|o| o == *self)
    }
}

/// Moves one cluster's lifecycle objects from `source` to `dest`
pub struct ClusterMover {
    source: Box<dyn MoveClusterApi>,
    dest: Box<dyn MoveClusterApi>,
    config: MoverConfig,
}

impl ClusterMover {
    /// Create a new ClusterMover between two API servers
    pub fn new(source: Client, dest: Client, config: MoverConfig) -> Self {
        Self::with_apis(
            Box::new(KubeMoveApi::new(source)),
            Box::new(KubeMoveApi::new(dest)),
            config,
        )
    }

    /// Create a ClusterMover over arbitrary cluster access
    pub fn with_apis(
        source: Box<dyn MoveClusterApi>,
        dest: Box<dyn MoveClusterApi>,
        config: MoverConfig,
    ) -> Self {
        Self {
            source,
            dest,
            config,
        }
    }

    /// Execute the full move.
    ///
    /// Each [`PivotPhase`] is recorded before its side effects begin. A failure
    /// before `SourceClearing` re-pauses the destination and unpauses the
    /// source. Cancellation is honoured up to that point and ignored after.
    pub async fn execute(
        &self,
        recorder: &dyn PhaseRecorder,
        cancel: &CancellationToken,
    ) -> Result<MoveResult, MoveError> {
        info!(
            move_id = %self.config.move_id,
            cluster = %self.config.cluster_name,
            namespace = %self.config.namespace,
            "Starting cluster move"
        );

        recorder.record(PivotPhase::Paused).await?;

        let (graph, sequence, moved) = match self.transfer(recorder, cancel).await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "Move failed before source cleanup, rolling back");
                self.rollback().await;
                return Err(e);
            }
        };

        let deleted = self.delete_source(&graph, &sequence).await?;

        if let Err(e) = recorder.record(PivotPhase::SourceCleared).await {
            warn!(error = %e, "Source cleared but the phase could not be recorded");
        }

        let result = MoveResult {
            move_id: self.config.move_id.clone(),
            objects_moved: moved,
            objects_deleted: deleted,
        };

        info!(
            move_id = %result.move_id,
            moved = result.objects_moved,
            deleted = result.objects_deleted,
            "Cluster move complete"
        );

        Ok(result)
    }

    /// Everything between pausing the source and deleting from it
    async fn transfer(
        &self,
        recorder: &dyn PhaseRecorder,
        cancel: &CancellationToken,
    ) -> Result<(ObjectGraph, MoveSequence, u32), MoveError> {
        // Paused before discovery so the captured objects carry paused=true
        self.source.set_paused(&self.config.namespace, true).await?;

        let mut graph = self.source.discover(&self.config.namespace).await?;
        if !graph.filter_by_cluster(&self.config.cluster_name) || graph.is_empty() {
            return Err(MoveError::Discovery(format!(
                "no objects to move for cluster {}",
                self.config.cluster_name
            )));
        }

        let sequence = MoveSequence::from_graph(&graph)?;
        let snapshots = capture_cluster_status(&graph);

        check_cancel(cancel)?;
        recorder.record(PivotPhase::DualExistence).await?;

        let moved = self.create_on_dest(&graph, &sequence, cancel).await?;

        self.dest.set_paused(&self.config.namespace, false).await?;
        self.confirm_adoption(&graph, &snapshots, cancel).await?;

        check_cancel(cancel)?;
        recorder.record(PivotPhase::SourceClearing).await?;

        Ok((graph, sequence, moved))
    }

    async fn create_on_dest(
        &self,
        graph: &ObjectGraph,
        sequence: &MoveSequence,
        cancel: &CancellationToken,
    ) -> Result<u32, MoveError> {
        let mut writer = TargetWriter::new(self.dest.as_ref(), &self.config.namespace);
        writer.ensure_namespace().await?;

        let moving: HashSet<String> = graph.uids().into_iter().collect();
        let total = sequence.num_groups();

        for (index, group) in sequence.iter_groups() {
            check_cancel(cancel)?;

            let nodes = extract_nodes_for_group(graph, group);
            info!(group = index, total = total, objects = nodes.len(), "Creating group");

            for node in nodes {
                writer.create(node, &moving).await.map_err(|e| match e {
                    MoveError::ForeignObject { .. } => e,
                    other => MoveError::BatchFailed {
                        index: index as u32,
                        message: format!("{}: {}", node.identity.display(), other),
                    },
                })?;
            }
        }

        Ok(writer.created())
    }

    /// Wait until every moved Cluster reports the status captured on the source
    async fn confirm_adoption(
        &self,
        graph: &ObjectGraph,
        snapshots: &[(ClusterStatusSnapshot, &GraphNode)],
        cancel: &CancellationToken,
    ) -> Result<(), MoveError> {
        let timeout = self.config.confirm_timeout;
        let description = format!("cluster {} to be adopted", self.config.cluster_name);

        wait_with_timeout(timeout, self.config.poll_interval, &description, cancel, || async {
            for (snapshot, node) in snapshots {
                let observed = self
                    .dest
                    .get(graph.namespace(), &node.api_resource, &snapshot.name)
                    .await
                    .map_err(|e| gokp_common::Error::transport("destination", e.to_string()))?;
                let Some(observed) = observed else {
                    return Ok(None);
                };
                if !snapshot.matches(&observed) {
                    debug!(cluster = %snapshot.name, "Destination status not yet matching");
                    return Ok(None);
                }
            }
            Ok(Some(()))
        })
        .await
        .map_err(|e| match e.kind() {
            ErrorKind::Cancelled => MoveError::Cancelled,
            ErrorKind::Timeout => MoveError::Timeout {
                seconds: timeout.as_secs(),
            },
            _ => MoveError::NotAdopted(e.to_string()),
        })?;

        info!(cluster = %self.config.cluster_name, "Destination controllers adopted the cluster");
        Ok(())
    }

    /// Return authority to the source. Best effort: failures are logged.
    async fn rollback(&self) {
        if let Err(e) = self.dest.set_paused(&self.config.namespace, true).await {
            warn!(error = %e, "Failed to re-pause destination during rollback");
        }
        if let Err(e) = self.source.set_paused(&self.config.namespace, false).await {
            error!(error = %e, "Failed to unpause source during rollback");
        }
    }

    /// Delete source objects in reverse order. Not cancellable.
    async fn delete_source(
        &self,
        graph: &ObjectGraph,
        sequence: &MoveSequence,
    ) -> Result<u32, MoveError> {
        let uids = sequence.all_uids_for_deletion();
        let mut deleted = 0u32;
        let mut failures = Vec::new();

        for uid in &uids {
            let Some(node) = graph.get(uid) else {
                continue;
            };

            let deletion = self
                .source
                .delete_for_move(graph.namespace(), &node.api_resource, &node.identity.name)
                .await;
            match deletion {
                Ok(()) => deleted += 1,
                Err(e) => {
                    error!(object = %node.identity.display(), error = %e, "Failed to delete source object");
                    failures.push(format!("{}: {}", node.identity.display(), e));
                }
            }
        }

        info!(deleted = deleted, total = uids.len(), "Source objects deleted");

        if failures.is_empty() {
            Ok(deleted)
        } else {
            Err(MoveError::DeletionFailed(failures.join("; ")))
        }
    }
}

fn check_cancel(cancel: &CancellationToken) -> Result<(), MoveError> {
    if cancel.is_cancelled() {
        Err(MoveError::Cancelled)
    } else {
        Ok(())
    }
}

fn capture_cluster_status(graph: &ObjectGraph) -> Vec<(ClusterStatusSnapshot, &GraphNode)> {
    let mut snapshots: Vec<_> = graph
        .nodes()
        .values()
        .filter(|n| n.identity.kind == "Cluster")
        .filter_map(|n| ClusterStatusSnapshot::from_object(&n.object).map(|s| (s, n)))
        .collect();
    snapshots.sort_by(|a, b| a.0.name.cmp(&b.0.name));
    snapshots
}
