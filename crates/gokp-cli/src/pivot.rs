//! Export and move of the cluster definition from bootstrap to target

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[cfg(test)]
use mockall::automock;

use gokp_common::Result;
use gokp_move::{export_cluster_definitions, ClusterMover, MoveResult, MoverConfig};

use crate::provision::CLUSTER_NAMESPACE;
use crate::run::{ClusterEndpoint, RunJournal};

/// Directory of the exported definition, relative to the repository root
pub const CAPI_EXPORT_DIR: &str = "cluster/capi";

/// Exports the cluster definition and moves lifecycle management to the target
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PivotController: Send + Sync {
    /// Write the cluster definition from `source` into the repository clone
    async fn export_definitions(
        &self,
        source: &ClusterEndpoint,
        cluster: &str,
        repo_dir: &Path,
    ) -> Result<()>;

    /// Move the cluster's management objects from `source` to `dest`,
    /// recording each pivot phase in `recorder` before it starts
    async fn move_pivot_objects(
        &self,
        source: &ClusterEndpoint,
        dest: &ClusterEndpoint,
        cluster: &str,
        recorder: &RunJournal,
        cancel: &CancellationToken,
    ) -> Result<MoveResult>;
}

/// [`PivotController`] for Cluster API clusters
#[derive(Debug, Clone)]
pub struct CapiPivot {
    namespace: String,
    confirm_timeout: Duration,
}

impl Default for CapiPivot {
    fn default() -> Self {
        Self {
            namespace: CLUSTER_NAMESPACE.to_string(),
            confirm_timeout: Duration::from_secs(600),
        }
    }
}

impl CapiPivot {
    /// Override how long the target's controllers get to adopt the cluster
    pub fn with_confirm_timeout(mut self, timeout: Duration) -> Self {
        self.confirm_timeout = timeout;
        self
    }
}

#[async_trait]
impl PivotController for CapiPivot {
    async fn export_definitions(
        &self,
        source: &ClusterEndpoint,
        cluster: &str,
        repo_dir: &Path,
    ) -> Result<()> {
        let client = source.client().await?;
        let out_dir = repo_dir.join(CAPI_EXPORT_DIR);

        let files = export_cluster_definitions(&client, &self.namespace, cluster, &out_dir)
            .await
            .map_err(|e| e.into_error(cluster))?;

        info!(files = files.len(), dir = %out_dir.display(), "Exported cluster definition");
        Ok(())
    }

    async fn move_pivot_objects(
        &self,
        source: &ClusterEndpoint,
        dest: &ClusterEndpoint,
        cluster: &str,
        recorder: &RunJournal,
        cancel: &CancellationToken,
    ) -> Result<MoveResult> {
        let source_client = source.client().await?;
        let dest_client = dest.client().await?;

        let config =
            MoverConfig::new(&self.namespace, cluster).with_confirm_timeout(self.confirm_timeout);
        let result = ClusterMover::new(source_client, dest_client, config)
            .execute(recorder, cancel)
            .await
            .map_err(|e| e.into_error(cluster))?;

        info!(
            move_id = %result.move_id,
            moved = result.objects_moved,
            deleted = result.objects_deleted,
            "Cluster management moved to {}",
            dest.name
        );
        Ok(result)
    }
}
