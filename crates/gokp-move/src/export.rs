//! Export of a cluster's definition as plain YAML for a GitOps repository
//!
//! Uses the same discovery and filtering as the move, minus Secrets, and
//! writes one file per declared object in move order plus a
//! `kustomization.yaml`. Objects a controller owns (MachineSets, Machines,
//! per-machine bootstrap and infrastructure objects) are regenerated by that
//! controller and never exported.

use std::path::Path;

use kube::Client;
use serde_json::Value;
use tracing::info;

use crate::error::MoveError;
use crate::graph::ObjectGraph;
use crate::sequence::MoveSequence;
use crate::target::{is_controlled, strip_transient_fields};

/// Name of the kustomization listing the exported files
pub const KUSTOMIZATION_FILE: &str = "kustomization.yaml";

/// One exported file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportedFile {
    /// File name inside the export directory
    pub file_name: String,
    /// YAML content
    pub content: String,
}

/// Discover the cluster on `client` and write its definition into `out_dir`.
///
/// Returns the written files, the kustomization last.
pub async fn export_cluster_definitions(
    client: &Client,
    namespace: &str,
    cluster_name: &str,
    out_dir: &Path,
) -> Result<Vec<ExportedFile>, MoveError> {
    let mut graph = ObjectGraph::new(namespace);
    graph.discover(client).await?;
    if !graph.filter_by_cluster(cluster_name) {
        return Err(MoveError::Discovery(format!(
            "cluster {} not found in namespace {}",
            cluster_name, namespace
        )));
    }
    graph.remove_kind("Secret");

    let sequence = MoveSequence::from_graph(&graph)?;
    let files = render_export(&graph, &sequence)?;

    std::fs::create_dir_all(out_dir).map_err(|e| MoveError::Export {
        path: out_dir.to_path_buf(),
        message: e.to_string(),
    })?;

    for file in &files {
        let path = out_dir.join(&file.file_name);
        std::fs::write(&path, &file.content).map_err(|e| MoveError::Export {
            path,
            message: e.to_string(),
        })?;
    }

    info!(
        cluster = %cluster_name,
        files = files.len(),
        dir = %out_dir.display(),
        "Exported cluster definition"
    );

    Ok(files)
}

/// Render every uncontrolled graph object as YAML in move order, plus the
/// kustomization
pub(crate) fn render_export(
    graph: &ObjectGraph,
    sequence: &MoveSequence,
) -> Result<Vec<ExportedFile>, MoveError> {
    let nodes: Vec<_> = sequence
        .all_uids_in_order()
        .iter()
        .filter_map(|uid| graph.get(uid))
        .filter(|node| !is_controlled(&node.object))
        .collect();
    let width = nodes.len().to_string().len().max(2);

    let mut files = Vec::with_capacity(nodes.len() + 1);
    for (index, node) in nodes.into_iter().enumerate() {
        let mut obj = node.object.clone();
        strip_for_export(&mut obj);

        let content = serde_yaml::to_string(&obj).map_err(|e| {
            MoveError::Serialization(format!("{}: {}", node.identity.display(), e))
        })?;

        files.push(ExportedFile {
            file_name: format!(
                "{:0width$}-{}-{}.yaml",
                index,
                node.identity.kind.to_lowercase(),
                node.identity.name,
                width = width
            ),
            content,
        });
    }

    let kustomization = serde_json::json!({
        "apiVersion": "kustomize.config.k8s.io/v1beta1",
        "kind": "Kustomization",
        "resources": files.iter().map(|f| f.file_name.clone()).collect::<Vec<_>>(),
    });
    files.push(ExportedFile {
        file_name: KUSTOMIZATION_FILE.to_string(),
        content: serde_yaml::to_string(&kustomization)
            .map_err(|e| MoveError::Serialization(e.to_string()))?,
    });

    Ok(files)
}

/// Transient fields plus the pause flag, which only matters mid-move
fn strip_for_export(obj: &mut Value) {
    strip_transient_fields(obj);
    if let Some(spec) = obj.get_mut("spec").and_then(Value::as_object_mut) {
        spec.remove("paused");
    }
}
