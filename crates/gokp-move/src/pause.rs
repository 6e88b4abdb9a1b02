//! Pausing and unpausing Cluster API reconciliation

use kube::api::{Api, DynamicObject, ListParams, Patch, PatchParams};
use kube::discovery::ApiResource;
use kube::Client;
use tracing::{debug, info};

use gokp_common::kube_utils::{is_not_found, parse_api_version};

use crate::error::MoveError;
use crate::CAPI_API_VERSION;

/// Set `spec.paused` on Cluster and ClusterClass resources in a namespace
pub(crate) async fn set_cluster_paused(
    client: &Client,
    namespace: &str,
    paused: bool,
) -> Result<(), MoveError> {
    let action = if paused { "pause" } else { "unpause" };

    let clusters = set_resource_paused(client, namespace, "Cluster", "clusters", paused)
        .await
        .map_err(|e| MoveError::PauseFailed(format!("{} Cluster: {}", action, e)))?;

    // ClusterClass is optional; the CRD may not be served at all
    let classes = match set_resource_paused(client, namespace, "ClusterClass", "clusterclasses", paused)
        .await
    {
        Ok(n) => n,
        Err(MoveError::Kube(e)) if is_not_found(&e) => 0,
        Err(e) => {
            return Err(MoveError::PauseFailed(format!(
                "{} ClusterClass: {}",
                action, e
            )))
        }
    };

    info!(
        namespace = %namespace,
        paused = paused,
        clusters = clusters,
        cluster_classes = classes,
        "Set cluster paused state"
    );
    Ok(())
}

async fn set_resource_paused(
    client: &Client,
    namespace: &str,
    kind: &str,
    plural: &str,
    paused: bool,
) -> Result<u32, MoveError> {
    let (group, version) = parse_api_version(CAPI_API_VERSION);
    let api_resource = ApiResource {
        group,
        version,
        kind: kind.to_string(),
        api_version: CAPI_API_VERSION.to_string(),
        plural: plural.to_string(),
    };

    let api: Api<DynamicObject> = Api::namespaced_with(client.clone(), namespace, &api_resource);
    let list = api.list(&ListParams::default()).await?;

    let patch = paused_patch(paused);
    let mut count = 0u32;
    for obj in list.items {
        let Some(name) = obj.metadata.name.as_deref() else {
            continue;
        };

        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;

        debug!(kind = %kind, name = %name, paused = paused, "Set paused state");
        count += 1;
    }

    Ok(count)
}

fn paused_patch(paused: bool) -> serde_json::Value {
    serde_json::json!({ "spec": { "paused": paused } })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patch_sets_spec_paused() {
        assert_eq!(paused_patch(true)["spec"]["paused"], true);
        assert_eq!(paused_patch(false)["spec"]["paused"], false);
    }
}
