//! Cluster access used by the mover
//!
//! [`MoveClusterApi`] is the only way the mover reaches either API server,
//! so the move can be exercised without a cluster.

use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Namespace;
use kube::api::{Api, DeleteParams, DynamicObject, Patch, PatchParams, PostParams};
use kube::discovery::ApiResource;
use kube::Client;
use serde_json::Value;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use gokp_common::kube_utils::{is_conflict, is_not_found, is_server_error};

use crate::error::MoveError;
use crate::graph::ObjectGraph;
use crate::pause::set_cluster_paused;
use crate::DELETE_FOR_MOVE_ANNOTATION;

/// Attempts for a create that keeps hitting 5xx (webhooks not serving yet)
const MAX_CREATE_ATTEMPTS: u32 = 5;

/// Result of creating an object that may already exist
#[derive(Debug, Clone, PartialEq)]
pub enum CreateOutcome {
    /// Newly created, as returned by the API server
    Created(Value),
    /// An object with the same name was already there
    Exists(Value),
}

/// Operations the mover performs against one cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MoveClusterApi: Send + Sync {
    /// Set `spec.paused` on every Cluster and ClusterClass in `namespace`
    async fn set_paused(&self, namespace: &str, paused: bool) -> Result<(), MoveError>;

    /// Build the graph of every movable object in `namespace`
    async fn discover(&self, namespace: &str) -> Result<ObjectGraph, MoveError>;

    /// Create `namespace` unless it exists
    async fn ensure_namespace(&self, namespace: &str) -> Result<(), MoveError>;

    /// Create `object`, returning the existing one on a name conflict
    async fn create(
        &self,
        namespace: &str,
        resource: &ApiResource,
        object: Value,
    ) -> Result<CreateOutcome, MoveError>;

    /// Merge-patch an object and return the result
    async fn patch(
        &self,
        namespace: &str,
        resource: &ApiResource,
        name: &str,
        patch: Value,
    ) -> Result<Value, MoveError>;

    /// Read an object, `None` if it does not exist
    async fn get(
        &self,
        namespace: &str,
        resource: &ApiResource,
        name: &str,
    ) -> Result<Option<Value>, MoveError>;

    /// Delete an object without triggering infrastructure teardown
    async fn delete_for_move(
        &self,
        namespace: &str,
        resource: &ApiResource,
        name: &str,
    ) -> Result<(), MoveError>;
}

/// [`MoveClusterApi`] over a kube client
#[derive(Clone)]
pub struct KubeMoveApi {
    client: Client,
}

impl KubeMoveApi {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str, resource: &ApiResource) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, resource)
    }
}

fn to_value(obj: DynamicObject) -> Result<Value, MoveError> {
    serde_json::to_value(obj).map_err(|e| MoveError::Serialization(e.to_string()))
}

#[async_trait]
impl MoveClusterApi for KubeMoveApi {
    async fn set_paused(&self, namespace: &str, paused: bool) -> Result<(), MoveError> {
        set_cluster_paused(&self.client, namespace, paused).await
    }

    async fn discover(&self, namespace: &str) -> Result<ObjectGraph, MoveError> {
        let mut graph = ObjectGraph::new(namespace);
        graph.discover(&self.client).await?;
        Ok(graph)
    }

    async fn ensure_namespace(&self, namespace: &str) -> Result<(), MoveError> {
        let ns_api: Api<Namespace> = Api::all(self.client.clone());
        let failed = |message: String| MoveError::NamespaceCreation {
            namespace: namespace.to_string(),
            message,
        };

        match ns_api.get(namespace).await {
            Ok(_) => {
                debug!(namespace = %namespace, "Namespace already exists");
                return Ok(());
            }
            Err(e) if is_not_found(&e) => {}
            Err(e) => return Err(failed(e.to_string())),
        }

        let ns = Namespace {
            metadata: kube::core::ObjectMeta {
                name: Some(namespace.to_string()),
                ..Default::default()
            },
            ..Default::default()
        };

        match ns_api.create(&PostParams::default(), &ns).await {
            Ok(_) => {
                info!(namespace = %namespace, "Created namespace");
                Ok(())
            }
            Err(e) if is_conflict(&e) => Ok(()),
            Err(e) => Err(failed(e.to_string())),
        }
    }

    async fn create(
        &self,
        namespace: &str,
        resource: &ApiResource,
        object: Value,
    ) -> Result<CreateOutcome, MoveError> {
        let dyn_obj: DynamicObject = serde_json::from_value(object)
            .map_err(|e| MoveError::Serialization(format!("not a valid object: {}", e)))?;
        let name = dyn_obj.metadata.name.clone().unwrap_or_default();
        let api = self.api(namespace, resource);

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match api.create(&PostParams::default(), &dyn_obj).await {
                Ok(created) => return Ok(CreateOutcome::Created(to_value(created)?)),
                Err(e) if is_conflict(&e) => {
                    return Ok(CreateOutcome::Exists(to_value(api.get(&name).await?)?));
                }
                Err(e) if is_server_error(&e) && attempt < MAX_CREATE_ATTEMPTS => {
                    warn!(
                        kind = %resource.kind,
                        name = %name,
                        error = %e,
                        attempt = attempt,
                        "Transient error, retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(500 * attempt as u64)).await;
                }
                Err(e) => return Err(MoveError::Kube(e)),
            }
        }
    }

    async fn patch(
        &self,
        namespace: &str,
        resource: &ApiResource,
        name: &str,
        patch: Value,
    ) -> Result<Value, MoveError> {
        let patched = self
            .api(namespace, resource)
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        to_value(patched)
    }

    async fn get(
        &self,
        namespace: &str,
        resource: &ApiResource,
        name: &str,
    ) -> Result<Option<Value>, MoveError> {
        self.api(namespace, resource)
            .get_opt(name)
            .await?
            .map(to_value)
            .transpose()
    }

    async fn delete_for_move(
        &self,
        namespace: &str,
        resource: &ApiResource,
        name: &str,
    ) -> Result<(), MoveError> {
        let api = self.api(namespace, resource);

        let Some(obj) = api.get_opt(name).await? else {
            debug!(kind = %resource.kind, name = %name, "Already deleted");
            return Ok(());
        };

        let annotation_patch = serde_json::json!({
            "metadata": { "annotations": { DELETE_FOR_MOVE_ANNOTATION: "" } }
        });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&annotation_patch))
            .await?;

        if obj.metadata.finalizers.as_ref().is_some_and(|f| !f.is_empty()) {
            let finalizer_patch = serde_json::json!({ "metadata": { "finalizers": null } });
            api.patch(name, &PatchParams::default(), &Patch::Merge(&finalizer_patch))
                .await?;
        }

        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => {
                debug!(kind = %resource.kind, name = %name, "Deleted source object");
                Ok(())
            }
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(MoveError::Kube(e)),
        }
    }
}
