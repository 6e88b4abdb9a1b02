//! Object graph building for CAPI resource discovery and ownership
//!
//! Discovers the lifecycle-management objects in a namespace and records who
//! owns whom, which decides the order objects are created on the destination.

use std::collections::{HashMap, HashSet};

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, DynamicObject, ListParams};
use kube::discovery::ApiResource;
use kube::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use gokp_common::kube_utils::is_not_found;

use crate::error::MoveError;
use crate::MOVE_LABEL;

/// Identity of a Kubernetes object
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectIdentity {
    /// API version (e.g., "cluster.x-k8s.io/v1beta1")
    pub api_version: String,
    /// Kind (e.g., "Cluster")
    pub kind: String,
    /// Namespace
    pub namespace: String,
    /// Name
    pub name: String,
    /// UID from source cluster
    pub uid: String,
}

impl ObjectIdentity {
    /// Create a new ObjectIdentity
    pub fn new(api_version: &str, kind: &str, namespace: &str, name: &str, uid: &str) -> Self {
        Self {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
            uid: uid.to_string(),
        }
    }

    /// Get a display string for logging
    pub fn display(&self) -> String {
        if self.namespace.is_empty() {
            format!("{}/{}", self.kind, self.name)
        } else {
            format!("{}/{}/{}", self.kind, self.namespace, self.name)
        }
    }
}

/// A node in the object graph representing a single resource
#[derive(Debug, Clone)]
pub struct GraphNode {
    /// Identity of this object
    pub identity: ObjectIdentity,
    /// Served resource for this object's type
    pub api_resource: ApiResource,
    /// The full object as read from the source
    pub object: serde_json::Value,
    /// UIDs of direct owners (from ownerReferences)
    pub owners: HashSet<String>,
    /// UIDs of soft owners (by naming convention)
    pub soft_owners: HashSet<String>,
}

impl GraphNode {
    /// Build a node from a listed object. Objects without uid or name are skipped.
    pub fn from_dynamic_object(obj: &DynamicObject, api_resource: &ApiResource) -> Option<Self> {
        let uid = obj.metadata.uid.as_ref()?;
        let name = obj.metadata.name.as_ref()?;
        let namespace = obj.metadata.namespace.clone().unwrap_or_default();

        let identity = ObjectIdentity::new(
            &api_resource.api_version,
            &api_resource.kind,
            &namespace,
            name,
            uid,
        );

        let owners: HashSet<String> = obj
            .metadata
            .owner_references
            .as_ref()
            .map(|refs| refs.iter().map(|r| r.uid.clone()).collect())
            .unwrap_or_default();

        // List responses omit apiVersion/kind on items
        let mut object = serde_json::to_value(obj).ok()?;
        if let Some(obj_map) = object.as_object_mut() {
            obj_map.insert(
                "apiVersion".to_string(),
                serde_json::Value::String(api_resource.api_version.clone()),
            );
            obj_map.insert(
                "kind".to_string(),
                serde_json::Value::String(api_resource.kind.clone()),
            );
        }

        Some(Self {
            identity,
            api_resource: api_resource.clone(),
            object,
            owners,
            soft_owners: HashSet::new(),
        })
    }

    /// Get the source UID
    pub fn uid(&self) -> &str {
        &self.identity.uid
    }

    /// Get all owners (both hard and soft)
    pub fn all_owners(&self) -> HashSet<String> {
        self.owners.union(&self.soft_owners).cloned().collect()
    }
}

/// Every discovered object in a namespace and their ownership relationships
#[derive(Debug)]
pub struct ObjectGraph {
    nodes: HashMap<String, GraphNode>,
    discovered_types: Vec<ApiResource>,
    namespace: String,
}

impl ObjectGraph {
    /// Create a new empty ObjectGraph
    pub fn new(namespace: &str) -> Self {
        Self {
            nodes: HashMap::new(),
            discovered_types: Vec::new(),
            namespace: namespace.to_string(),
        }
    }

    /// Get the namespace
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Get all nodes
    pub fn nodes(&self) -> &HashMap<String, GraphNode> {
        &self.nodes
    }

    /// Get a node by UID
    pub fn get(&self, uid: &str) -> Option<&GraphNode> {
        self.nodes.get(uid)
    }

    /// Get all UIDs
    pub fn uids(&self) -> Vec<String> {
        self.nodes.keys().cloned().collect()
    }

    /// Get the number of nodes
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Check if the graph is empty
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Insert a node into the graph
    pub fn insert(&mut self, node: GraphNode) {
        let uid = node.uid().to_string();
        self.nodes.insert(uid, node);
    }

    /// Drop every node of the given kind
    pub fn remove_kind(&mut self, kind: &str) {
        self.nodes.retain(|_, n| n.identity.kind != kind);
    }

    /// Discover CRDs with the move label and populate the graph
    pub async fn discover(&mut self, client: &Client) -> Result<(), MoveError> {
        self.discover_types(client).await?;
        self.list_objects(client).await?;
        self.process_soft_ownership();

        info!(
            namespace = %self.namespace,
            types = self.discovered_types.len(),
            objects = self.nodes.len(),
            "Object graph discovery complete"
        );

        Ok(())
    }

    async fn discover_types(&mut self, client: &Client) -> Result<(), MoveError> {
        let crd_api: Api<CustomResourceDefinition> = Api::all(client.clone());

        let crds = crd_api
            .list(&ListParams::default().labels(MOVE_LABEL))
            .await
            .map_err(|e| MoveError::Discovery(format!("failed to list CRDs: {}", e)))?;

        for crd in crds.items {
            let name = crd.metadata.name.clone().unwrap_or_default();
            let spec = &crd.spec;

            // Cluster-scoped provider types (identities) stay with their cluster
            if spec.scope != "Namespaced" {
                debug!(crd = %name, "Skipping cluster-scoped CRD");
                continue;
            }

            let version = spec
                .versions
                .iter()
                .find(|v| v.served && v.storage)
                .or_else(|| spec.versions.iter().find(|v| v.served))
                .map(|v| v.name.clone());

            let Some(version) = version else {
                warn!(crd = %name, "CRD has no served versions, skipping");
                continue;
            };

            debug!(crd = %name, kind = %spec.names.kind, "Discovered CRD type");

            self.discovered_types.push(ApiResource {
                group: spec.group.clone(),
                version: version.clone(),
                kind: spec.names.kind.clone(),
                api_version: format!("{}/{}", spec.group, version),
                plural: spec.names.plural.clone(),
            });
        }

        // Secrets and ConfigMaps carry kubeconfigs, CA material and bootstrap data
        self.discovered_types.push(core_resource("Secret", "secrets"));
        self.discovered_types.push(core_resource("ConfigMap", "configmaps"));

        info!(types = self.discovered_types.len(), "Discovered types for move");
        Ok(())
    }

    async fn list_objects(&mut self, client: &Client) -> Result<(), MoveError> {
        for api_resource in &self.discovered_types {
            let api: Api<DynamicObject> =
                Api::namespaced_with(client.clone(), &self.namespace, api_resource);

            let list = match api.list(&ListParams::default()).await {
                Ok(l) => l,
                Err(e) if is_not_found(&e) => {
                    debug!(kind = %api_resource.kind, "Type not served, skipping");
                    continue;
                }
                Err(e) => {
                    return Err(MoveError::Discovery(format!(
                        "failed to list {}: {}",
                        api_resource.kind, e
                    )));
                }
            };

            for obj in list.items {
                if let Some(node) = GraphNode::from_dynamic_object(&obj, api_resource) {
                    debug!(
                        object = %node.identity.display(),
                        owners = node.owners.len(),
                        "Added object to graph"
                    );
                    self.nodes.insert(node.uid().to_string(), node);
                }
            }
        }

        Ok(())
    }

    /// Secrets named `<cluster>-*` belong to that Cluster even without an
    /// ownerReference (kubeconfig, CA, etcd and service-account keys).
    fn process_soft_ownership(&mut self) {
        let clusters: Vec<(String, String)> = self
            .nodes
            .values()
            .filter(|n| n.identity.kind == "Cluster")
            .map(|n| (n.identity.name.clone(), n.uid().to_string()))
            .collect();

        let soft: Vec<(String, String)> = self
            .nodes
            .values()
            .filter(|n| n.identity.kind == "Secret")
            .filter_map(|n| {
                soft_owner_for_secret(
                    &n.identity.name,
                    clusters.iter().map(|(name, uid)| (name.as_str(), uid.as_str())),
                )
                .map(|cluster_uid| (n.uid().to_string(), cluster_uid))
            })
            .collect();

        for (secret_uid, cluster_uid) in soft {
            if let Some(node) = self.nodes.get_mut(&secret_uid) {
                debug!(secret = %node.identity.name, "Secret soft-owned by cluster");
                node.soft_owners.insert(cluster_uid);
            }
        }
    }

    /// Keep only the named Cluster, its descendants and their owners.
    ///
    /// Returns false (and leaves the graph untouched) if the Cluster is absent.
    pub fn filter_by_cluster(&mut self, cluster_name: &str) -> bool {
        let cluster_uid = self
            .nodes
            .values()
            .find(|n| n.identity.kind == "Cluster" && n.identity.name == cluster_name)
            .map(|n| n.uid().to_string());

        let Some(cluster_uid) = cluster_uid else {
            warn!(cluster = %cluster_name, "Cluster not found in graph");
            return false;
        };

        let mut keep = HashSet::new();
        self.collect_descendants(&cluster_uid, &mut keep);

        let owners: HashSet<String> = keep
            .iter()
            .filter_map(|uid| self.nodes.get(uid))
            .flat_map(|n| n.all_owners())
            .collect();
        keep.extend(owners);

        let before = self.nodes.len();
        self.nodes.retain(|uid, _| keep.contains(uid));

        info!(
            cluster = %cluster_name,
            before = before,
            after = self.nodes.len(),
            "Filtered graph by cluster"
        );
        true
    }

    fn collect_descendants(&self, uid: &str, collected: &mut HashSet<String>) {
        if !collected.insert(uid.to_string()) {
            return;
        }

        for node in self.nodes.values() {
            if node.all_owners().contains(uid) {
                self.collect_descendants(node.uid(), collected);
            }
        }
    }
}

fn core_resource(kind: &str, plural: &str) -> ApiResource {
    ApiResource {
        group: String::new(),
        version: "v1".to_string(),
        kind: kind.to_string(),
        api_version: "v1".to_string(),
        plural: plural.to_string(),
    }
}

/// Cluster UID owning a secret by the `<cluster>-` naming convention
fn soft_owner_for_secret<'a>(
    secret_name: &str,
    mut clusters: impl Iterator<Item = (&'a str, &'a str)>,
) -> Option<String> {
    clusters
        .find(|(cluster_name, _)| {
            secret_name
                .strip_prefix(cluster_name)
                .is_some_and(|rest| rest.starts_with('-'))
        })
        .map(|(_, uid)| uid.to_string())
}
