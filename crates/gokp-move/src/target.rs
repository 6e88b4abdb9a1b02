//! Destination-side object creation
//!
//! Creates moved objects on the destination cluster, remapping ownerReferences
//! from source UIDs to the UIDs the destination assigns. An object already
//! present on the destination is only reused when an earlier move created it.

use std::collections::{HashMap, HashSet};

use serde_json::Value;
use tracing::debug;

use crate::api::{CreateOutcome, MoveClusterApi};
use crate::error::MoveError;
use crate::graph::GraphNode;
use crate::SOURCE_UID_ANNOTATION;

/// Writes moved objects into one namespace of the destination cluster
pub struct TargetWriter<'a> {
    api: &'a dyn MoveClusterApi,
    namespace: String,
    uid_map: HashMap<String, String>,
    created: u32,
}

impl<'a> TargetWriter<'a> {
    /// Create a writer for the destination cluster
    pub fn new(api: &'a dyn MoveClusterApi, namespace: &str) -> Self {
        Self {
            api,
            namespace: namespace.to_string(),
            uid_map: HashMap::new(),
            created: 0,
        }
    }

    /// Number of objects written (created or adopted)
    pub fn created(&self) -> u32 {
        self.created
    }

    /// Ensure the target namespace exists
    pub async fn ensure_namespace(&self) -> Result<(), MoveError> {
        self.api.ensure_namespace(&self.namespace).await
    }

    /// Create one object on the destination and record its new UID.
    ///
    /// `moving` holds the source UIDs of every object in the move; owner
    /// references to anything else are dropped rather than left dangling.
    pub async fn create(
        &mut self,
        node: &GraphNode,
        moving: &HashSet<String>,
    ) -> Result<String, MoveError> {
        let obj = prepare_for_target(node, &self.namespace, &self.uid_map, moving)?;

        let written = match self
            .api
            .create(&self.namespace, &node.api_resource, obj.clone())
            .await?
        {
            CreateOutcome::Created(created) => created,
            CreateOutcome::Exists(existing) => {
                check_adoptable(node, &existing)?;
                debug!(
                    object = %node.identity.display(),
                    "Object left by an earlier move, relinking"
                );
                self.api
                    .patch(
                        &self.namespace,
                        &node.api_resource,
                        &node.identity.name,
                        relink_patch(&obj, node.uid()),
                    )
                    .await?
            }
        };

        let target_uid = written
            .pointer("/metadata/uid")
            .and_then(Value::as_str)
            .map(String::from)
            .ok_or_else(|| {
                MoveError::Serialization(format!(
                    "{} has no UID on the destination",
                    node.identity.display()
                ))
            })?;

        debug!(
            object = %node.identity.display(),
            target_uid = %target_uid,
            "Created object"
        );

        self.uid_map.insert(node.uid().to_string(), target_uid.clone());
        self.created += 1;
        Ok(target_uid)
    }
}

/// An existing destination object may only be reused if a move of the same
/// source object created it. Anything else has another writer.
pub(crate) fn check_adoptable(node: &GraphNode, existing: &Value) -> Result<(), MoveError> {
    let recorded = existing
        .pointer("/metadata/annotations")
        .and_then(|a| a.get(SOURCE_UID_ANNOTATION))
        .and_then(Value::as_str);

    match recorded {
        Some(uid) if uid == node.uid() => Ok(()),
        Some(uid) => Err(MoveError::ForeignObject {
            object: node.identity.display(),
            message: format!("created from source object {}", uid),
        }),
        None => Err(MoveError::ForeignObject {
            object: node.identity.display(),
            message: format!("has no {} annotation", SOURCE_UID_ANNOTATION),
        }),
    }
}

/// Merge patch carrying the rebuilt ownerReferences, the source UID and the
/// pause flag of a prepared object onto an existing copy
pub(crate) fn relink_patch(prepared: &Value, source_uid: &str) -> Value {
    let owner_refs = prepared
        .pointer("/metadata/ownerReferences")
        .cloned()
        .unwrap_or(Value::Null);
    let mut patch = serde_json::json!({
        "metadata": {
            "ownerReferences": owner_refs,
            "annotations": { SOURCE_UID_ANNOTATION: source_uid }
        }
    });
    if let Some(paused) = prepared.pointer("/spec/paused") {
        patch["spec"] = serde_json::json!({ "paused": paused });
    }
    patch
}

/// Owner reference as recorded on the source object
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SourceOwnerRef {
    pub source_uid: String,
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub controller: bool,
    pub block_owner_deletion: bool,
}

/// Extract owner references from an object's metadata
pub(crate) fn extract_owner_refs(obj: &Value) -> Vec<SourceOwnerRef> {
    let Some(refs) = obj
        .get("metadata")
        .and_then(|m| m.get("ownerReferences"))
        .and_then(|r| r.as_array())
    else {
        return Vec::new();
    };

    refs.iter()
        .filter_map(|r| {
            Some(SourceOwnerRef {
                source_uid: r.get("uid")?.as_str()?.to_string(),
                api_version: r.get("apiVersion")?.as_str()?.to_string(),
                kind: r.get("kind")?.as_str()?.to_string(),
                name: r.get("name")?.as_str()?.to_string(),
                controller: r.get("controller").and_then(Value::as_bool).unwrap_or(false),
                block_owner_deletion: r
                    .get("blockOwnerDeletion")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
            })
        })
        .collect()
}

/// Whether a controller owns the object, so it is regenerated rather than
/// declared
pub(crate) fn is_controlled(obj: &Value) -> bool {
    extract_owner_refs(obj).iter().any(|r| r.controller)
}

/// Build the manifest sent to the destination for a graph node
pub(crate) fn prepare_for_target(
    node: &GraphNode,
    namespace: &str,
    uid_map: &HashMap<String, String>,
    moving: &HashSet<String>,
) -> Result<Value, MoveError> {
    let owners = extract_owner_refs(&node.object);

    let mut obj = node.object.clone();
    strip_transient_fields(&mut obj);

    let mut new_refs = Vec::with_capacity(owners.len());
    for owner in owners {
        if !moving.contains(&owner.source_uid) {
            debug!(
                object = %node.identity.display(),
                owner = %owner.name,
                "Dropping reference to owner outside the move"
            );
            continue;
        }

        let target_uid =
            uid_map
                .get(&owner.source_uid)
                .ok_or_else(|| MoveError::UidMappingNotFound {
                    source_uid: owner.source_uid.clone(),
                })?;

        let mut owner_ref = serde_json::json!({
            "apiVersion": owner.api_version,
            "kind": owner.kind,
            "name": owner.name,
            "uid": target_uid,
        });
        if owner.controller {
            owner_ref["controller"] = Value::Bool(true);
        }
        if owner.block_owner_deletion {
            owner_ref["blockOwnerDeletion"] = Value::Bool(true);
        }
        new_refs.push(owner_ref);
    }

    let metadata = obj
        .get_mut("metadata")
        .and_then(|m| m.as_object_mut())
        .ok_or_else(|| {
            MoveError::Serialization(format!("{} has no metadata", node.identity.display()))
        })?;

    metadata.insert("namespace".to_string(), Value::String(namespace.to_string()));

    let annotations = metadata
        .entry("annotations")
        .or_insert_with(|| Value::Object(serde_json::Map::new()));
    if let Some(ann) = annotations.as_object_mut() {
        ann.insert(
            SOURCE_UID_ANNOTATION.to_string(),
            Value::String(node.uid().to_string()),
        );
    }

    if !new_refs.is_empty() {
        metadata.insert("ownerReferences".to_string(), Value::Array(new_refs));
    }

    Ok(obj)
}

/// Strip fields that are assigned by the API server or tied to the source.
pub fn strip_transient_fields(obj: &mut Value) {
    if let Some(metadata) = obj.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        for field in [
            "uid",
            "resourceVersion",
            "creationTimestamp",
            "generation",
            "selfLink",
            "managedFields",
            "ownerReferences",
        ] {
            metadata.remove(field);
        }

        if let Some(annotations) = metadata
            .get_mut("annotations")
            .and_then(|a| a.as_object_mut())
        {
            annotations.remove("kubectl.kubernetes.io/last-applied-configuration");
            annotations.retain(|k, _| !k.starts_with("meta.helm.sh/"));
        }
    }

    if let Some(obj_map) = obj.as_object_mut() {
        obj_map.remove("status");
    }
}
