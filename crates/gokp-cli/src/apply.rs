//! Ordered server-side apply of a manifest set
//!
//! Documents are applied one at a time in set order with field manager
//! `gokp` and force, so re-applying a set is a no-op. A
//! CustomResourceDefinition blocks the next document until it is
//! Established, which lets a single set carry CRDs and their instances.

use std::time::Duration;

use kube::api::{Api, DynamicObject, Patch, PatchParams};
use kube::discovery::Scope;
use kube::Client;
use serde_json::Value;
use tracing::{debug, info};

use gokp_common::kube_utils::{resolve_api_resource, wait_for_crd_established};
use gokp_common::yaml::parse_document;
use gokp_common::{Error, Result, FIELD_MANAGER};

use crate::manifest::{ManifestDocument, ManifestSet};

/// Namespace used for namespaced objects that do not name one
pub const DEFAULT_NAMESPACE: &str = "default";

const CRD_ESTABLISHED_TIMEOUT: Duration = Duration::from_secs(120);

/// What a document targets on the API server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentTarget {
    /// apiVersion of the object
    pub api_version: String,
    /// kind of the object
    pub kind: String,
    /// metadata.name
    pub name: String,
    /// metadata.namespace, if set
    pub namespace: Option<String>,
}

impl DocumentTarget {
    /// Read the identifying fields of a parsed object
    pub fn from_value(obj: &Value) -> std::result::Result<Self, String> {
        let field = |pointer: &str| obj.pointer(pointer).and_then(Value::as_str);

        let api_version = field("/apiVersion").ok_or("missing apiVersion")?;
        let kind = field("/kind").ok_or("missing kind")?;
        let name = field("/metadata/name").ok_or("missing metadata.name")?;
        let namespace = field("/metadata/namespace").filter(|ns| !ns.is_empty());

        Ok(Self {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
            name: name.to_string(),
            namespace: namespace.map(str::to_string),
        })
    }
}

/// Applies manifest sets to one cluster
pub struct Applier {
    client: Client,
    crd_timeout: Duration,
}

impl Applier {
    /// Create an applier for the cluster behind `client`
    pub fn new(client: Client) -> Self {
        Self {
            client,
            crd_timeout: CRD_ESTABLISHED_TIMEOUT,
        }
    }

    /// Apply every document in order. The first failure stops the set.
    pub async fn apply(&self, set: &ManifestSet) -> Result<()> {
        info!(documents = set.len(), "Applying manifests");
        for doc in set {
            self.apply_document(doc)
                .await
                .map_err(|cause| Error::apply(&doc.file_name, cause))?;
        }
        Ok(())
    }

    async fn apply_document(&self, doc: &ManifestDocument) -> std::result::Result<(), String> {
        let Some(mut obj) = parse_document(&doc.content).map_err(|e| e.to_string())? else {
            debug!(document = %doc.file_name, "Skipping empty document");
            return Ok(());
        };

        let target = DocumentTarget::from_value(&obj)?;
        let (ar, scope) = resolve_api_resource(&self.client, &target.api_version, &target.kind)
            .await
            .map_err(|e| format!("cannot resolve {} {}: {}", target.api_version, target.kind, e))?;

        let api: Api<DynamicObject> = match scope {
            Scope::Namespaced => {
                let namespace = target
                    .namespace
                    .clone()
                    .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());
                set_namespace(&mut obj, &namespace);
                Api::namespaced_with(self.client.clone(), &namespace, &ar)
            }
            Scope::Cluster => Api::all_with(self.client.clone(), &ar),
        };

        let params = PatchParams::apply(FIELD_MANAGER).force();
        api.patch(&target.name, &params, &Patch::Apply(&obj))
            .await
            .map_err(|e| e.to_string())?;

        debug!(
            document = %doc.file_name,
            kind = %target.kind,
            name = %target.name,
            "Applied"
        );

        if target.kind == "CustomResourceDefinition" {
            wait_for_crd_established(&self.client, &target.name, self.crd_timeout)
                .await
                .map_err(|e| e.to_string())?;
        }

        Ok(())
    }
}

fn set_namespace(obj: &mut Value, namespace: &str) {
    if let Some(metadata) = obj.get_mut("metadata").and_then(Value::as_object_mut) {
        metadata.insert(
            "namespace".to_string(),
            Value::String(namespace.to_string()),
        );
    }
}
