//! Shared Kubernetes utilities using kube-rs
//!
//! Client construction from workspace kubeconfigs, discovery-backed resource
//! resolution, and the bounded wait helpers every component uses.

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Node, Secret};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, GroupVersionKind, ListParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::discovery::{ApiResource, Scope};
use kube::{Client, Config};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::{Error, Result};

/// Default interval between polls in wait helpers
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Connection timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Read timeout for kube clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Result type for polling check functions.
///
/// - `Ok(Some(value))` - condition met, stop and return the value
/// - `Ok(None)` - not yet, keep polling
/// - `Err(e)` - the condition can never be met, stop immediately
pub type PollResult<T> = Result<Option<T>>;

/// Poll `check_fn` until it yields a value, fails, times out or is cancelled.
///
/// A timeout means "not there yet" and is reported as [`Error::Timeout`];
/// a check error means "never going to be there" and is returned as is.
pub async fn wait_with_timeout<T, F, Fut>(
    timeout: Duration,
    interval: Duration,
    description: &str,
    cancel: &CancellationToken,
    mut check_fn: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = PollResult<T>>,
{
    let start = Instant::now();

    loop {
        if cancel.is_cancelled() {
            return Err(Error::cancelled(format!("wait for {}", description)));
        }

        if let Some(value) = check_fn().await? {
            return Ok(value);
        }

        if start.elapsed() >= timeout {
            return Err(Error::timeout(description, timeout));
        }

        debug!("Waiting for {}...", description);
        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(Error::cancelled(format!("wait for {}", description)));
            }
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

/// Poll until `check_fn` returns `Ok(true)`.
///
/// Errors from the check are treated as transient and polled through; use
/// [`wait_with_timeout`] when a check can detect a terminal failure.
pub async fn poll_until<F, Fut>(
    timeout: Duration,
    interval: Duration,
    description: &str,
    mut check_fn: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let start = Instant::now();

    loop {
        match check_fn().await {
            Ok(true) => return Ok(()),
            Ok(false) => trace!("{} not met yet", description),
            Err(e) => trace!("Polling {} returned error (retrying): {}", description, e),
        }

        if start.elapsed() >= timeout {
            return Err(Error::timeout(description, timeout));
        }

        tokio::time::sleep(interval).await;
    }
}

/// Create a kube client from a kubeconfig file in the workspace
pub async fn create_client(kubeconfig: &Path) -> Result<Client> {
    let kc = Kubeconfig::read_from(kubeconfig).map_err(|e| {
        Error::resource(kubeconfig, format!("failed to read kubeconfig: {}", e))
    })?;
    let mut config = Config::from_custom_kubeconfig(kc, &KubeConfigOptions::default())
        .await
        .map_err(|e| {
            Error::resource(kubeconfig, format!("failed to load kubeconfig: {}", e))
        })?;
    config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
    config.read_timeout = Some(DEFAULT_READ_TIMEOUT);

    Client::try_from(config)
        .map_err(|e| Error::transport("kube client", format!("failed to create client: {}", e)))
}

/// Split an apiVersion into (group, version). Core types have an empty group.
///
/// ```
/// use gokp_common::kube_utils::parse_api_version;
///
/// assert_eq!(parse_api_version("cluster.x-k8s.io/v1beta1"), ("cluster.x-k8s.io".to_string(), "v1beta1".to_string()));
/// assert_eq!(parse_api_version("v1"), (String::new(), "v1".to_string()));
/// ```
pub fn parse_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// Resolve an apiVersion/kind to its served resource and scope using discovery.
///
/// Queries the API group on every call, so types whose CRD was created a
/// moment ago are found without a stale cache.
pub async fn resolve_api_resource(
    client: &Client,
    api_version: &str,
    kind: &str,
) -> Result<(ApiResource, Scope)> {
    let (group, version) = parse_api_version(api_version);
    let gvk = GroupVersionKind::gvk(&group, &version, kind);
    let (ar, caps) = kube::discovery::pinned_kind(client, &gvk).await?;
    Ok((ar, caps.scope))
}

/// Whether a kube error is an API 404
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

/// Whether a kube error is an API 409
pub fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 409)
}

/// Whether a kube error is a server-side 5xx (webhooks not serving yet, etc.)
pub fn is_server_error(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code >= 500)
}

fn condition_is_true<'a>(
    mut conditions: impl Iterator<Item = (&'a str, &'a str)>,
    condition_type: &str,
) -> bool {
    conditions.any(|(type_, status)| type_ == condition_type && status == "True")
}

/// Wait for every node to report Ready
pub async fn wait_for_nodes_ready(client: &Client, timeout: Duration) -> Result<()> {
    let nodes: Api<Node> = Api::all(client.clone());

    poll_until(timeout, DEFAULT_POLL_INTERVAL, "nodes to be ready", || async {
        let list = nodes.list(&ListParams::default()).await?;
        if list.items.is_empty() {
            return Ok(false);
        }

        Ok(list.items.iter().all(|node| {
            let conditions = node
                .status
                .as_ref()
                .and_then(|s| s.conditions.as_deref())
                .unwrap_or_default();
            condition_is_true(
                conditions.iter().map(|c| (c.type_.as_str(), c.status.as_str())),
                "Ready",
            )
        }))
    })
    .await?;

    info!("All nodes are Ready");
    Ok(())
}

/// Wait for a deployment to report Available
pub async fn wait_for_deployment(
    client: &Client,
    name: &str,
    namespace: &str,
    timeout: Duration,
) -> Result<()> {
    let deployments: Api<Deployment> = Api::namespaced(client.clone(), namespace);
    let description = format!("deployment {}/{} to be available", namespace, name);

    poll_until(timeout, DEFAULT_POLL_INTERVAL, &description, || async {
        match deployments.get(name).await {
            Ok(deployment) => {
                let conditions = deployment
                    .status
                    .as_ref()
                    .and_then(|s| s.conditions.as_deref())
                    .unwrap_or_default();
                Ok(condition_is_true(
                    conditions.iter().map(|c| (c.type_.as_str(), c.status.as_str())),
                    "Available",
                ))
            }
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    })
    .await
}

/// Wait for a CRD to be Established so its kind can be served
pub async fn wait_for_crd_established(
    client: &Client,
    crd_name: &str,
    timeout: Duration,
) -> Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let description = format!("CRD {} to be established", crd_name);

    poll_until(timeout, Duration::from_secs(1), &description, || async {
        match crds.get(crd_name).await {
            Ok(crd) => {
                let conditions = crd
                    .status
                    .as_ref()
                    .and_then(|s| s.conditions.as_deref())
                    .unwrap_or_default();
                Ok(condition_is_true(
                    conditions.iter().map(|c| (c.type_.as_str(), c.status.as_str())),
                    "Established",
                ))
            }
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    })
    .await?;

    debug!(crd = %crd_name, "CRD established");
    Ok(())
}

/// Read one key of a secret. Returns `None` if the secret or key does not exist.
pub async fn get_secret_data(
    client: &Client,
    name: &str,
    namespace: &str,
    key: &str,
) -> Result<Option<Vec<u8>>> {
    let secrets: Api<Secret> = Api::namespaced(client.clone(), namespace);

    match secrets.get(name).await {
        Ok(secret) => Ok(secret
            .data
            .as_ref()
            .and_then(|d| d.get(key))
            .map(|v| v.0.clone())),
        Err(e) if is_not_found(&e) => Ok(None),
        Err(e) => Err(e.into()),
    }
}
