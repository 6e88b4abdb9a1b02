//! Target provisioning with Cluster API and the AWS provider
//!
//! The provisioner drives `clusterawsadm` and `clusterctl` against the
//! bootstrap cluster, waits for the Cluster to come up, then installs the
//! CNI on the target. Nothing is rolled back on failure.

use std::fmt;
use std::path::Path;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use kube::api::{Api, DynamicObject, GroupVersionKind};
use kube::discovery::ApiResource;
use kube::Client;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use gokp_common::kube_utils::{
    create_client, get_secret_data, is_not_found, parse_api_version, wait_for_nodes_ready,
    wait_with_timeout,
};
use gokp_common::retry::{retry_with_backoff, RetryConfig};
use gokp_common::{Error, Result};
use gokp_move::CAPI_API_VERSION;

use crate::apply::Applier;
use crate::manifest::split;
use crate::process::{run_captured, run_streaming};
use crate::run::{ClusterEndpoint, WorkflowRun};
use crate::workspace::{CAPI_INSTALL_DIR, CNI_DIR, CNI_FILE, INSTALL_CLUSTER_FILE};

/// Calico manifest installed as the target's CNI
pub const CALICO_MANIFEST_URL: &str =
    "https://raw.githubusercontent.com/projectcalico/calico/v3.26.1/manifests/calico.yaml";

/// Namespace `clusterctl generate cluster` places the Cluster in
pub const CLUSTER_NAMESPACE: &str = "default";

/// Worker replicas requested for every cluster
pub const WORKER_MACHINE_COUNT: u32 = 3;

/// AWS credentials passed to clusterawsadm and clusterctl
#[derive(Clone)]
pub struct AwsCredentials {
    /// Region to deploy into
    pub region: String,
    /// Access key id
    pub access_key_id: String,
    /// Secret access key
    pub secret_access_key: String,
    /// Existing EC2 key pair name for the instances
    pub ssh_key_name: String,
}

impl fmt::Debug for AwsCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AwsCredentials")
            .field("region", &self.region)
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("ssh_key_name", &self.ssh_key_name)
            .finish()
    }
}

/// Shape of the cluster to create
#[derive(Debug, Clone)]
pub struct InfraSpec {
    /// Kubernetes version, e.g. `v1.28.3`
    pub kubernetes_version: String,
    /// Instance type of control plane machines
    pub control_plane_machine: String,
    /// Instance type of worker machines
    pub node_machine: String,
    /// Three control plane replicas instead of one
    pub ha: bool,
    /// Skip creating the IAM CloudFormation stack
    pub skip_cloud_formation: bool,
    /// How long to wait for the cluster to become ready
    pub provision_timeout: Duration,
}

impl InfraSpec {
    /// Control plane replica count
    pub fn control_plane_count(&self) -> u32 {
        if self.ha {
            3
        } else {
            1
        }
    }
}

/// Environment for clusterawsadm and clusterctl
pub fn aws_environment(credentials: &AwsCredentials, infra: &InfraSpec) -> Vec<(String, String)> {
    vec![
        ("AWS_REGION".to_string(), credentials.region.clone()),
        ("AWS_ACCESS_KEY_ID".to_string(), credentials.access_key_id.clone()),
        (
            "AWS_SECRET_ACCESS_KEY".to_string(),
            credentials.secret_access_key.clone(),
        ),
        ("AWS_SSH_KEY_NAME".to_string(), credentials.ssh_key_name.clone()),
        (
            "AWS_CONTROL_PLANE_MACHINE_TYPE".to_string(),
            infra.control_plane_machine.clone(),
        ),
        ("AWS_NODE_MACHINE_TYPE".to_string(), infra.node_machine.clone()),
    ]
}

/// Creates the target cluster from the bootstrap cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Provision the target and return its endpoint once it is reachable
    /// with a CNI installed
    async fn provision(
        &self,
        bootstrap: &ClusterEndpoint,
        infra: &InfraSpec,
        run: &WorkflowRun,
        cancel: &CancellationToken,
    ) -> Result<ClusterEndpoint>;

    /// Install the same Cluster API providers on the target before a pivot
    async fn prepare_management(&self, target: &ClusterEndpoint, run: &WorkflowRun) -> Result<()>;
}

/// How far a Cluster has come
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    /// Provisioned with control plane and infrastructure ready
    Ready,
    /// Infrastructure ready and the first control plane node is up, but the
    /// control plane cannot report ready until a CNI is installed
    Initialized,
    /// Still working, with the current phase
    Pending(String),
    /// Will never become ready
    Failed(String),
}

/// Point in provisioning a wait is satisfied at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Milestone {
    /// API server reachable and kubeconfig secret published
    ControlPlaneInitialized,
    /// Control plane reports ready
    Ready,
}

impl Milestone {
    /// Whether `readiness` satisfies this milestone
    pub fn reached(&self, readiness: &Readiness) -> bool {
        match self {
            Milestone::ControlPlaneInitialized => {
                matches!(readiness, Readiness::Initialized | Readiness::Ready)
            }
            Milestone::Ready => matches!(readiness, Readiness::Ready),
        }
    }
}

fn has_true_condition(status: Option<&Value>, condition_type: &str) -> bool {
    status
        .and_then(|s| s.get("conditions"))
        .and_then(Value::as_array)
        .map(|conditions| {
            conditions.iter().any(|c| {
                c.get("type").and_then(Value::as_str) == Some(condition_type)
                    && c.get("status").and_then(Value::as_str) == Some("True")
            })
        })
        .unwrap_or(false)
}

/// Classify a Cluster object by its status
pub fn assess_cluster(obj: &Value) -> Readiness {
    let status = obj.get("status");
    let field = |name: &str| status.and_then(|s| s.get(name));
    let flag = |name: &str| field(name).and_then(Value::as_bool).unwrap_or(false);

    let phase = field("phase").and_then(Value::as_str).unwrap_or("Pending");

    let failure = ["failureReason", "failureMessage"]
        .iter()
        .filter_map(|name| field(name).and_then(Value::as_str))
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>();
    if phase == "Failed" || !failure.is_empty() {
        let reason = if failure.is_empty() {
            "cluster phase is Failed".to_string()
        } else {
            failure.join(": ")
        };
        return Readiness::Failed(reason);
    }

    if !flag("infrastructureReady") {
        return Readiness::Pending(phase.to_string());
    }
    if phase == "Provisioned" && flag("controlPlaneReady") {
        Readiness::Ready
    } else if has_true_condition(status, "ControlPlaneInitialized") {
        Readiness::Initialized
    } else {
        Readiness::Pending(phase.to_string())
    }
}

/// [`Provisioner`] backed by clusterctl and the Cluster API AWS provider
pub struct CapaProvisioner {
    http: reqwest::Client,
    cni_manifest_url: String,
    poll_interval: Duration,
    api_server_retry: RetryConfig,
    nodes_ready_timeout: Duration,
}

impl Default for CapaProvisioner {
    fn default() -> Self {
        Self {
            http: reqwest::Client::new(),
            cni_manifest_url: CALICO_MANIFEST_URL.to_string(),
            poll_interval: Duration::from_secs(30),
            api_server_retry: RetryConfig {
                max_attempts: 12,
                initial_delay: Duration::from_secs(2),
                max_delay: Duration::from_secs(30),
                backoff_multiplier: 2.0,
            },
            nodes_ready_timeout: Duration::from_secs(600),
        }
    }
}

impl CapaProvisioner {
    /// AWS environment plus the encoded credentials clusterctl needs
    async fn provider_environment(&self, run: &WorkflowRun) -> Result<Vec<(String, String)>> {
        let mut env = aws_environment(&run.credentials, &run.infra);
        let encoded = run_captured(
            "clusterawsadm",
            &["bootstrap", "credentials", "encode-as-profile"],
            env.clone(),
            None,
        )
        .await?;
        env.push((
            "AWS_B64ENCODED_CREDENTIALS".to_string(),
            encoded.trim().to_string(),
        ));
        Ok(env)
    }

    async fn generate_cluster(
        &self,
        run: &WorkflowRun,
        env: &[(String, String)],
        bootstrap: &ClusterEndpoint,
    ) -> Result<String> {
        let control_plane = run.infra.control_plane_count().to_string();
        let workers = WORKER_MACHINE_COUNT.to_string();
        run_captured(
            "clusterctl",
            &[
                "generate",
                "cluster",
                &run.cluster_name,
                "--kubernetes-version",
                &run.infra.kubernetes_version,
                "--control-plane-machine-count",
                &control_plane,
                "--worker-machine-count",
                &workers,
                "--infrastructure",
                "aws",
            ],
            env.to_vec(),
            Some(&bootstrap.kubeconfig),
        )
        .await
    }

    async fn wait_for_cluster(
        &self,
        client: &Client,
        cluster: &str,
        milestone: Milestone,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let (group, version) = parse_api_version(CAPI_API_VERSION);
        let ar = ApiResource::from_gvk_with_plural(
            &GroupVersionKind::gvk(&group, &version, "Cluster"),
            "clusters",
        );
        let clusters: Api<DynamicObject> =
            Api::namespaced_with(client.clone(), CLUSTER_NAMESPACE, &ar);
        let secret_name = format!("{}-kubeconfig", cluster);
        let description = match milestone {
            Milestone::ControlPlaneInitialized => {
                format!("cluster {} control plane to initialize", cluster)
            }
            Milestone::Ready => format!("cluster {} to become ready", cluster),
        };

        wait_with_timeout(timeout, self.poll_interval, &description, cancel, || async {
            let obj = match clusters.get(cluster).await {
                Ok(obj) => obj,
                Err(e) if is_not_found(&e) => return Ok(None),
                Err(e) => {
                    debug!(error = %e, "Cluster status unavailable, retrying");
                    return Ok(None);
                }
            };
            let value = serde_json::to_value(&obj)?;

            let readiness = assess_cluster(&value);
            if let Readiness::Failed(reason) = &readiness {
                return Err(Error::provision_failed(
                    cluster,
                    format!("will never become ready: {}", reason),
                ));
            }
            if !milestone.reached(&readiness) {
                match readiness {
                    Readiness::Pending(phase) => info!("Cluster phase: {}", phase),
                    _ => info!("Control plane initialized, waiting for it to report ready"),
                }
                return Ok(None);
            }
            if milestone == Milestone::Ready {
                return Ok(Some(()));
            }

            match get_secret_data(client, &secret_name, CLUSTER_NAMESPACE, "value").await {
                Ok(Some(_)) => Ok(Some(())),
                Ok(None) => Ok(None),
                Err(e) => {
                    debug!(error = %e, "Kubeconfig secret unavailable, retrying");
                    Ok(None)
                }
            }
        })
        .await
        .map_err(|e| match e {
            Error::Timeout { seconds, .. } => Error::Timeout {
                what: format!("cluster {} (still provisioning)", cluster),
                seconds,
            },
            other => other,
        })
    }

    async fn write_target_kubeconfig(
        &self,
        bootstrap_client: &Client,
        cluster: &str,
        path: &Path,
    ) -> Result<()> {
        let secret_name = format!("{}-kubeconfig", cluster);
        let kubeconfig = get_secret_data(bootstrap_client, &secret_name, CLUSTER_NAMESPACE, "value")
            .await?
            .ok_or_else(|| {
                Error::provision_failed(cluster, format!("secret {} has no value", secret_name))
            })?;
        std::fs::write(path, kubeconfig)
            .map_err(|e| Error::resource(path, format!("failed to write kubeconfig: {}", e)))
    }

    async fn wait_for_api_server(&self, kubeconfig: &Path) -> Result<Client> {
        retry_with_backoff(&self.api_server_retry, "target API server", || async {
            let client = create_client(kubeconfig).await?;
            client
                .apiserver_version()
                .await
                .map_err(|e| Error::transport("target API server", e.to_string()))?;
            Ok::<_, Error>(client)
        })
        .await
    }

    async fn install_cni(&self, run: &WorkflowRun, client: &Client) -> Result<()> {
        info!("Installing CNI");
        let response = self
            .http
            .get(&self.cni_manifest_url)
            .send()
            .await
            .map_err(|e| Error::transport("cni download", e.to_string()))?;
        if !response.status().is_success() {
            return Err(Error::transport(
                "cni download",
                format!("HTTP {} from {}", response.status(), self.cni_manifest_url),
            ));
        }
        let manifest = response
            .text()
            .await
            .map_err(|e| Error::transport("cni download", e.to_string()))?;

        let cni_file = run.workspace.join(CNI_FILE);
        std::fs::write(&cni_file, &manifest)
            .map_err(|e| Error::resource(&cni_file, format!("failed to write: {}", e)))?;

        let set = split(&manifest, "cni");
        set.write_to(&run.workspace.join(CNI_DIR))?;
        Applier::new(client.clone()).apply(&set).await
    }
}

#[async_trait]
impl Provisioner for CapaProvisioner {
    async fn provision(
        &self,
        bootstrap: &ClusterEndpoint,
        infra: &InfraSpec,
        run: &WorkflowRun,
        cancel: &CancellationToken,
    ) -> Result<ClusterEndpoint> {
        let cluster = run.cluster_name.as_str();

        if infra.skip_cloud_formation {
            info!("Skipping CloudFormation stack creation");
        } else {
            info!("Creating CloudFormation stack");
            run_streaming(
                "clusterawsadm",
                &["bootstrap", "iam", "create-cloudformation-stack"],
                aws_environment(&run.credentials, infra),
                None,
            )
            .await?;
        }

        let env = self.provider_environment(run).await?;

        info!("Installing Cluster API providers on the bootstrap cluster");
        run_streaming(
            "clusterctl",
            &["init", "--infrastructure", "aws", "--wait-providers"],
            env.clone(),
            Some(&bootstrap.kubeconfig),
        )
        .await?;

        let request = self.generate_cluster(run, &env, bootstrap).await?;
        let request_file = run.workspace.join(INSTALL_CLUSTER_FILE);
        std::fs::write(&request_file, &request)
            .map_err(|e| Error::resource(&request_file, format!("failed to write: {}", e)))?;

        let set = split(&request, "install-cluster");
        set.write_to(&run.workspace.join(CAPI_INSTALL_DIR))?;

        let bootstrap_client = bootstrap.client().await?;
        info!(cluster = %cluster, "Submitting cluster request");
        Applier::new(bootstrap_client.clone()).apply(&set).await?;

        info!(
            cluster = %cluster,
            timeout_secs = infra.provision_timeout.as_secs(),
            "Waiting for cluster to be provisioned"
        );
        let started = Instant::now();
        self.wait_for_cluster(
            &bootstrap_client,
            cluster,
            Milestone::ControlPlaneInitialized,
            infra.provision_timeout,
            cancel,
        )
        .await?;

        let kubeconfig = run.target_kubeconfig();
        self.write_target_kubeconfig(&bootstrap_client, cluster, &kubeconfig)
            .await?;
        let target_client = self.wait_for_api_server(&kubeconfig).await?;

        // Nodes stay NotReady, and so does the control plane, until a CNI runs
        self.install_cni(run, &target_client).await?;

        self.wait_for_cluster(
            &bootstrap_client,
            cluster,
            Milestone::Ready,
            infra.provision_timeout.saturating_sub(started.elapsed()),
            cancel,
        )
        .await?;
        wait_for_nodes_ready(&target_client, self.nodes_ready_timeout).await?;

        info!(cluster = %cluster, "Target cluster is ready");
        Ok(ClusterEndpoint::target(cluster, kubeconfig))
    }

    async fn prepare_management(&self, target: &ClusterEndpoint, run: &WorkflowRun) -> Result<()> {
        info!("Installing Cluster API providers on {}", target.name);
        let env = self.provider_environment(run).await?;
        run_streaming(
            "clusterctl",
            &["init", "--infrastructure", "aws", "--wait-providers"],
            env,
            Some(&target.kubeconfig),
        )
        .await
    }
}
