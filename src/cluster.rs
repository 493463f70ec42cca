//! Cluster driver: everything that touches node and pod objects directly,
//! as opposed to the document store's custom resources.
//!
//! Computing nodes are discovered by the `arha-node-type=computing-node`
//! label; their GPU budget comes from the `nvidia.com/gpu.memory` label.
//! Health is probed out-of-band over HTTP (`GET http://{ip}:10248/healthz`)
//! rather than through the Kubernetes API, mirroring kubelet's own
//! healthz endpoint.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::Client;
use tracing::{instrument, warn};

use crate::error::{Error, Result};

pub const NODE_TYPE_LABEL: &str = "arha-node-type";
pub const COMPUTING_NODE: &str = "computing-node";
pub const GPU_MEMORY_LABEL: &str = "nvidia.com/gpu.memory";
pub const HEALTHZ_PORT: u16 = 10248;

/// A discovered computing node: name, internal IP, and GPU memory budget.
#[derive(Debug, Clone, PartialEq)]
pub struct ComputingNode {
    pub name: String,
    pub internal_ip: String,
    pub gpu_memory: u64,
}

/// A pod's scheduling outcome, as observed after creation: node, pod IP and
/// host IP are populated once the scheduler has bound it.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PodStatus {
    pub node_name: Option<String>,
    pub pod_ip: Option<String>,
    pub host_ip: Option<String>,
    pub ready: bool,
    pub terminating: bool,
}

impl PodStatus {
    pub fn is_scheduled(&self) -> bool {
        self.node_name.is_some() && self.pod_ip.is_some() && self.host_ip.is_some()
    }
}

/// Node and pod operations the placement engine and initializer depend on.
#[async_trait]
pub trait ClusterDriver: Send + Sync {
    /// List every node labeled as a computing node.
    async fn list_computing_nodes(&self) -> Result<Vec<ComputingNode>>;

    /// Probe a node's kubelet healthz endpoint. Never returns an error:
    /// any failure to reach the node is reported as unhealthy, matching
    /// how the reference implementation treats a missing IP or a failed
    /// request as `"unhealthy"` rather than propagating a fault.
    async fn probe_health(&self, internal_ip: &str) -> bool;

    /// Create a pod from `manifest`, which already carries its name,
    /// hostPort and node selector. Returns its status immediately after
    /// the create call returns (not after it schedules).
    async fn create_pod(&self, manifest: Pod) -> Result<()>;

    /// Read a pod's current status by name.
    async fn read_pod(&self, pod_name: &str) -> Result<Option<PodStatus>>;

    /// Delete a pod by name. Deleting a pod that doesn't exist is not an
    /// error.
    async fn delete_pod(&self, pod_name: &str) -> Result<()>;

    /// Whether a pod exists and carries a `deletionTimestamp`.
    async fn is_pod_terminating(&self, pod_name: &str) -> Result<bool>;
}

pub struct KubeClusterDriver {
    client: Client,
    namespace: String,
    http: reqwest::Client,
}

impl KubeClusterDriver {
    pub fn new(client: Client, namespace: impl Into<String>, health_probe_timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(health_probe_timeout)
            .build()
            .expect("default TLS backend is always available");
        Self {
            client,
            namespace: namespace.into(),
            http,
        }
    }

    fn nodes_api(&self) -> Api<Node> {
        Api::all(self.client.clone())
    }

    fn pods_api(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }
}

#[async_trait]
impl ClusterDriver for KubeClusterDriver {
    #[instrument(skip(self))]
    async fn list_computing_nodes(&self) -> Result<Vec<ComputingNode>> {
        let selector = format!("{NODE_TYPE_LABEL}={COMPUTING_NODE}");
        let nodes = self
            .nodes_api()
            .list(&ListParams::default().labels(&selector))
            .await
            .map_err(Error::Cluster)?;

        let mut out = Vec::new();
        for node in nodes {
            let Some(name) = node.metadata.name.clone() else {
                continue;
            };
            let internal_ip = node
                .status
                .as_ref()
                .and_then(|s| s.addresses.as_ref())
                .and_then(|addrs| addrs.iter().find(|a| a.type_ == "InternalIP"))
                .map(|a| a.address.clone());
            let Some(internal_ip) = internal_ip else {
                warn!(node = %name, "node has no InternalIP, skipping");
                continue;
            };
            let gpu_memory = node
                .metadata
                .labels
                .as_ref()
                .and_then(|l| l.get(GPU_MEMORY_LABEL))
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
            out.push(ComputingNode {
                name,
                internal_ip,
                gpu_memory,
            });
        }
        Ok(out)
    }

    #[instrument(skip(self))]
    async fn probe_health(&self, internal_ip: &str) -> bool {
        probe_health_at(&self.http, &format!("http://{internal_ip}:{HEALTHZ_PORT}/healthz")).await
    }

    #[instrument(skip(self, manifest))]
    async fn create_pod(&self, manifest: Pod) -> Result<()> {
        self.pods_api()
            .create(&PostParams::default(), &manifest)
            .await
            .map_err(Error::Cluster)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn read_pod(&self, pod_name: &str) -> Result<Option<PodStatus>> {
        match self.pods_api().get(pod_name).await {
            Ok(pod) => Ok(Some(pod_status(&pod))),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(None),
            Err(e) => Err(Error::Cluster(e)),
        }
    }

    #[instrument(skip(self))]
    async fn delete_pod(&self, pod_name: &str) -> Result<()> {
        match self.pods_api().delete(pod_name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(Error::Cluster(e)),
        }
    }

    #[instrument(skip(self))]
    async fn is_pod_terminating(&self, pod_name: &str) -> Result<bool> {
        match self.pods_api().get(pod_name).await {
            Ok(pod) => Ok(pod.metadata.deletion_timestamp.is_some()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(false),
            Err(e) => Err(Error::Cluster(e)),
        }
    }
}

/// `GET url`, 1s-scoped by the caller's client timeout; healthy only if
/// the response is a success status whose trimmed body is `"ok"`,
/// case-insensitive. A request that fails outright (timeout, connection
/// refused, DNS) is reported unhealthy rather than propagated as an
/// error — an unreachable node is indistinguishable from an unhealthy one.
async fn probe_health_at(http: &reqwest::Client, url: &str) -> bool {
    match http.get(url).send().await {
        Ok(resp) if resp.status().is_success() => match resp.text().await {
            Ok(body) => body.trim().eq_ignore_ascii_case("ok"),
            Err(_) => false,
        },
        Ok(_) | Err(_) => false,
    }
}

fn pod_status(pod: &Pod) -> PodStatus {
    let ready = pod
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conds| conds.iter().any(|c| c.type_ == "Ready" && c.status == "True"))
        .unwrap_or(false);
    PodStatus {
        node_name: pod.spec.as_ref().and_then(|s| s.node_name.clone()),
        pod_ip: pod.status.as_ref().and_then(|s| s.pod_ip.clone()),
        host_ip: pod.status.as_ref().and_then(|s| s.host_ip.clone()),
        ready,
        terminating: pod.metadata.deletion_timestamp.is_some(),
    }
}

/// In-memory `ClusterDriver` for tests: nodes and pods are seeded directly,
/// health is driven by an explicit healthy-set rather than real HTTP.
pub mod mock {
    use super::*;
    use tokio::sync::RwLock;

    #[derive(Default)]
    pub struct MockClusterDriver {
        pub nodes: RwLock<Vec<ComputingNode>>,
        pub healthy: RwLock<HashMap<String, bool>>,
        pub pods: RwLock<HashMap<String, PodStatus>>,
    }

    impl MockClusterDriver {
        pub fn new() -> Self {
            Self::default()
        }

        pub async fn seed_node(&self, node: ComputingNode, healthy: bool) {
            self.healthy.write().await.insert(node.internal_ip.clone(), healthy);
            self.nodes.write().await.push(node);
        }
    }

    #[async_trait]
    impl ClusterDriver for MockClusterDriver {
        async fn list_computing_nodes(&self) -> Result<Vec<ComputingNode>> {
            Ok(self.nodes.read().await.clone())
        }

        async fn probe_health(&self, internal_ip: &str) -> bool {
            self.healthy.read().await.get(internal_ip).copied().unwrap_or(false)
        }

        async fn create_pod(&self, manifest: Pod) -> Result<()> {
            let name = manifest
                .metadata
                .name
                .clone()
                .ok_or_else(|| Error::Internal("pod manifest missing name".into()))?;
            let node_name = manifest
                .spec
                .as_ref()
                .and_then(|s| s.node_selector.as_ref())
                .and_then(|sel| sel.get("kubernetes.io/hostname"))
                .cloned();
            self.pods.write().await.insert(
                name,
                PodStatus {
                    node_name,
                    pod_ip: Some("10.200.0.1".into()),
                    host_ip: Some("10.0.0.1".into()),
                    ready: true,
                    terminating: false,
                },
            );
            Ok(())
        }

        async fn read_pod(&self, pod_name: &str) -> Result<Option<PodStatus>> {
            Ok(self.pods.read().await.get(pod_name).cloned())
        }

        async fn delete_pod(&self, pod_name: &str) -> Result<()> {
            self.pods.write().await.remove(pod_name);
            Ok(())
        }

        async fn is_pod_terminating(&self, pod_name: &str) -> Result<bool> {
            Ok(self
                .pods
                .read()
                .await
                .get(pod_name)
                .map(|p| p.terminating)
                .unwrap_or(false))
        }
    }
}
