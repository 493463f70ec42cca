//! Placement: deciding which node gets a new pod, carving out its
//! workload budget, and deploying it.
//!
//! A node is eligible for a new instance of `serviceType` when it is
//! healthy, does not already host that service type, has enough spare GPU
//! memory for every co-tenant plus the new service, and — after the new
//! service is added — every co-tenant (and the new service itself) still
//! clears its default send-frequency floor. Among eligible nodes the one
//! that leaves the new service the most per-node workload wins.
//!
//! Adding a pod shrinks the per-instance `work_ability` share of every
//! other service type already on that node (the divisor is "how many
//! service types share this node now"), so their `workload_limit` is
//! recomputed and the allocator is re-run for each affected type before
//! the new pod is created. [`PlacementOutcome`] carries the whole new
//! `services` snapshot plus which service types were touched, so the
//! coordinator can re-notify only those agents.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use tracing::{info, instrument, warn};

use crate::allocator::{self, Strategy};
use crate::cluster::{ClusterDriver, ComputingNode};
use crate::domain::{NodeStatus, Service, ServiceSpec};
use crate::error::{Error, Result};
use crate::store::DocumentStore;

pub struct PlacementOutcome {
    pub services: Vec<Service>,
    /// Service types whose `Service` entries changed as a side effect of
    /// carving out room for the new deployment, in addition to the new
    /// service type itself. The coordinator re-runs `adjust_frequency` for
    /// each of these.
    pub reconfigured_types: Vec<String>,
}

struct NodeCandidate {
    node_name: String,
    host_ip: String,
    workload_after_deploy: f64,
}

pub struct Placement {
    cluster: std::sync::Arc<dyn ClusterDriver>,
    store: std::sync::Arc<dyn DocumentStore>,
    manifest_dir: PathBuf,
    host_port_range: std::ops::RangeInclusive<u16>,
    pod_ready_poll_interval: Duration,
    pod_ready_max_polls: u32,
    strategy: Strategy,
}

impl Placement {
    pub fn new(
        cluster: std::sync::Arc<dyn ClusterDriver>,
        store: std::sync::Arc<dyn DocumentStore>,
        manifest_dir: impl Into<PathBuf>,
        host_port_range: std::ops::RangeInclusive<u16>,
        pod_ready_poll_interval: Duration,
        pod_ready_max_polls: u32,
        strategy: Strategy,
    ) -> Self {
        Self {
            cluster,
            store,
            manifest_dir: manifest_dir.into(),
            host_port_range,
            pod_ready_poll_interval,
            pod_ready_max_polls,
            strategy,
        }
    }

    pub fn cluster_driver(&self) -> &dyn ClusterDriver {
        self.cluster.as_ref()
    }

    /// Deploy one new instance of `service_type`, carving its workload
    /// budget out of the best eligible node. On any failure the returned
    /// error carries no partial state — `services` is only mutated in the
    /// success path, which is built from a private working copy.
    ///
    /// Node health is re-probed here, not read from a stale snapshot:
    /// a node that failed since the last `/alert` or startup sync must
    /// not be picked as a deploy target just because nobody has told the
    /// controller about it yet.
    #[instrument(skip(self, service_specs, services), fields(service_type))]
    pub async fn deploy_service(
        &self,
        service_type: &str,
        service_specs: &[ServiceSpec],
        services: Vec<Service>,
    ) -> Result<PlacementOutcome> {
        let spec = service_specs
            .iter()
            .find(|s| s.service_type == service_type)
            .ok_or_else(|| Error::Validation(format!("unknown serviceType {service_type}")))?;

        let spec_by_type: HashMap<&str, &ServiceSpec> =
            service_specs.iter().map(|s| (s.service_type.as_str(), s)).collect();

        let node_status = crate::init::sync_node_status(&self.cluster, &self.store).await?;
        let nodes = self.cluster.list_computing_nodes().await?;
        let nodes_by_name: HashMap<&str, &ComputingNode> = nodes.iter().map(|n| (n.name.as_str(), n)).collect();

        let candidate = self.find_node(spec, &spec_by_type, &services, &node_status, &nodes_by_name)?;
        let Some(candidate) = candidate else {
            return Err(Error::NoComputingResource);
        };

        // Work on a private copy; only commit to the caller on success.
        let mut working = services.clone();
        let mut reconfigured = Vec::new();

        let co_tenant_count = working
            .iter()
            .filter(|s| s.node_name == candidate.node_name)
            .count()
            + 1;
        let co_tenant_types: Vec<String> = working
            .iter()
            .filter(|s| s.node_name == candidate.node_name)
            .map(|s| s.service_type.clone())
            .collect::<std::collections::HashSet<_>>()
            .into_iter()
            .collect();

        for ctype in &co_tenant_types {
            let work_ability = spec_by_type[ctype.as_str()].work_ability[&candidate.node_name];
            let new_limit = work_ability / co_tenant_count as f64;
            for svc in working.iter_mut().filter(|s| s.node_name == candidate.node_name && &s.service_type == ctype) {
                svc.workload_limit = new_limit;
            }
            let before = working.clone();
            let total_connections: u32 = working
                .iter()
                .filter(|s| &s.service_type == ctype)
                .map(|s| s.current_connection)
                .sum();
            let (status, reflowed) = allocator::allocate(self.strategy, ctype, total_connections, working);
            if !status.is_success() {
                return Err(Error::NoComputingResource);
            }
            working = reflowed;
            if working != before {
                reconfigured.push(ctype.clone());
            }
        }

        let used_ports: std::collections::HashSet<u16> = working.iter().map(|s| s.host_port).collect();
        let mut host_port = *self.host_port_range.start();
        let pod = loop {
            host_port = self.next_free_port(host_port, &used_ports)?;
            match self.try_deploy_pod(service_type, host_port, &candidate.node_name).await? {
                Some(pod) => break pod,
                None => {
                    host_port += 1;
                    continue;
                }
            }
        };

        let pod_ip = pod.pod_ip.clone().unwrap_or_default();
        let host_ip = pod.host_ip.clone().unwrap_or_default();
        self.wait_for_ready(&format!("{service_type}-{}-{host_port}", candidate.node_name))
            .await;

        working.push(Service {
            pod_ip,
            host_ip,
            host_port,
            node_name: candidate.node_name.clone(),
            service_type: service_type.to_string(),
            current_connection: 0,
            frequency_limit: spec.frequency_limit,
            current_frequency: spec.frequency_limit.default,
            workload_limit: spec.work_ability[&candidate.node_name] / co_tenant_count as f64,
        });

        Ok(PlacementOutcome {
            services: working,
            reconfigured_types: reconfigured,
        })
    }

    fn find_node(
        &self,
        spec: &ServiceSpec,
        spec_by_type: &HashMap<&str, &ServiceSpec>,
        services: &[Service],
        node_status: &NodeStatus,
        nodes_by_name: &HashMap<&str, &ComputingNode>,
    ) -> Result<Option<NodeCandidate>> {
        let mut best: Option<NodeCandidate> = None;

        for node_name in spec.work_ability.keys() {
            if !node_status.get(node_name).map(|h| h.is_healthy()).unwrap_or(false) {
                continue;
            }
            let Some(node) = nodes_by_name.get(node_name.as_str()) else {
                continue;
            };

            let co_tenants: Vec<&Service> = services.iter().filter(|s| &s.node_name == node_name).collect();
            if co_tenants.iter().any(|s| s.service_type == spec.service_type) {
                continue;
            }

            let gpu_request: u64 = co_tenants
                .iter()
                .map(|s| spec_by_type.get(s.service_type.as_str()).map(|sp| sp.gpu_memory_request).unwrap_or(0))
                .sum::<u64>()
                + spec.gpu_memory_request;
            if gpu_request > node.gpu_memory {
                continue;
            }

            let co_tenant_count = co_tenants.len() + 1;
            let mut feasible = true;
            for ctype in co_tenants.iter().map(|s| &s.service_type).collect::<std::collections::HashSet<_>>() {
                let Some(ctype_spec) = spec_by_type.get(ctype.as_str()) else {
                    feasible = false;
                    break;
                };
                let Some(work_ability) = ctype_spec.work_ability.get(node_name) else {
                    feasible = false;
                    break;
                };
                if work_ability / co_tenant_count as f64 < ctype_spec.frequency_limit.default {
                    feasible = false;
                    break;
                }
            }
            if !feasible {
                continue;
            }

            let Some(own_work_ability) = spec.work_ability.get(node_name) else {
                continue;
            };
            let workload_after_deploy = own_work_ability / co_tenant_count as f64;
            if workload_after_deploy < spec.frequency_limit.default {
                continue;
            }

            if best.as_ref().map(|b| workload_after_deploy > b.workload_after_deploy).unwrap_or(true) {
                best = Some(NodeCandidate {
                    node_name: node_name.clone(),
                    host_ip: node.internal_ip.clone(),
                    workload_after_deploy,
                });
            }
        }

        Ok(best)
    }

    fn next_free_port(&self, from: u16, used: &std::collections::HashSet<u16>) -> Result<u16> {
        (from..=*self.host_port_range.end())
            .find(|p| !used.contains(p))
            .ok_or(Error::NoComputingResource)
    }

    /// Attempt to create the pod at `host_port`. Returns `Ok(None)` if the
    /// port is occupied by a terminating pod of a prior generation — the
    /// caller should pick the next port and retry, mirroring the
    /// reference implementation's `deploy_pod` returning `None`.
    async fn try_deploy_pod(&self, service_type: &str, host_port: u16, node_name: &str) -> Result<Option<crate::cluster::PodStatus>> {
        let pod_name = format!("{service_type}-{node_name}-{host_port}");
        if self.cluster.is_pod_terminating(&pod_name).await? {
            warn!(pod = %pod_name, "pod is terminating, choosing another hostPort");
            return Ok(None);
        }

        let mut manifest = self.load_manifest(service_type)?;
        manifest.metadata.name = Some(pod_name.clone());
        if let Some(spec) = manifest.spec.as_mut() {
            if let Some(container) = spec.containers.first_mut() {
                if let Some(ports) = container.ports.as_mut() {
                    if let Some(port) = ports.first_mut() {
                        port.host_port = Some(host_port.into());
                    }
                }
            }
            spec.node_selector = Some([("kubernetes.io/hostname".to_string(), node_name.to_string())].into());
        }

        self.cluster.create_pod(manifest).await?;
        info!(pod = %pod_name, "pod create requested");

        loop {
            if let Some(status) = self.cluster.read_pod(&pod_name).await? {
                if status.is_scheduled() {
                    return Ok(Some(status));
                }
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }

    async fn wait_for_ready(&self, pod_name: &str) {
        for attempt in 0..self.pod_ready_max_polls {
            match self.cluster.read_pod(pod_name).await {
                Ok(Some(status)) if status.ready => {
                    info!(pod = %pod_name, "pod is ready");
                    return;
                }
                Ok(_) => {}
                Err(e) => warn!(pod = %pod_name, error = %e, "readiness poll failed"),
            }
            if attempt + 1 == self.pod_ready_max_polls {
                warn!(pod = %pod_name, "pod still not ready after readiness budget, keeping it anyway");
                return;
            }
            tokio::time::sleep(self.pod_ready_poll_interval).await;
        }
    }

    fn load_manifest(&self, service_type: &str) -> Result<Pod> {
        let path: PathBuf = self.manifest_dir.join(format!("{service_type}.yaml"));
        let file = std::fs::File::open(&path)
            .map_err(|e| Error::Internal(format!("manifest {} not found: {e}", path.display())))?;
        serde_yaml::from_reader(file).map_err(|e| Error::Internal(format!("malformed manifest {}: {e}", path.display())))
    }

    /// `/deploypod`: an operator-triggered manual deployment at a specific
    /// node/hostPort, bypassing node-eligibility search entirely. Not
    /// guarded by the subscription coordinator's lock.
    #[instrument(skip(self, service_specs, services))]
    pub async fn deploy_pod_at(
        &self,
        service_type: &str,
        node_name: &str,
        host_port: u16,
        amount_on_node: u32,
        service_specs: &[ServiceSpec],
        mut services: Vec<Service>,
    ) -> Result<Vec<Service>> {
        if amount_on_node == 0 {
            return Err(Error::Validation("amount must be at least 1".into()));
        }
        let spec = service_specs
            .iter()
            .find(|s| s.service_type == service_type)
            .ok_or_else(|| Error::Validation(format!("unknown serviceType {service_type}")))?;
        let work_ability = spec
            .work_ability
            .get(node_name)
            .copied()
            .ok_or_else(|| Error::Validation(format!("no workAbility entry for node {node_name}")))?;

        let pod_name = format!("{service_type}-{node_name}-{host_port}");
        let mut manifest = self.load_manifest(service_type)?;
        manifest.metadata.name = Some(pod_name);
        if let Some(mspec) = manifest.spec.as_mut() {
            if let Some(container) = mspec.containers.first_mut() {
                if let Some(ports) = container.ports.as_mut() {
                    if let Some(port) = ports.first_mut() {
                        port.host_port = Some(host_port.into());
                    }
                }
            }
            mspec.node_selector = Some([("kubernetes.io/hostname".to_string(), node_name.to_string())].into());
        }
        self.cluster.create_pod(manifest.clone()).await?;

        let status = loop {
            if let Some(status) = self.cluster.read_pod(manifest.metadata.name.as_deref().unwrap_or_default()).await? {
                if status.is_scheduled() {
                    break status;
                }
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        };

        services.push(Service {
            pod_ip: status.pod_ip.unwrap_or_default(),
            host_ip: status.host_ip.unwrap_or_default(),
            host_port,
            node_name: node_name.to_string(),
            service_type: service_type.to_string(),
            current_connection: 0,
            frequency_limit: spec.frequency_limit,
            current_frequency: spec.frequency_limit.default,
            workload_limit: work_ability / f64::from(amount_on_node),
        });
        Ok(services)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::mock::MockClusterDriver;
    use crate::domain::FrequencyLimit;
    use crate::store::InMemoryDocumentStore;

    fn pose_spec(work_ability: &[(&str, f64)]) -> ServiceSpec {
        ServiceSpec {
            service_type: "pose".into(),
            work_ability: work_ability.iter().map(|(n, w)| (n.to_string(), *w)).collect(),
            frequency_limit: FrequencyLimit::new(5.0, 3.0),
            gpu_memory_request: 2048,
        }
    }

    fn placement_with(cluster: std::sync::Arc<dyn ClusterDriver>, store: std::sync::Arc<dyn DocumentStore>) -> Placement {
        Placement::new(cluster, store, "service_yaml", 30_500..=30_999, Duration::from_millis(5), 1, Strategy::WorkloadAware)
    }

    #[tokio::test]
    async fn deploy_service_rejects_node_over_gpu_budget() {
        let cluster = std::sync::Arc::new(MockClusterDriver::new());
        cluster
            .seed_node(ComputingNode { name: "n1".into(), internal_ip: "10.0.0.1".into(), gpu_memory: 1024 }, true)
            .await;
        let cluster: std::sync::Arc<dyn ClusterDriver> = cluster;
        let store: std::sync::Arc<dyn DocumentStore> = std::sync::Arc::new(InMemoryDocumentStore::new());
        let placement = placement_with(cluster, store);

        let spec = pose_spec(&[("n1", 10.0)]);
        let result = placement.deploy_service("pose", &[spec], Vec::new()).await;
        assert!(matches!(result, Err(Error::NoComputingResource)));
    }

    #[tokio::test]
    async fn deploy_service_skips_unhealthy_node() {
        let cluster = std::sync::Arc::new(MockClusterDriver::new());
        cluster
            .seed_node(ComputingNode { name: "n1".into(), internal_ip: "10.0.0.1".into(), gpu_memory: 8192 }, false)
            .await;
        let cluster: std::sync::Arc<dyn ClusterDriver> = cluster;
        let store: std::sync::Arc<dyn DocumentStore> = std::sync::Arc::new(InMemoryDocumentStore::new());
        let placement = placement_with(cluster, store);

        let spec = pose_spec(&[("n1", 10.0)]);
        let result = placement.deploy_service("pose", &[spec], Vec::new()).await;
        assert!(matches!(result, Err(Error::NoComputingResource)));
    }

    #[tokio::test]
    async fn deploy_service_picks_node_with_largest_workload_share() {
        let cluster = std::sync::Arc::new(MockClusterDriver::new());
        cluster
            .seed_node(ComputingNode { name: "small".into(), internal_ip: "10.0.0.1".into(), gpu_memory: 8192 }, true)
            .await;
        cluster
            .seed_node(ComputingNode { name: "big".into(), internal_ip: "10.0.0.2".into(), gpu_memory: 8192 }, true)
            .await;
        let cluster: std::sync::Arc<dyn ClusterDriver> = cluster;
        let store: std::sync::Arc<dyn DocumentStore> = std::sync::Arc::new(InMemoryDocumentStore::new());
        let placement = placement_with(cluster, store);

        let spec = pose_spec(&[("small", 10.0), ("big", 100.0)]);
        let outcome = placement.deploy_service("pose", &[spec], Vec::new()).await.unwrap();
        assert_eq!(outcome.services.len(), 1);
        assert_eq!(outcome.services[0].node_name, "big");
        assert_eq!(outcome.services[0].workload_limit, 100.0);
    }

    #[tokio::test]
    async fn deploy_service_excludes_node_already_hosting_the_type() {
        let cluster = std::sync::Arc::new(MockClusterDriver::new());
        cluster
            .seed_node(ComputingNode { name: "n1".into(), internal_ip: "10.0.0.1".into(), gpu_memory: 8192 }, true)
            .await;
        let cluster: std::sync::Arc<dyn ClusterDriver> = cluster;
        let store: std::sync::Arc<dyn DocumentStore> = std::sync::Arc::new(InMemoryDocumentStore::new());
        let placement = placement_with(cluster, store);

        let existing = Service {
            pod_ip: "10.200.0.9".into(),
            host_ip: "10.0.0.1".into(),
            host_port: 30500,
            node_name: "n1".into(),
            service_type: "pose".into(),
            current_connection: 0,
            frequency_limit: FrequencyLimit::new(5.0, 3.0),
            current_frequency: 5.0,
            workload_limit: 10.0,
        };

        let spec = pose_spec(&[("n1", 10.0)]);
        let result = placement.deploy_service("pose", &[spec], vec![existing]).await;
        assert!(matches!(result, Err(Error::NoComputingResource)));
    }

    #[test]
    fn next_free_port_skips_used_ports() {
        let cluster: std::sync::Arc<dyn ClusterDriver> = std::sync::Arc::new(MockClusterDriver::new());
        let store: std::sync::Arc<dyn DocumentStore> = std::sync::Arc::new(InMemoryDocumentStore::new());
        let placement = placement_with(cluster, store);

        let used: std::collections::HashSet<u16> = [30_500, 30_501].into_iter().collect();
        assert_eq!(placement.next_free_port(30_500, &used).unwrap(), 30_502);
    }

    #[test]
    fn next_free_port_exhausted_range_fails() {
        let cluster: std::sync::Arc<dyn ClusterDriver> = std::sync::Arc::new(MockClusterDriver::new());
        let store: std::sync::Arc<dyn DocumentStore> = std::sync::Arc::new(InMemoryDocumentStore::new());
        let placement = Placement::new(cluster, store, "service_yaml", 30_500..=30_500, Duration::from_millis(5), 1, Strategy::WorkloadAware);

        let used: std::collections::HashSet<u16> = [30_500].into_iter().collect();
        assert!(matches!(placement.next_free_port(30_500, &used), Err(Error::NoComputingResource)));
    }

    #[tokio::test]
    async fn deploy_pod_at_bypasses_eligibility_search() {
        let cluster: std::sync::Arc<dyn ClusterDriver> = std::sync::Arc::new(MockClusterDriver::new());
        let store: std::sync::Arc<dyn DocumentStore> = std::sync::Arc::new(InMemoryDocumentStore::new());
        let placement = placement_with(cluster, store);

        let spec = pose_spec(&[("n1", 10.0)]);
        let services = placement
            .deploy_pod_at("pose", "n1", 30_777, 2, &[spec], Vec::new())
            .await
            .unwrap();
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].host_port, 30_777);
        assert_eq!(services[0].workload_limit, 5.0);
    }
}
