//! Subscription coordination: turning `/subscribe`, `/unsubscribe` and
//! `/alert` into consistent mutations of the service/subscription
//! documents, and keeping already-bound agents in sync as capacity
//! shifts underneath them.
//!
//! `subscribe` and `alert` both read-modify-write the service and
//! subscription documents and may trigger placement, so both run under
//! one process-wide cooperative lock — a single writer at a time, not a
//! read/write split, matching the reference controller's global `locked`
//! flag (reimplemented here as a real `tokio::sync::Mutex` rather than a
//! busy-waited boolean). `unsubscribe` takes the same lock directly since
//! it is reachable over HTTP independently of the other two; `/deploypod`
//! deliberately does not — it is an operator escape hatch, not part of
//! the coordinated subscription flow.

use std::sync::Arc;

use tracing::{info, instrument, warn};

use crate::agent_client::{AgentClient, ServiceChange};
use crate::allocator::{self, AllocationStatus, Strategy};
use crate::domain::{Service, Subscription};
use crate::error::{Error, Result};
use crate::placement::Placement;
use crate::store::{DocumentStore, Documents};

pub struct SubscribeOutcome {
    pub host_ip: String,
    pub host_port: u16,
    pub frequency: f64,
}

pub struct Coordinator {
    store: Arc<dyn DocumentStore>,
    placement: Placement,
    agent_client: Arc<dyn AgentClient>,
    strategy: Strategy,
    lock: tokio::sync::Mutex<()>,
}

impl Coordinator {
    pub fn new(store: Arc<dyn DocumentStore>, placement: Placement, agent_client: Arc<dyn AgentClient>, strategy: Strategy) -> Self {
        Self {
            store,
            placement,
            agent_client,
            strategy,
            lock: tokio::sync::Mutex::new(()),
        }
    }

    fn docs(&self) -> Documents<'_> {
        Documents::new(self.store.as_ref())
    }

    #[instrument(skip(self))]
    pub async fn subscribe(&self, agent_ip: &str, agent_port: u16, service_type: &str) -> Result<SubscribeOutcome> {
        if agent_ip.is_empty() || service_type.is_empty() {
            return Err(Error::Validation("ip and serviceType are required".into()));
        }

        let docs = self.docs();
        let service_specs = docs.load_service_specs().await?;
        if !service_specs.iter().any(|s| s.service_type == service_type) {
            return Err(Error::Validation(format!("unknown serviceType {service_type}")));
        }

        let _guard = self.lock.lock().await;

        let mut subscriptions = docs.load_subscriptions().await?;
        let agent_counter = 1 + subscriptions.iter().filter(|s| s.service_type == service_type).count() as u32;

        let services = docs.load_services().await?;
        let (mut relation, reconfigured) = self.compute_frequency(service_type, agent_counter, services, &service_specs).await;

        let new_agent_counter: u32 = relation.iter().filter(|s| s.service_type == service_type).map(|s| s.current_connection).sum();

        if new_agent_counter == agent_counter - 1 {
            return Err(Error::SubscriptionRejected);
        }
        if new_agent_counter != agent_counter {
            return Err(Error::Internal(format!(
                "newAgentCounter={new_agent_counter} does not match agentCounter={agent_counter}"
            )));
        }

        docs.save_services(&relation).await?;
        for rtype in reconfigured.iter().filter(|t| t.as_str() != service_type) {
            self.adjust_frequency(rtype, &relation, &mut subscriptions).await?;
        }

        let Some(index) = self.adjust_frequency(service_type, &relation, &mut subscriptions).await? else {
            return Err(Error::Internal("adjust_frequency found no free slot for the new agent".into()));
        };

        subscriptions.push(Subscription {
            agent_ip: agent_ip.to_string(),
            agent_port,
            service_type: service_type.to_string(),
            pod_ip: relation[index].pod_ip.clone(),
            node_name: relation[index].node_name.clone(),
        });
        docs.save_subscriptions(&subscriptions).await?;

        let outcome = SubscribeOutcome {
            host_ip: std::mem::take(&mut relation[index].host_ip),
            host_port: relation[index].host_port,
            frequency: relation[index].current_frequency,
        };
        Ok(outcome)
    }

    #[instrument(skip(self))]
    pub async fn unsubscribe(&self, agent_ip: &str, agent_port: u16) -> Result<()> {
        let _guard = self.lock.lock().await;
        let docs = self.docs();

        let subscriptions = docs.load_subscriptions().await?;
        let mut pod_ips = std::collections::HashSet::new();
        let mut remaining = Vec::with_capacity(subscriptions.len());
        for sub in subscriptions {
            if sub.agent_ip == agent_ip && sub.agent_port == agent_port {
                pod_ips.insert(sub.pod_ip.clone());
            } else {
                remaining.push(sub);
            }
        }
        docs.save_subscriptions(&remaining).await?;

        let mut services = docs.load_services().await?;
        if services.is_empty() {
            return Err(Error::NotFound("no services deployed".into()));
        }
        for svc in services.iter_mut() {
            if pod_ips.contains(&svc.pod_ip) {
                svc.current_connection = svc.current_connection.saturating_sub(1);
            }
        }
        docs.save_services(&services).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn alert_workernode_failure(&self, node_name: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        let docs = self.docs();

        let services = docs.load_services().await?;
        let (failed, mut remaining): (Vec<Service>, Vec<Service>) =
            services.into_iter().partition(|s| s.node_name == node_name);
        docs.save_services(&remaining).await?;

        let service_specs = docs.load_service_specs().await?;

        for failed_service in &failed {
            let pod_name = failed_service.pod_name().to_string();
            self.placement_cluster().delete_pod(&pod_name).await.ok();

            if failed_service.current_connection == 0 {
                continue;
            }

            let mut subscriptions = docs.load_subscriptions().await?;
            let agent_counter = subscriptions.iter().filter(|s| s.service_type == failed_service.service_type).count() as u32;
            let (relation, _) = self
                .compute_frequency(&failed_service.service_type, agent_counter, remaining.clone(), &service_specs)
                .await;

            let new_agent_counter: u32 = relation
                .iter()
                .filter(|s| s.service_type == failed_service.service_type)
                .map(|s| s.current_connection)
                .sum();
            if new_agent_counter < agent_counter {
                drop_excess_subscribers(&mut subscriptions, &failed_service.pod_ip, agent_counter - new_agent_counter);
                docs.save_subscriptions(&subscriptions).await?;
            }

            docs.save_services(&relation).await?;
            remaining = relation.clone();
            self.adjust_frequency(&failed_service.service_type, &relation, &mut subscriptions).await?;
            docs.save_subscriptions(&subscriptions).await?;
        }
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn alert_pod_failure(&self, pod_name: &str) -> Result<()> {
        let parsed: crate::domain::PodName = pod_name
            .parse()
            .map_err(|_| Error::Validation(format!("malformed pod name {pod_name}")))?;

        let _guard = self.lock.lock().await;
        let docs = self.docs();

        self.placement_cluster().delete_pod(pod_name).await.ok();

        let mut services = docs.load_services().await?;
        let failed_index = services
            .iter()
            .position(|s| s.service_type == parsed.service_type && s.node_name == parsed.node_name && s.host_port == parsed.host_port);
        let Some(failed_index) = failed_index else {
            return Err(Error::NotFound(format!("no service entry for pod {pod_name}")));
        };
        let failed = services.remove(failed_index);
        docs.save_services(&services).await?;

        if failed.current_connection != 0 {
            let mut subscriptions = docs.load_subscriptions().await?;
            let agent_counter = subscriptions.iter().filter(|s| s.service_type == failed.service_type).count() as u32;
            let service_specs = docs.load_service_specs().await?;
            let (relation, _) = self
                .compute_frequency(&failed.service_type, agent_counter, services.clone(), &service_specs)
                .await;

            let new_agent_counter: u32 = relation.iter().filter(|s| s.service_type == failed.service_type).map(|s| s.current_connection).sum();
            if new_agent_counter < agent_counter {
                drop_excess_subscribers(&mut subscriptions, &failed.pod_ip, agent_counter - new_agent_counter);
            }
            docs.save_subscriptions(&subscriptions).await?;
            docs.save_services(&relation).await?;
            self.adjust_frequency(&failed.service_type, &relation, &mut subscriptions).await?;
            docs.save_subscriptions(&subscriptions).await?;
        }
        Ok(())
    }

    fn placement_cluster(&self) -> &dyn crate::cluster::ClusterDriver {
        self.placement.cluster_driver()
    }

    /// The `/deploypod` escape hatch: deploy directly at an
    /// operator-chosen node/hostPort. Not guarded by `self.lock` — it is
    /// invoked independently of the coordinated subscribe/alert flow.
    pub async fn deploy_pod_at(&self, service_type: &str, node_name: &str, host_port: u16, amount: u32) -> Result<()> {
        let docs = self.docs();
        let service_specs = docs.load_service_specs().await?;
        let services = docs.load_services().await?;
        let services = self
            .placement
            .deploy_pod_at(service_type, node_name, host_port, amount, &service_specs, services)
            .await?;
        docs.save_services(&services).await
    }

    /// Ensure `service_type` has enough feasible capacity for
    /// `agent_counter` agents, deploying a new pod if the current fleet
    /// can't clear the default frequency floor. Returns the recomputed
    /// service list plus which service types besides `service_type`
    /// changed as a side effect of making room.
    ///
    /// Never fails: a deploy failure (no eligible node, missing
    /// manifest, cluster unreachable) doesn't abort the request, it just
    /// leaves the fleet as it stood. The reference `compute_frequnecy`
    /// has the same shape — `deploy_service` there has no return value
    /// at all, so a failed deploy is silently a no-op and the retry loop
    /// backs the requested agent count off until what's actually there
    /// can serve it. The caller compares the settled connection count
    /// against what it asked for to decide whether to reject.
    async fn compute_frequency(
        &self,
        service_type: &str,
        agent_counter: u32,
        services: Vec<Service>,
        service_specs: &[crate::domain::ServiceSpec],
    ) -> (Vec<Service>, Vec<String>) {
        let has_instance = services.iter().any(|s| s.service_type == service_type);

        if has_instance {
            let (status, candidate) = allocator::allocate(self.strategy, service_type, agent_counter, services.clone());
            let under_floor = candidate
                .iter()
                .filter(|s| s.service_type == service_type)
                .any(|s| s.current_frequency < s.frequency_limit.default);
            let feasible = status == AllocationStatus::Success;

            if feasible && !under_floor {
                return (candidate, Vec::new());
            }

            // Below the default floor (or outright infeasible): try to
            // add capacity before backing off the requested count.
            let (base, reconfigured) = self.try_add_capacity(service_type, service_specs, services).await;
            let settled = self.rerun_until_feasible(service_type, agent_counter, base).await;
            return (settled, reconfigured);
        }

        let (base, reconfigured) = self.try_add_capacity(service_type, service_specs, services).await;
        let settled = self.rerun_until_feasible(service_type, agent_counter, base).await;
        (settled, reconfigured)
    }

    /// Attempt to add capacity for `service_type`. A deploy failure is
    /// logged and swallowed rather than propagated — see
    /// [`Coordinator::compute_frequency`].
    async fn try_add_capacity(
        &self,
        service_type: &str,
        service_specs: &[crate::domain::ServiceSpec],
        services: Vec<Service>,
    ) -> (Vec<Service>, Vec<String>) {
        match self.placement.deploy_service(service_type, service_specs, services.clone()).await {
            Ok(outcome) => (outcome.services, outcome.reconfigured_types),
            Err(e) => {
                warn!(service_type, error = %e, "could not add capacity, falling back to the existing fleet");
                (services, Vec::new())
            }
        }
    }

    /// After placement adds capacity (or fails to), re-run the
    /// allocator, backing off the requested agent count one at a time
    /// until it's feasible (mirrors the reference implementation's
    /// retry loop). Stops at zero rather than going negative, which the
    /// reference would do forever if even a single agent can't be
    /// served.
    async fn rerun_until_feasible(&self, service_type: &str, mut agent_counter: u32, mut services: Vec<Service>) -> Vec<Service> {
        loop {
            let (status, candidate) = allocator::allocate(self.strategy, service_type, agent_counter, services.clone());
            if status == AllocationStatus::Success || agent_counter == 0 {
                return candidate;
            }
            agent_counter -= 1;
            services = candidate;
        }
    }

    /// Reassign `service_type` subscribers across `services`' freshly
    /// recomputed connection counts, notifying every agent whose
    /// frequency or endpoint changed. Returns the index into `services`
    /// of a pod entry with a still-unclaimed connection slot, if any —
    /// the coordinator hands that slot to whichever agent it is currently
    /// subscribing.
    async fn adjust_frequency(&self, service_type: &str, services: &[Service], subscriptions: &mut [Subscription]) -> Result<Option<usize>> {
        struct Budget {
            index: usize,
            remaining: u32,
        }
        let mut budgets: Vec<(String, Budget)> = services
            .iter()
            .enumerate()
            .filter(|(_, s)| s.service_type == service_type)
            .map(|(i, s)| {
                (
                    s.pod_ip.clone(),
                    Budget {
                        index: i,
                        remaining: s.current_connection,
                    },
                )
            })
            .collect();

        let mut to_reconfigure = Vec::new();
        for (i, sub) in subscriptions.iter().enumerate() {
            if sub.service_type != service_type {
                continue;
            }
            if let Some((_, budget)) = budgets.iter_mut().find(|(pod_ip, _)| pod_ip == &sub.pod_ip) {
                if budget.remaining != 0 {
                    budget.remaining -= 1;
                    let svc = &services[budget.index];
                    self.notify_staying(sub, svc).await;
                    continue;
                }
            }
            to_reconfigure.push(i);
        }

        for sub_index in to_reconfigure {
            let Some((pod_ip, budget)) = budgets.iter_mut().find(|(_, b)| b.remaining != 0) else {
                continue;
            };
            budget.remaining -= 1;
            let svc = &services[budget.index];
            let sub = &mut subscriptions[sub_index];
            self.notify_moving(sub, svc).await;
            sub.pod_ip = pod_ip.clone();
            sub.node_name = svc.node_name.clone();
        }

        Ok(budgets.into_iter().find(|(_, b)| b.remaining != 0).map(|(_, b)| b.index))
    }

    async fn notify_staying(&self, sub: &Subscription, svc: &Service) {
        let change = ServiceChange {
            service_name: svc.service_type.clone(),
            ip: "null".to_string(),
            port: 0,
            frequency: svc.current_frequency,
        };
        if let Err(e) = self.agent_client.notify(&sub.agent_ip, sub.agent_port, &change).await {
            warn!(agent = %sub.agent_ip, error = %e, "failed to notify agent of frequency change");
        }
    }

    async fn notify_moving(&self, sub: &Subscription, svc: &Service) {
        let change = ServiceChange {
            service_name: svc.service_type.clone(),
            ip: svc.host_ip.clone(),
            port: svc.host_port,
            frequency: svc.current_frequency,
        };
        info!(agent = %sub.agent_ip, new_pod = %svc.pod_ip, "moving agent to a new pod");
        if let Err(e) = self.agent_client.notify(&sub.agent_ip, sub.agent_port, &change).await {
            warn!(agent = %sub.agent_ip, error = %e, "failed to notify agent of pod move");
        }
    }
}

/// Drop `count` subscribers of `pod_ip`, preferring the tail of the list
/// (most recently subscribed first), matching the reference
/// implementation's reverse scan.
fn drop_excess_subscribers(subscriptions: &mut Vec<Subscription>, pod_ip: &str, count: u32) {
    let mut dropped = 0;
    let mut i = subscriptions.len();
    while i > 0 && dropped < count {
        i -= 1;
        if subscriptions[i].pod_ip == pod_ip {
            subscriptions.remove(i);
            dropped += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drop_excess_prefers_tail() {
        let mut subs = vec![
            Subscription { agent_ip: "a".into(), agent_port: 1, service_type: "pose".into(), pod_ip: "p1".into(), node_name: "n1".into() },
            Subscription { agent_ip: "b".into(), agent_port: 2, service_type: "pose".into(), pod_ip: "p1".into(), node_name: "n1".into() },
            Subscription { agent_ip: "c".into(), agent_port: 3, service_type: "pose".into(), pod_ip: "p1".into(), node_name: "n1".into() },
        ];
        drop_excess_subscribers(&mut subs, "p1", 2);
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].agent_ip, "a");
    }
}
