//! End-to-end scenarios against an in-memory document store, a mock
//! cluster driver and a recording agent client — no real cluster or
//! network I/O.

use std::sync::Arc;

use arha_controller::agent_client::recording::RecordingAgentClient;
use arha_controller::allocator::Strategy;
use arha_controller::cluster::mock::MockClusterDriver;
use arha_controller::cluster::ClusterDriver;
use arha_controller::coordinator::Coordinator;
use arha_controller::domain::{FrequencyLimit, Service, ServiceSpec, Subscription};
use arha_controller::placement::Placement;
use arha_controller::store::{DocumentStore, Documents, InMemoryDocumentStore};

fn pose_spec() -> ServiceSpec {
    ServiceSpec {
        service_type: "pose".into(),
        work_ability: [("n1".to_string(), 10.0), ("n2".to_string(), 25.0)].into(),
        frequency_limit: FrequencyLimit::new(5.0, 3.0),
        gpu_memory_request: 2048,
    }
}

fn service(pod_ip: &str, node_name: &str, host_port: u16, workload_limit: f64, current_connection: u32) -> Service {
    Service {
        pod_ip: pod_ip.to_string(),
        host_ip: format!("10.0.0.{host_port}"),
        host_port,
        node_name: node_name.to_string(),
        service_type: "pose".to_string(),
        current_connection,
        frequency_limit: FrequencyLimit::new(5.0, 3.0),
        current_frequency: 5.0,
        workload_limit,
    }
}

async fn build_coordinator() -> (Coordinator, Arc<InMemoryDocumentStore>, Arc<RecordingAgentClient>) {
    let store = Arc::new(InMemoryDocumentStore::new());
    let cluster: Arc<dyn ClusterDriver> = Arc::new(MockClusterDriver::new());
    let agent_client = Arc::new(RecordingAgentClient::new());
    let dyn_store: Arc<dyn DocumentStore> = store.clone();
    let placement = Placement::new(
        cluster,
        dyn_store.clone(),
        "service_yaml",
        30_500..=30_999,
        std::time::Duration::from_millis(10),
        1,
        Strategy::WorkloadAware,
    );
    let dyn_agent: Arc<dyn arha_controller::agent_client::AgentClient> = agent_client.clone();
    let coordinator = Coordinator::new(dyn_store, placement, dyn_agent, Strategy::WorkloadAware);
    (coordinator, store, agent_client)
}

/// S1: a single fresh pod, one agent subscribes at default frequency.
#[tokio::test]
async fn s1_fresh_subscribe() {
    let (coordinator, store, _agents) = build_coordinator().await;
    let docs = Documents::new(store.as_ref());
    docs.save_service_specs(&[pose_spec()]).await.unwrap();
    docs.save_services(&[service("10.0.0.1", "n1", 30500, 10.0, 0)]).await.unwrap();

    let outcome = coordinator.subscribe("1.1.1.1", 9000, "pose").await.unwrap();
    assert_eq!(outcome.host_ip, "10.0.0.30500");
    assert_eq!(outcome.host_port, 30500);
    assert_eq!(outcome.frequency, 5.0);

    let services = docs.load_services().await.unwrap();
    assert_eq!(services[0].current_connection, 1);
    let subs = docs.load_subscriptions().await.unwrap();
    assert_eq!(subs.len(), 1);
}

/// S3: scaling reject when no eligible node exists for a new pod.
#[tokio::test]
async fn s3_scaling_reject_with_no_eligible_node() {
    let (coordinator, store, _agents) = build_coordinator().await;
    let docs = Documents::new(store.as_ref());
    docs.save_service_specs(&[pose_spec()]).await.unwrap();
    docs.save_services(&[service("10.0.0.1", "n1", 30500, 5.0, 1)]).await.unwrap();
    docs.save_subscriptions(&[Subscription {
        agent_ip: "1.1.1.1".into(),
        agent_port: 9000,
        service_type: "pose".into(),
        pod_ip: "10.0.0.1".into(),
        node_name: "n1".into(),
    }])
    .await
    .unwrap();

    // No computing nodes are registered with the mock cluster driver, so
    // placement cannot find room for a second pod: the subscription is
    // rejected rather than degraded below the minimum frequency.
    let err = coordinator.subscribe("2.2.2.2", 9001, "pose").await.unwrap_err();
    assert_eq!(err.to_string(), "reject the subscription");

    let services = docs.load_services().await.unwrap();
    assert_eq!(services[0].current_connection, 1);
    assert!(docs.load_subscriptions().await.unwrap().is_empty());
}

/// S4: degraded placement once default-rate room runs out, still feasible.
#[tokio::test]
async fn s4_degraded_placement() {
    let (coordinator, store, _agents) = build_coordinator().await;
    let docs = Documents::new(store.as_ref());
    docs.save_service_specs(&[pose_spec()]).await.unwrap();
    docs.save_services(&[service("10.0.0.1", "n1", 30500, 9.0, 1)]).await.unwrap();
    docs.save_subscriptions(&[Subscription {
        agent_ip: "1.1.1.1".into(),
        agent_port: 9000,
        service_type: "pose".into(),
        pod_ip: "10.0.0.1".into(),
        node_name: "n1".into(),
    }])
    .await
    .unwrap();

    let outcome = coordinator.subscribe("3.3.3.3", 9002, "pose").await.unwrap();
    assert_eq!(outcome.frequency, 4.5);

    let services = docs.load_services().await.unwrap();
    assert_eq!(services[0].current_connection, 2);
    assert_eq!(services[0].current_frequency, 4.5);
}

/// S6: unsubscribing releases the connection slot and removes the subscription.
#[tokio::test]
async fn s6_unsubscribe() {
    let (coordinator, store, _agents) = build_coordinator().await;
    let docs = Documents::new(store.as_ref());
    docs.save_service_specs(&[pose_spec()]).await.unwrap();
    docs.save_services(&[service("10.0.0.1", "n1", 30500, 10.0, 0)]).await.unwrap();

    coordinator.subscribe("1.1.1.1", 9000, "pose").await.unwrap();
    coordinator.unsubscribe("1.1.1.1", 9000).await.unwrap();

    let services = docs.load_services().await.unwrap();
    assert_eq!(services[0].current_connection, 0);
    assert!(docs.load_subscriptions().await.unwrap().is_empty());
}

/// S5: a node failure re-homes its agents onto the surviving pod when
/// capacity allows, and each re-homed agent is notified once.
#[tokio::test]
async fn s5_node_failure_rehomes_agents() {
    let (coordinator, store, agents) = build_coordinator().await;
    let docs = Documents::new(store.as_ref());
    docs.save_service_specs(&[pose_spec()]).await.unwrap();
    docs.save_services(&[
        service("10.0.0.1", "n1", 30500, 15.0, 2),
        service("10.0.0.2", "n2", 30501, 25.0, 2),
    ])
    .await
    .unwrap();
    docs.save_subscriptions(&[
        Subscription { agent_ip: "a1".into(), agent_port: 1, service_type: "pose".into(), pod_ip: "10.0.0.1".into(), node_name: "n1".into() },
        Subscription { agent_ip: "a2".into(), agent_port: 2, service_type: "pose".into(), pod_ip: "10.0.0.1".into(), node_name: "n1".into() },
        Subscription { agent_ip: "a3".into(), agent_port: 3, service_type: "pose".into(), pod_ip: "10.0.0.2".into(), node_name: "n2".into() },
        Subscription { agent_ip: "a4".into(), agent_port: 4, service_type: "pose".into(), pod_ip: "10.0.0.2".into(), node_name: "n2".into() },
    ])
    .await
    .unwrap();

    coordinator.alert_workernode_failure("n1").await.unwrap();

    let services = docs.load_services().await.unwrap();
    assert_eq!(services.len(), 1);
    assert_eq!(services[0].node_name, "n2");
    assert_eq!(services[0].current_connection, 4);

    let subs = docs.load_subscriptions().await.unwrap();
    assert_eq!(subs.len(), 4);
    assert!(subs.iter().all(|s| s.pod_ip == "10.0.0.2"));

    // a1 and a2 (ex-n1) must each have gotten one reconfiguration call
    // pointing at the survivor; a3/a4 were already there and may have
    // just had their frequency refreshed.
    let calls = agents.calls().await;
    assert!(calls.iter().any(|c| c.agent_ip == "a1"));
    assert!(calls.iter().any(|c| c.agent_ip == "a2"));
}
