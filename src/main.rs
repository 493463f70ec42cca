use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use arha_controller::agent_client::HttpAgentClient;
use arha_controller::cluster::KubeClusterDriver;
use arha_controller::config::Config;
use arha_controller::coordinator::Coordinator;
use arha_controller::init::sync_node_status;
use arha_controller::placement::Placement;
use arha_controller::store::KubeDocumentStore;
use arha_controller::{http, logging};

#[tokio::main]
async fn main() -> arha_controller::error::Result<()> {
    logging::init();

    let config = Config::parse();
    info!(port = config.port, namespace = %config.namespace, optimizer = ?config.optimizer, "starting controller");

    let mut kube_config = kube::Config::infer().await.map_err(|e| arha_controller::error::Error::Internal(e.to_string()))?;
    kube_config.read_timeout = Some(config.cluster_timeout());
    kube_config.write_timeout = Some(config.cluster_timeout());
    let client = kube::Client::try_from(kube_config).map_err(arha_controller::error::Error::Cluster)?;

    let store: Arc<dyn arha_controller::store::DocumentStore> = Arc::new(KubeDocumentStore::new(
        client.clone(),
        config.namespace.clone(),
        config.crd_group.clone(),
        config.crd_version.clone(),
    ));

    let cluster: Arc<dyn arha_controller::cluster::ClusterDriver> = Arc::new(KubeClusterDriver::new(
        client,
        config.namespace.clone(),
        config.health_probe_timeout(),
    ));

    if let Err(e) = sync_node_status(&cluster, &store).await {
        error!(error = %e, "initial node status sync failed, continuing with an empty status document");
    }

    let agent_client = Arc::new(HttpAgentClient::new(config.agent_timeout()));

    let placement = Placement::new(
        cluster.clone(),
        store.clone(),
        config.manifest_dir.clone(),
        config.host_port_range(),
        config.pod_ready_poll_interval(),
        config.pod_ready_max_polls,
        config.strategy(),
    );

    let coordinator = Arc::new(Coordinator::new(store, placement, agent_client, config.strategy()));

    let router = http::router(coordinator);
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "listening");

    axum::serve(listener, router.into_make_service_with_connect_info::<SocketAddr>()).await?;
    Ok(())
}
