//! Startup node discovery: probe every computing node's health once and
//! persist the result, so the first `/subscribe` or `/alert` has a
//! `NodeStatus` document to read instead of an empty one.

use std::sync::Arc;

use futures::future::join_all;
use tracing::{info, instrument};

use crate::cluster::ClusterDriver;
use crate::domain::{NodeHealth, NodeStatus};
use crate::error::Result;
use crate::store::{DocumentStore, Documents};

#[instrument(skip(cluster, store))]
pub async fn sync_node_status(cluster: &Arc<dyn ClusterDriver>, store: &Arc<dyn DocumentStore>) -> Result<NodeStatus> {
    let nodes = cluster.list_computing_nodes().await?;
    info!(count = nodes.len(), "discovered computing nodes");

    let probes = nodes.iter().map(|node| {
        let cluster = cluster.clone();
        let ip = node.internal_ip.clone();
        let name = node.name.clone();
        async move {
            let healthy = cluster.probe_health(&ip).await;
            (name, if healthy { NodeHealth::Healthy } else { NodeHealth::Unhealthy })
        }
    });

    let status: NodeStatus = join_all(probes).await.into_iter().collect();

    let docs = Documents::new(store.as_ref());
    docs.save_node_status(&status).await?;
    Ok(status)
}
