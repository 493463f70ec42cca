//! HTTP surface: `/subscribe`, `/unsubscribe`, `/alert`, `/deploypod`.
//!
//! Request logging is handled by [`tower_http::trace::TraceLayer`] rather
//! than a hand-rolled middleware — it gives us method, path, status and
//! latency on every span without re-buffering the response body the way
//! the reference implementation's logging middleware does.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, State};
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

use crate::coordinator::Coordinator;
use crate::error::Result;

pub fn router(coordinator: Arc<Coordinator>) -> Router {
    Router::new()
        .route("/subscribe", post(subscribe))
        .route("/unsubscribe", post(unsubscribe))
        .route("/alert", post(alert))
        .route("/deploypod", post(deploypod))
        .layer(TraceLayer::new_for_http())
        .with_state(coordinator)
}

#[derive(Debug, Deserialize)]
struct SubscriptionRequest {
    ip: String,
    port: u16,
    #[serde(rename = "serviceType")]
    service_type: String,
}

#[derive(Debug, Serialize)]
struct SubscriptionResponse {
    #[serde(rename = "IP")]
    ip: String,
    #[serde(rename = "Port")]
    port: u16,
    #[serde(rename = "Frequency")]
    frequency: f64,
}

async fn subscribe(State(coordinator): State<Arc<Coordinator>>, Json(req): Json<SubscriptionRequest>) -> Result<Json<SubscriptionResponse>> {
    let outcome = coordinator.subscribe(&req.ip, req.port, &req.service_type).await?;
    Ok(Json(SubscriptionResponse {
        ip: outcome.host_ip,
        port: outcome.host_port,
        frequency: outcome.frequency,
    }))
}

#[derive(Debug, Deserialize)]
struct UnsubscribeRequest {
    port: u16,
}

#[derive(Debug, Serialize)]
struct MessageResponse {
    message: String,
}

async fn unsubscribe(
    State(coordinator): State<Arc<Coordinator>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(req): Json<UnsubscribeRequest>,
) -> Result<Json<MessageResponse>> {
    coordinator.unsubscribe(&addr.ip().to_string(), req.port).await?;
    Ok(Json(MessageResponse {
        message: "unsubscribe finish".to_string(),
    }))
}

#[derive(Debug, Deserialize)]
#[serde(tag = "alertType", content = "alertContent", rename_all = "snake_case")]
enum AlertRequest {
    WorkernodeFailure {
        #[serde(rename = "nodeName")]
        node_name: String,
    },
    PodFailure {
        #[serde(rename = "podName")]
        pod_name: String,
    },
}

async fn alert(State(coordinator): State<Arc<Coordinator>>, Json(req): Json<AlertRequest>) -> Result<Json<MessageResponse>> {
    match req {
        AlertRequest::WorkernodeFailure { node_name } => coordinator.alert_workernode_failure(&node_name).await?,
        AlertRequest::PodFailure { pod_name } => coordinator.alert_pod_failure(&pod_name).await?,
    }
    Ok(Json(MessageResponse {
        message: "alert handled successfully".to_string(),
    }))
}

#[derive(Debug, Deserialize)]
struct DeployPodRequest {
    #[serde(rename = "nodeName")]
    node_name: String,
    #[serde(rename = "hostPort")]
    host_port: u16,
    service_type: String,
    amount: u32,
}

async fn deploypod(State(coordinator): State<Arc<Coordinator>>, Json(req): Json<DeployPodRequest>) -> Result<Json<MessageResponse>> {
    coordinator
        .deploy_pod_at(&req.service_type, &req.node_name, req.host_port, req.amount)
        .await?;
    Ok(Json(MessageResponse {
        message: "deploy finish".to_string(),
    }))
}
