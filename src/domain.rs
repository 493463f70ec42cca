//! Persisted data model: `ServiceSpec`, `Service`, `Subscription`, `NodeStatus`.
//!
//! These types are the JSON shape that flows through [`crate::store`]. They
//! carry no behavior beyond small accessors and the invariants called out
//! in their field docs; the allocator and placement engine own the logic
//! that keeps those invariants true.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// `(default, minimum)` send-frequency pair for a service type.
///
/// Invariant: `default >= minimum >= 0.0`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FrequencyLimit {
    pub default: f64,
    pub minimum: f64,
}

impl FrequencyLimit {
    pub fn new(default: f64, minimum: f64) -> Self {
        Self { default, minimum }
    }
}

/// Static, administrator-supplied description of one service type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub service_type: String,
    /// nodeName -> max sustainable workload units when exactly one instance
    /// of this service type is hosted on that node.
    pub work_ability: HashMap<String, f64>,
    pub frequency_limit: FrequencyLimit,
    pub gpu_memory_request: u64,
}

/// A running service pod instance.
///
/// Invariants (checked by callers, not enforced by the type itself):
/// - `current_connection * frequency_limit.minimum <= workload_limit`
/// - if `current_connection >= 1`: `current_frequency` is `workload_limit /
///   current_connection` when saturated, else `frequency_limit.default`.
/// - `(service_type, node_name, host_port)` is unique across the list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Service {
    pub pod_ip: String,
    pub host_ip: String,
    pub host_port: u16,
    pub node_name: String,
    pub service_type: String,
    pub current_connection: u32,
    pub frequency_limit: FrequencyLimit,
    pub current_frequency: f64,
    pub workload_limit: f64,
}

impl Service {
    /// The `{serviceType}-{nodeName}-{hostPort}` pod name this service was
    /// deployed under.
    pub fn pod_name(&self) -> PodName {
        PodName {
            service_type: self.service_type.clone(),
            node_name: self.node_name.clone(),
            host_port: self.host_port,
        }
    }

    pub fn is_feasible(&self) -> bool {
        f64::from(self.current_connection) * self.frequency_limit.minimum <= self.workload_limit
    }
}

/// One agent's binding to a pod for a given service type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub agent_ip: String,
    pub agent_port: u16,
    pub service_type: String,
    pub pod_ip: String,
    pub node_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeHealth {
    Healthy,
    Unhealthy,
}

impl NodeHealth {
    pub fn is_healthy(self) -> bool {
        matches!(self, NodeHealth::Healthy)
    }
}

pub type NodeStatus = HashMap<String, NodeHealth>;

/// The `{serviceType}-{nodeName}-{hostPort}` pod-naming convention.
///
/// The `pod_failure` alert has to recover `(serviceType, nodeName,
/// hostPort)` from a bare pod name, so this is reified as an explicit
/// parser instead of a raw `split('-')` call (Design Notes: "Magic
/// splitting of pod name"). Under this scheme `nodeName` itself must not
/// contain `-`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodName {
    pub service_type: String,
    pub node_name: String,
    pub host_port: u16,
}

impl fmt::Display for PodName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.service_type, self.node_name, self.host_port)
    }
}

impl FromStr for PodName {
    type Err = PodNameParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('-');
        let service_type = parts.next().ok_or(PodNameParseError)?;
        let node_name = parts.next().ok_or(PodNameParseError)?;
        let host_port = parts.next().ok_or(PodNameParseError)?;
        if parts.next().is_some() {
            return Err(PodNameParseError);
        }
        let host_port: u16 = host_port.parse().map_err(|_| PodNameParseError)?;
        if service_type.is_empty() || node_name.is_empty() {
            return Err(PodNameParseError);
        }
        Ok(PodName {
            service_type: service_type.to_string(),
            node_name: node_name.to_string(),
            host_port,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("malformed pod name, expected \"{{serviceType}}-{{nodeName}}-{{hostPort}}\"")]
pub struct PodNameParseError;
