//! Controller configuration: CLI arguments layered over environment
//! variables, following the allocation strategy switch and the timeout
//! budget described in the design.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};

use crate::allocator::Strategy;

/// Controller configuration.
#[derive(Parser, Debug, Clone)]
#[command(name = "arha-controller")]
#[command(about = "Control plane for the AR-offload platform")]
pub struct Config {
    /// HTTP listen port.
    #[arg(long, env = "CONTROLLER_PORT", default_value_t = 8000)]
    pub port: u16,

    /// Allocation strategy, selected at startup.
    #[arg(long = "optimizer", env = "OPTIMIZER_FUNCTION", value_enum, default_value_t = OptimizerFunction::Optimize)]
    pub optimizer: OptimizerFunction,

    /// Kubernetes namespace the controller operates in.
    #[arg(long, env = "CONTROLLER_NAMESPACE", default_value = "default")]
    pub namespace: String,

    /// Custom-resource group used for the state-store documents.
    #[arg(long, env = "CONTROLLER_CRD_GROUP", default_value = "ha.example.com")]
    pub crd_group: String,

    /// Custom-resource version used for the state-store documents.
    #[arg(long, env = "CONTROLLER_CRD_VERSION", default_value = "v1")]
    pub crd_version: String,

    /// Directory containing `{serviceType}.yaml` pod manifest templates.
    #[arg(long, env = "CONTROLLER_MANIFEST_DIR", default_value = "service_yaml")]
    pub manifest_dir: PathBuf,

    /// Node health probe timeout, milliseconds.
    #[arg(long, env = "CONTROLLER_HEALTH_TIMEOUT_MS", default_value_t = 1_000)]
    pub health_probe_timeout_ms: u64,

    /// Agent reconfiguration POST timeout, milliseconds.
    #[arg(long, env = "CONTROLLER_AGENT_TIMEOUT_MS", default_value_t = 5_000)]
    pub agent_timeout_ms: u64,

    /// Cluster driver (pod create/delete/read, node read) call timeout, ms.
    #[arg(long, env = "CONTROLLER_CLUSTER_TIMEOUT_MS", default_value_t = 5_000)]
    pub cluster_timeout_ms: u64,

    /// Interval between pod-readiness polls, milliseconds.
    #[arg(long, env = "CONTROLLER_READY_POLL_MS", default_value_t = 5_000)]
    pub pod_ready_poll_ms: u64,

    /// Maximum number of pod-readiness polls before giving up (the pod
    /// entry is kept regardless, see §7's open question on readiness).
    #[arg(long, env = "CONTROLLER_READY_MAX_POLLS", default_value_t = 12)]
    pub pod_ready_max_polls: u32,

    /// Lower bound of the hostPort pool, inclusive.
    #[arg(long, env = "CONTROLLER_PORT_RANGE_START", default_value_t = 30_500)]
    pub host_port_range_start: u16,

    /// Upper bound of the hostPort pool, inclusive.
    #[arg(long, env = "CONTROLLER_PORT_RANGE_END", default_value_t = 30_999)]
    pub host_port_range_end: u16,
}

/// The three interchangeable allocation strategies, selected by
/// `OPTIMIZER_FUNCTION` at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OptimizerFunction {
    Optimize,
    Uniform,
    #[value(name = "most_remaining")]
    MostRemaining,
}

impl From<OptimizerFunction> for Strategy {
    fn from(value: OptimizerFunction) -> Self {
        match value {
            OptimizerFunction::Optimize => Strategy::WorkloadAware,
            OptimizerFunction::Uniform => Strategy::Uniform,
            OptimizerFunction::MostRemaining => Strategy::MostRemaining,
        }
    }
}

impl Config {
    pub fn strategy(&self) -> Strategy {
        self.optimizer.into()
    }

    pub fn health_probe_timeout(&self) -> Duration {
        Duration::from_millis(self.health_probe_timeout_ms)
    }

    pub fn agent_timeout(&self) -> Duration {
        Duration::from_millis(self.agent_timeout_ms)
    }

    pub fn cluster_timeout(&self) -> Duration {
        Duration::from_millis(self.cluster_timeout_ms)
    }

    pub fn pod_ready_poll_interval(&self) -> Duration {
        Duration::from_millis(self.pod_ready_poll_ms)
    }

    pub fn host_port_range(&self) -> std::ops::RangeInclusive<u16> {
        self.host_port_range_start..=self.host_port_range_end
    }
}
