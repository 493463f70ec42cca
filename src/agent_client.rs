//! Agent reconfiguration: tells a subscribed agent where to send its
//! workload and at what frequency.

use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use tracing::{instrument, warn};

use crate::error::Result;

/// Body posted to an agent's `/servicechange` endpoint.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ServiceChange {
    #[serde(rename = "servicename")]
    pub service_name: String,
    pub ip: String,
    pub port: u16,
    pub frequency: f64,
}

#[async_trait]
pub trait AgentClient: Send + Sync {
    /// Notify an agent of its new pod binding and frequency. Failures are
    /// swallowed by the caller (the subscription still succeeds even if
    /// the agent is briefly unreachable); this just reports whether the
    /// call landed.
    async fn notify(&self, agent_ip: &str, agent_port: u16, change: &ServiceChange) -> Result<()>;
}

pub struct HttpAgentClient {
    http: reqwest::Client,
}

impl HttpAgentClient {
    pub fn new(timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .expect("default TLS backend is always available"),
        }
    }
}

#[async_trait]
impl AgentClient for HttpAgentClient {
    #[instrument(skip(self, change), fields(agent_ip, agent_port))]
    async fn notify(&self, agent_ip: &str, agent_port: u16, change: &ServiceChange) -> Result<()> {
        let url = format!("http://{agent_ip}:{agent_port}/servicechange");
        match self.http.post(&url).json(change).send().await {
            Ok(resp) => {
                if !resp.status().is_success() {
                    warn!(status = %resp.status(), %url, "agent rejected reconfiguration");
                }
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, %url, "failed to reach agent");
                Err(crate::error::Error::Http(e))
            }
        }
    }
}

/// Records every call instead of sending it, for assertions in tests.
pub mod recording {
    use super::*;
    use tokio::sync::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    pub struct Call {
        pub agent_ip: String,
        pub agent_port: u16,
        pub change: ServiceChange,
    }

    #[derive(Default)]
    pub struct RecordingAgentClient {
        pub calls: Mutex<Vec<Call>>,
    }

    impl RecordingAgentClient {
        pub fn new() -> Self {
            Self::default()
        }

        pub async fn calls(&self) -> Vec<Call> {
            self.calls.lock().await.clone()
        }
    }

    #[async_trait]
    impl AgentClient for RecordingAgentClient {
        async fn notify(&self, agent_ip: &str, agent_port: u16, change: &ServiceChange) -> Result<()> {
            self.calls.lock().await.push(Call {
                agent_ip: agent_ip.to_string(),
                agent_port,
                change: change.clone(),
            });
            Ok(())
        }
    }
}
