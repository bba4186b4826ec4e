//! Facade over the remote and in-process dispatch paths. Callers get one
//! API; the connected worker is preferred and the local runner covers the
//! gap when none is available.

use std::sync::Arc;

use tracing::{info, warn};

use triage_common::{ProviderSettings, ProxyConfig};

use crate::gateway::AgentGateway;
use crate::local::LocalRunner;
use crate::registry::IncidentCallbacks;
use crate::DispatchError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    Remote,
    Local,
}

impl DispatchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchMode::Remote => "remote",
            DispatchMode::Local => "local",
        }
    }
}

pub struct DispatchService {
    gateway: Arc<AgentGateway>,
    local: LocalRunner,
}

impl DispatchService {
    pub fn new(gateway: Arc<AgentGateway>, local: LocalRunner) -> Self {
        Self { gateway, local }
    }

    pub fn gateway(&self) -> &Arc<AgentGateway> {
        &self.gateway
    }

    pub async fn start_incident(
        &self,
        incident_id: &str,
        task: &str,
        provider: Option<ProviderSettings>,
        proxy: Option<ProxyConfig>,
        enabled_skills: Vec<String>,
        callbacks: IncidentCallbacks,
    ) -> Result<DispatchMode, DispatchError> {
        if self.gateway.is_connected().await {
            self.gateway
                .start_incident(
                    incident_id,
                    task,
                    provider.as_ref(),
                    proxy,
                    enabled_skills,
                    callbacks,
                )
                .await?;
            return Ok(DispatchMode::Remote);
        }

        info!(incident_id = %incident_id, "no worker connected, falling back to in-process run");
        self.local
            .start_incident(incident_id, task, provider, proxy, callbacks);
        Ok(DispatchMode::Local)
    }

    pub async fn continue_incident(
        &self,
        incident_id: &str,
        session_id: &str,
        message: &str,
        provider: Option<ProviderSettings>,
        proxy: Option<ProxyConfig>,
        enabled_skills: Vec<String>,
        callbacks: IncidentCallbacks,
    ) -> Result<DispatchMode, DispatchError> {
        if self.gateway.is_connected().await {
            self.gateway
                .continue_incident(
                    incident_id,
                    session_id,
                    message,
                    provider.as_ref(),
                    proxy,
                    enabled_skills,
                    callbacks,
                )
                .await?;
            return Ok(DispatchMode::Remote);
        }

        info!(incident_id = %incident_id, "no worker connected, resuming in-process");
        self.local
            .continue_incident(incident_id, session_id, message, provider, proxy, callbacks);
        Ok(DispatchMode::Local)
    }

    /// Advisory: asks the worker to stop an incident. In-process runs finish
    /// on their own timeout.
    pub async fn cancel_incident(&self, incident_id: &str) -> Result<(), DispatchError> {
        match self.gateway.cancel_incident(incident_id).await {
            Ok(()) => Ok(()),
            Err(DispatchError::WorkerNotConnected) => {
                warn!(incident_id = %incident_id, "cancel requested with no worker connected");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    pub async fn broadcast_proxy_config(&self, config: ProxyConfig) -> Result<(), DispatchError> {
        self.gateway.broadcast_proxy_config(config).await
    }
}
