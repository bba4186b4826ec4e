//! In-process fallback execution.
//!
//! When no worker is connected the agent runs inside this process with the
//! same three-callback contract the remote path offers: streamed progress,
//! then exactly one completion or error.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use triage_common::format::append_metrics;
use triage_common::{ProviderSettings, ProxyConfig};
use triage_executor::{Executor, RunRequest};

use crate::registry::{CompletionInfo, IncidentCallbacks};

pub const DEFAULT_LOCAL_TIMEOUT_SECS: u64 = 1800;

pub struct LocalRunner {
    executor: Arc<Executor>,
    timeout: Duration,
}

impl LocalRunner {
    pub fn new(executor: Arc<Executor>) -> Self {
        Self {
            executor,
            timeout: Duration::from_secs(DEFAULT_LOCAL_TIMEOUT_SECS),
        }
    }

    pub fn with_timeout(executor: Arc<Executor>, timeout: Duration) -> Self {
        Self { executor, timeout }
    }

    pub fn start_incident(
        &self,
        incident_id: &str,
        task: &str,
        provider: Option<ProviderSettings>,
        proxy: Option<ProxyConfig>,
        callbacks: IncidentCallbacks,
    ) {
        self.spawn_run(incident_id, task, None, provider, proxy, callbacks);
    }

    pub fn continue_incident(
        &self,
        incident_id: &str,
        session_id: &str,
        message: &str,
        provider: Option<ProviderSettings>,
        proxy: Option<ProxyConfig>,
        callbacks: IncidentCallbacks,
    ) {
        self.spawn_run(
            incident_id,
            message,
            Some(session_id.to_string()),
            provider,
            proxy,
            callbacks,
        );
    }

    fn spawn_run(
        &self,
        incident_id: &str,
        task: &str,
        session_id: Option<String>,
        provider: Option<ProviderSettings>,
        proxy: Option<ProxyConfig>,
        callbacks: IncidentCallbacks,
    ) {
        let executor = self.executor.clone();
        let timeout = self.timeout;
        let incident_id = incident_id.to_string();
        let task = task.to_string();

        tokio::spawn(async move {
            info!(incident_id = %incident_id, "running incident in-process");
            let mut req = RunRequest::new(incident_id.clone(), task);
            req.session_id = session_id;
            req.provider = provider;
            req.proxy = proxy;
            req.timeout = Some(timeout);
            req.on_progress = Some(callbacks.on_output.clone());

            match executor.run(req).await {
                Ok(outcome) => {
                    let info = CompletionInfo {
                        output: append_metrics(
                            &outcome.output,
                            outcome.duration,
                            outcome.tokens_used,
                        ),
                        session_id: outcome.session_id,
                        tokens_used: outcome.tokens_used,
                        duration: outcome.duration,
                    };
                    (callbacks.on_completed)(info);
                }
                Err(err) => {
                    warn!(incident_id = %incident_id, error = %err, "in-process run failed");
                    let mut message = err.to_string();
                    if let Some(partial) = err.partial() {
                        if !partial.error_messages.is_empty() {
                            message.push_str("\n\nErrors:\n");
                            for (i, detail) in partial.error_messages.iter().enumerate() {
                                message.push_str(&format!("{}. {}\n", i + 1, detail));
                            }
                        }
                    }
                    (callbacks.on_error)(message);
                }
            }
        });
    }
}
