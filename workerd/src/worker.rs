//! Gateway connection and incident handling.
//!
//! The worker dials the dispatch gateway, announces readiness, heartbeats,
//! and runs one agent process per incident frame. Streaming output goes back
//! as `codex_output`, terminal results as `codex_completed` / `codex_error`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::{Context as _, Result};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::AbortHandle;
use tokio::time::interval;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use triage_common::{Envelope, MessageType, ProviderSettings, ProxyConfig};
use triage_executor::{Executor, RunRequest};

use crate::sessions::SessionStore;

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

type WsWriter = Arc<Mutex<SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>>>;

pub struct Worker {
    executor: Arc<Executor>,
    sessions: Arc<SessionStore>,
    proxy: StdMutex<Option<ProxyConfig>>,
    active: StdMutex<HashMap<String, AbortHandle>>,
}

impl Worker {
    pub fn new(executor: Arc<Executor>, sessions: Arc<SessionStore>) -> Self {
        Self {
            executor,
            sessions,
            proxy: StdMutex::new(None),
            active: StdMutex::new(HashMap::new()),
        }
    }

    /// Runs one connection until the gateway closes it or the socket fails.
    /// The caller owns the reconnect loop.
    pub async fn run_connection(self: Arc<Self>, url: &str) -> Result<()> {
        let (socket, _) = connect_async(url)
            .await
            .with_context(|| format!("failed to connect to {url}"))?;
        info!(url = %url, "connected to gateway");

        let (writer, mut reader) = socket.split();
        let writer: WsWriter = Arc::new(Mutex::new(writer));

        let mut status = Envelope::new(MessageType::Status);
        status.message = Some("ready".to_string());
        status.data = Some(json!({ "status": "ready" }));
        Self::send(&writer, &status).await?;

        let mut heartbeat = interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await; // first tick fires immediately

        loop {
            tokio::select! {
                msg = reader.next() => match msg {
                    Some(Ok(Message::Text(text))) => self.clone().handle_frame(&writer, &text).await,
                    Some(Ok(Message::Close(_))) | None => {
                        info!("gateway closed the connection");
                        return Ok(());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => return Err(err).context("gateway socket failed"),
                },
                _ = heartbeat.tick() => {
                    let frame = Envelope::new(MessageType::Heartbeat);
                    if let Err(err) = Self::send(&writer, &frame).await {
                        return Err(err).context("heartbeat failed");
                    }
                }
            }
        }
    }

    async fn handle_frame(self: Arc<Self>, writer: &WsWriter, text: &str) {
        let frame: Envelope = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(error = %err, "undecodable gateway frame, ignoring");
                return;
            }
        };
        let incident_id = frame.incident_id.clone().unwrap_or_default();
        debug!(kind = frame.kind.as_str(), incident_id = %incident_id, "gateway frame");

        match frame.kind {
            MessageType::NewIncident => {
                let Some(task) = frame.task.clone() else {
                    warn!(incident_id = %incident_id, "new_incident without task");
                    return;
                };
                info!(incident_id = %incident_id, "starting incident");
                let provider = frame.provider_settings();
                let proxy = frame.proxy_config.clone().or_else(|| self.proxy());
                self.sessions.create(&incident_id);
                self.spawn_run(writer.clone(), incident_id, task, None, provider, proxy);
            }
            MessageType::ContinueIncident => {
                let Some(message) = frame.message.clone() else {
                    warn!(incident_id = %incident_id, "continue_incident without message");
                    return;
                };
                let session_id = frame
                    .session_id
                    .clone()
                    .filter(|s| !s.is_empty())
                    .or_else(|| {
                        self.sessions
                            .get(&incident_id)
                            .map(|s| s.session_id)
                            .filter(|s| !s.is_empty())
                    });
                match session_id {
                    Some(session_id) => {
                        info!(incident_id = %incident_id, session_id = %session_id, "resuming incident");
                        let provider = frame.provider_settings();
                        let proxy = frame.proxy_config.clone().or_else(|| self.proxy());
                        self.spawn_run(
                            writer.clone(),
                            incident_id,
                            message,
                            Some(session_id),
                            provider,
                            proxy,
                        );
                    }
                    None => {
                        Self::send_error(writer, &incident_id, "No session found for incident", 0, 0)
                            .await;
                    }
                }
            }
            MessageType::CancelIncident => {
                self.cancel_incident(writer, &incident_id).await;
            }
            MessageType::ProxyConfigUpdate => {
                if let Some(config) = frame.proxy_config {
                    info!(url = %config.url, "proxy configuration updated");
                    *self.lock_proxy() = Some(config);
                }
            }
            other => {
                debug!(kind = other.as_str(), "ignoring gateway frame");
            }
        }
    }

    async fn cancel_incident(&self, writer: &WsWriter, incident_id: &str) {
        let handle = self.lock_active().remove(incident_id);
        match handle {
            Some(handle) => {
                info!(incident_id = %incident_id, "cancelling incident");
                // the agent child dies with the aborted task (kill on drop)
                handle.abort();
                self.sessions.set_failed(incident_id, "Cancelled by user");
                Self::send_error(writer, incident_id, "Execution cancelled", 0, 0).await;
            }
            None => {
                debug!(incident_id = %incident_id, "cancel for inactive incident");
            }
        }
    }

    fn spawn_run(
        self: Arc<Self>,
        writer: WsWriter,
        incident_id: String,
        prompt: String,
        resume_session: Option<String>,
        provider: Option<ProviderSettings>,
        proxy: Option<ProxyConfig>,
    ) {
        let worker = self.clone();
        let id_for_map = incident_id.clone();
        let (registered_tx, registered_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            // the run starts only once the abort handle is in the map, so the
            // self-removal below cannot race the insert and leave a stale entry
            if registered_rx.await.is_err() {
                return;
            }
            worker
                .run_incident(&writer, &incident_id, prompt, resume_session, provider, proxy)
                .await;
            worker.lock_active().remove(&incident_id);
        });
        self.lock_active()
            .insert(id_for_map, handle.abort_handle());
        let _ = registered_tx.send(());
    }

    async fn run_incident(
        &self,
        writer: &WsWriter,
        incident_id: &str,
        prompt: String,
        resume_session: Option<String>,
        provider: Option<ProviderSettings>,
        proxy: Option<ProxyConfig>,
    ) {
        // forward progress snapshots as they accumulate
        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel::<String>();
        let forward_writer = writer.clone();
        let forward_incident = incident_id.to_string();
        tokio::spawn(async move {
            while let Some(log) = progress_rx.recv().await {
                let mut frame =
                    Envelope::with_incident(MessageType::CodexOutput, forward_incident.clone());
                frame.output = Some(log);
                if Self::send(&forward_writer, &frame).await.is_err() {
                    break;
                }
            }
        });

        let mut req = RunRequest::new(incident_id, prompt);
        req.session_id = resume_session;
        req.provider = provider;
        req.proxy = proxy;
        req.on_progress = Some(Arc::new(move |log| {
            let _ = progress_tx.send(log);
        }));

        match self.executor.run(req).await {
            Ok(outcome) => {
                // empty result with zero tokens means the provider never
                // answered; surface it as a failure
                if outcome.output.is_empty() && outcome.tokens_used == 0 {
                    let reason = outcome.error_messages.first().cloned().unwrap_or_else(|| {
                        "agent returned an empty response; check provider credentials and model access"
                            .to_string()
                    });
                    warn!(incident_id = %incident_id, reason = %reason, "empty agent response");
                    self.sessions.set_failed(incident_id, &reason);
                    Self::send_error(writer, incident_id, &reason, 0, outcome.duration.as_millis() as u64)
                        .await;
                    return;
                }

                if let Some(session_id) = outcome.session_id.as_deref() {
                    self.sessions.set_running(incident_id, session_id);
                }
                self.sessions
                    .set_completed(incident_id, &outcome.output, &outcome.full_log);

                let mut frame =
                    Envelope::with_incident(MessageType::CodexCompleted, incident_id);
                frame.output = Some(outcome.output.clone());
                frame.session_id = outcome.session_id.clone();
                frame.tokens_used = Some(outcome.tokens_used);
                frame.execution_time_ms = Some(outcome.duration.as_millis() as u64);
                let _ = Self::send(writer, &frame).await;
                info!(
                    incident_id = %incident_id,
                    tokens = outcome.tokens_used,
                    elapsed_ms = outcome.duration.as_millis() as u64,
                    "incident completed"
                );
            }
            Err(err) => {
                warn!(incident_id = %incident_id, error = %err, "incident failed");
                let (tokens, elapsed_ms) = err
                    .partial()
                    .map(|p| (p.tokens_used, p.duration.as_millis() as u64))
                    .unwrap_or((0, 0));
                self.sessions.set_failed(incident_id, &err.to_string());
                Self::send_error(writer, incident_id, &err.to_string(), tokens, elapsed_ms).await;
            }
        }
    }

    async fn send_error(
        writer: &WsWriter,
        incident_id: &str,
        error: &str,
        tokens_used: u64,
        elapsed_ms: u64,
    ) {
        let mut frame = Envelope::with_incident(MessageType::CodexError, incident_id);
        frame.error = Some(error.to_string());
        if tokens_used > 0 {
            frame.tokens_used = Some(tokens_used);
        }
        if elapsed_ms > 0 {
            frame.execution_time_ms = Some(elapsed_ms);
        }
        if let Err(err) = Self::send(writer, &frame).await {
            warn!(incident_id = %incident_id, error = %err, "failed to report incident error");
        }
    }

    async fn send(writer: &WsWriter, frame: &Envelope) -> Result<()> {
        let text = serde_json::to_string(frame)?;
        writer
            .lock()
            .await
            .send(Message::Text(text))
            .await
            .context("gateway send failed")
    }

    fn proxy(&self) -> Option<ProxyConfig> {
        self.lock_proxy().clone()
    }

    fn lock_proxy(&self) -> std::sync::MutexGuard<'_, Option<ProxyConfig>> {
        match self.proxy.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_active(&self) -> std::sync::MutexGuard<'_, HashMap<String, AbortHandle>> {
        match self.active.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
