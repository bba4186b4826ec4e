//! Persistent worker connection management.
//!
//! The gateway holds at most one agent-worker WebSocket. A new connection
//! replaces the current one (workers reconnect after restarts); in-flight
//! incident registrations survive the swap. The connection slot and the
//! callback registry are guarded by separate locks and never locked
//! together.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::stream::{SplitSink, StreamExt};
use futures_util::SinkExt;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

use triage_common::format::append_metrics;
use triage_common::{Envelope, MessageType, ProviderSettings, ProxyConfig};

use crate::registry::{CallbackRegistry, CompletionInfo, IncidentCallbacks};
use crate::DispatchError;

struct WorkerConn {
    generation: u64,
    writer: Arc<Mutex<SplitSink<WebSocket, Message>>>,
    shutdown: Arc<Notify>,
}

pub struct AgentGateway {
    conn: Mutex<Option<WorkerConn>>,
    registry: Arc<CallbackRegistry>,
    generation: AtomicU64,
}

impl AgentGateway {
    pub fn new(registry: Arc<CallbackRegistry>) -> Self {
        Self {
            conn: Mutex::new(None),
            registry,
            generation: AtomicU64::new(0),
        }
    }

    pub fn registry(&self) -> &Arc<CallbackRegistry> {
        &self.registry
    }

    /// Router exposing the worker endpoint; the embedding server mounts it.
    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route("/ws/agent", get(ws_handler))
            .with_state(self)
    }

    pub async fn is_connected(&self) -> bool {
        self.conn.lock().await.is_some()
    }

    /// Sends a new incident to the worker. Callbacks are registered before
    /// the frame goes out and rolled back if the send fails.
    pub async fn start_incident(
        &self,
        incident_id: &str,
        task: &str,
        provider: Option<&ProviderSettings>,
        proxy: Option<ProxyConfig>,
        enabled_skills: Vec<String>,
        callbacks: IncidentCallbacks,
    ) -> Result<(), DispatchError> {
        self.registry.register(incident_id, callbacks);

        let mut frame = Envelope::with_incident(MessageType::NewIncident, incident_id);
        frame.task = Some(task.to_string());
        frame.enabled_skills = enabled_skills;
        frame.proxy_config = proxy;
        if let Some(provider) = provider {
            frame.apply_provider(provider);
        }

        if let Err(err) = self.send(&frame).await {
            self.registry.remove(incident_id);
            return Err(err);
        }
        Ok(())
    }

    /// Sends a follow-up message for an incident the worker already ran,
    /// resuming its agent session.
    pub async fn continue_incident(
        &self,
        incident_id: &str,
        session_id: &str,
        message: &str,
        provider: Option<&ProviderSettings>,
        proxy: Option<ProxyConfig>,
        enabled_skills: Vec<String>,
        callbacks: IncidentCallbacks,
    ) -> Result<(), DispatchError> {
        self.registry.register(incident_id, callbacks);

        let mut frame = Envelope::with_incident(MessageType::ContinueIncident, incident_id);
        frame.session_id = Some(session_id.to_string());
        frame.message = Some(message.to_string());
        frame.enabled_skills = enabled_skills;
        frame.proxy_config = proxy;
        if let Some(provider) = provider {
            frame.apply_provider(provider);
        }

        if let Err(err) = self.send(&frame).await {
            self.registry.remove(incident_id);
            return Err(err);
        }
        Ok(())
    }

    /// Advisory cancellation; the worker answers with a terminal frame, so
    /// the registration is left in place.
    pub async fn cancel_incident(&self, incident_id: &str) -> Result<(), DispatchError> {
        let frame = Envelope::with_incident(MessageType::CancelIncident, incident_id);
        self.send(&frame).await
    }

    /// Pushes new proxy settings to the connected worker.
    pub async fn broadcast_proxy_config(&self, config: ProxyConfig) -> Result<(), DispatchError> {
        let mut frame = Envelope::new(MessageType::ProxyConfigUpdate);
        frame.proxy_config = Some(config);
        self.send(&frame).await
    }

    async fn send(&self, frame: &Envelope) -> Result<(), DispatchError> {
        let writer = {
            let conn = self.conn.lock().await;
            match conn.as_ref() {
                Some(conn) => conn.writer.clone(),
                None => return Err(DispatchError::WorkerNotConnected),
            }
        };
        let text = serde_json::to_string(frame)?;
        let mut guard = writer.lock().await;
        guard
            .send(Message::Text(text))
            .await
            .map_err(|err| DispatchError::SendFailed(err.to_string()))
    }

    async fn handle_socket(self: Arc<Self>, socket: WebSocket) {
        let (writer, mut reader) = socket.split();
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let shutdown = Arc::new(Notify::new());

        let conn = WorkerConn {
            generation,
            writer: Arc::new(Mutex::new(writer)),
            shutdown: shutdown.clone(),
        };
        {
            let mut slot = self.conn.lock().await;
            if let Some(old) = slot.replace(conn) {
                info!(
                    old_generation = old.generation,
                    generation, "replacing worker connection"
                );
                // notify_one stores a permit, so the old read loop sees it
                // even if it is mid-frame right now
                old.shutdown.notify_one();
            }
        }
        info!(generation, "agent worker connected");

        loop {
            tokio::select! {
                _ = shutdown.notified() => {
                    debug!(generation, "read loop superseded");
                    break;
                }
                msg = reader.next() => match msg {
                    Some(Ok(Message::Text(text))) => self.handle_frame(&text).await,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(err)) => {
                        warn!(generation, error = %err, "worker socket error");
                        break;
                    }
                    Some(Ok(_)) => {}
                }
            }
        }

        let mut slot = self.conn.lock().await;
        if slot.as_ref().map(|c| c.generation) == Some(generation) {
            *slot = None;
            info!(generation, "agent worker disconnected");
        }
    }

    async fn handle_frame(&self, text: &str) {
        let frame: Envelope = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(error = %err, "undecodable worker frame, ignoring");
                return;
            }
        };
        let incident_id = frame.incident_id.clone().unwrap_or_default();

        match frame.kind {
            MessageType::CodexOutput => {
                if let Some(output) = frame.output {
                    self.registry.dispatch_output(&incident_id, output).await;
                }
            }
            MessageType::CodexCompleted => {
                let duration = Duration::from_millis(frame.execution_time_ms.unwrap_or(0));
                let tokens_used = frame.tokens_used.unwrap_or(0);
                let output =
                    append_metrics(frame.output.as_deref().unwrap_or(""), duration, tokens_used);
                let info = CompletionInfo {
                    output,
                    session_id: frame.session_id,
                    tokens_used,
                    duration,
                };
                self.registry.dispatch_completed(&incident_id, info).await;
            }
            MessageType::CodexError => {
                let error = frame
                    .error
                    .or(frame.message)
                    .unwrap_or_else(|| "unknown agent error".to_string());
                self.registry.dispatch_error(&incident_id, error).await;
            }
            MessageType::Heartbeat => {
                debug!("worker heartbeat");
            }
            MessageType::Status => {
                info!(status = frame.message.as_deref().unwrap_or(""), "worker status");
            }
            other => {
                debug!(kind = other.as_str(), "ignoring worker frame");
            }
        }
    }
}

async fn ws_handler(
    State(gateway): State<Arc<AgentGateway>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| gateway.handle_socket(socket))
}
