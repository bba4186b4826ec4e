use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use triage_common::{Envelope, MessageType, ProxyConfig};
use triage_dispatch::{
    AgentGateway, CallbackRegistry, CompletionInfo, DispatchError, DispatchMode, DispatchService,
    IncidentCallbacks, IncidentSink, LocalRunner,
};
use triage_executor::{Executor, ExecutorConfig};

type WorkerSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Default)]
struct TestSink {
    outputs: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl IncidentSink for TestSink {
    async fn append_output(&self, incident_id: &str, output: &str) {
        self.outputs
            .lock()
            .unwrap()
            .push((incident_id.to_string(), output.to_string()));
    }
    async fn complete(&self, _incident_id: &str, _info: &CompletionInfo) {}
    async fn fail(&self, _incident_id: &str, _error: &str) {}
}

async fn serve_gateway() -> Result<(Arc<AgentGateway>, Arc<TestSink>, SocketAddr)> {
    let sink = Arc::new(TestSink::default());
    let registry = Arc::new(CallbackRegistry::new(sink.clone()));
    let gateway = Arc::new(AgentGateway::new(registry));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let app = gateway.clone().router();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok((gateway, sink, addr))
}

async fn connect_worker(addr: SocketAddr, gateway: &AgentGateway) -> Result<WorkerSocket> {
    let (socket, _) = connect_async(format!("ws://{addr}/ws/agent")).await?;
    // wait until the gateway has installed the connection
    timeout(Duration::from_secs(5), async {
        while !gateway.is_connected().await {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .context("gateway never saw the connection")?;
    Ok(socket)
}

async fn next_frame(socket: &mut WorkerSocket) -> Result<Envelope> {
    let msg = timeout(Duration::from_secs(5), socket.next())
        .await
        .context("no frame within deadline")?
        .context("socket closed")??;
    match msg {
        Message::Text(text) => Ok(serde_json::from_str(&text)?),
        other => anyhow::bail!("unexpected frame: {other:?}"),
    }
}

async fn send_frame(socket: &mut WorkerSocket, frame: &Envelope) -> Result<()> {
    socket
        .send(Message::Text(serde_json::to_string(frame)?))
        .await?;
    Ok(())
}

fn channel_callbacks() -> (
    IncidentCallbacks,
    mpsc::UnboundedReceiver<String>,
    oneshot::Receiver<CompletionInfo>,
    oneshot::Receiver<String>,
) {
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (done_tx, done_rx) = oneshot::channel();
    let (err_tx, err_rx) = oneshot::channel();
    let callbacks = IncidentCallbacks::new(
        move |output| {
            let _ = out_tx.send(output);
        },
        move |info| {
            let _ = done_tx.send(info);
        },
        move |error| {
            let _ = err_tx.send(error);
        },
    );
    (callbacks, out_rx, done_rx, err_rx)
}

#[tokio::test]
async fn incident_round_trip_over_worker_connection() -> Result<()> {
    let (gateway, _sink, addr) = serve_gateway().await?;
    let mut worker = connect_worker(addr, &gateway).await?;

    let (callbacks, mut out_rx, done_rx, _err_rx) = channel_callbacks();
    gateway
        .start_incident(
            "inc-1",
            "investigate high load",
            None,
            None,
            vec!["diagnostics".into()],
            callbacks,
        )
        .await?;

    let frame = next_frame(&mut worker).await?;
    assert_eq!(frame.kind, MessageType::NewIncident);
    assert_eq!(frame.incident_id.as_deref(), Some("inc-1"));
    assert_eq!(frame.task.as_deref(), Some("investigate high load"));
    assert_eq!(frame.enabled_skills, vec!["diagnostics".to_string()]);

    let mut progress = Envelope::with_incident(MessageType::CodexOutput, "inc-1");
    progress.output = Some("🤔 checking load".into());
    send_frame(&mut worker, &progress).await?;

    let streamed = timeout(Duration::from_secs(5), out_rx.recv())
        .await?
        .context("no output callback")?;
    assert_eq!(streamed, "🤔 checking load");

    let mut done = Envelope::with_incident(MessageType::CodexCompleted, "inc-1");
    done.output = Some("load was a cron job".into());
    done.session_id = Some("sess-1".into());
    done.tokens_used = Some(1200);
    done.execution_time_ms = Some(90_000);
    send_frame(&mut worker, &done).await?;

    let info = timeout(Duration::from_secs(5), done_rx).await??;
    assert_eq!(
        info.output,
        "load was a cron job\n\n---\n⏱️ Time: 1m 30s | 🎯 Tokens: 1,200"
    );
    assert_eq!(info.session_id.as_deref(), Some("sess-1"));
    assert!(!gateway.registry().is_registered("inc-1"));
    Ok(())
}

#[tokio::test]
async fn concurrent_incidents_resolve_independently() -> Result<()> {
    let (gateway, _sink, addr) = serve_gateway().await?;
    let mut worker = connect_worker(addr, &gateway).await?;

    let (cb_a, _out_a, done_a, _err_a) = channel_callbacks();
    let (cb_b, _out_b, done_b, _err_b) = channel_callbacks();
    let (sent_a, sent_b) = tokio::join!(
        gateway.start_incident("inc-a", "first task", None, None, Vec::new(), cb_a),
        gateway.start_incident("inc-b", "second task", None, None, Vec::new(), cb_b),
    );
    sent_a?;
    sent_b?;

    // both frames arrive whole, never interleaved
    let first = next_frame(&mut worker).await?;
    let second = next_frame(&mut worker).await?;
    let mut ids = vec![
        first.incident_id.clone().unwrap_or_default(),
        second.incident_id.clone().unwrap_or_default(),
    ];
    ids.sort();
    assert_eq!(ids, vec!["inc-a".to_string(), "inc-b".to_string()]);
    for frame in [&first, &second] {
        assert_eq!(frame.kind, MessageType::NewIncident);
        let expected = if frame.incident_id.as_deref() == Some("inc-a") {
            "first task"
        } else {
            "second task"
        };
        assert_eq!(frame.task.as_deref(), Some(expected));
    }

    // terminals in reverse order each resolve only their own registration
    let mut done = Envelope::with_incident(MessageType::CodexCompleted, "inc-b");
    done.output = Some("b done".into());
    send_frame(&mut worker, &done).await?;
    let info_b = timeout(Duration::from_secs(5), done_b).await??;
    assert!(info_b.output.starts_with("b done"));
    assert!(gateway.registry().is_registered("inc-a"));
    assert!(!gateway.registry().is_registered("inc-b"));

    let mut done = Envelope::with_incident(MessageType::CodexCompleted, "inc-a");
    done.output = Some("a done".into());
    send_frame(&mut worker, &done).await?;
    let info_a = timeout(Duration::from_secs(5), done_a).await??;
    assert!(info_a.output.starts_with("a done"));
    assert!(gateway.registry().is_empty());
    Ok(())
}

#[tokio::test]
async fn reconnect_replaces_connection_but_keeps_registrations() -> Result<()> {
    let (gateway, _sink, addr) = serve_gateway().await?;
    let mut first = connect_worker(addr, &gateway).await?;

    let (callbacks, _out_rx, done_rx, _err_rx) = channel_callbacks();
    gateway
        .start_incident("inc-2", "task", None, None, Vec::new(), callbacks)
        .await?;
    let _ = next_frame(&mut first).await?;

    // second worker takes over the slot
    let mut second = connect_worker(addr, &gateway).await?;

    // the first socket gets closed by the gateway
    let closed = timeout(Duration::from_secs(5), async {
        loop {
            match first.next().await {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(_)) => break,
                Some(Ok(_)) => {}
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "first connection was not closed");

    // the in-flight incident still resolves via the new connection
    assert!(gateway.registry().is_registered("inc-2"));
    let mut done = Envelope::with_incident(MessageType::CodexCompleted, "inc-2");
    done.output = Some("handled after reconnect".into());
    send_frame(&mut second, &done).await?;

    let info = timeout(Duration::from_secs(5), done_rx).await??;
    assert!(info.output.starts_with("handled after reconnect"));
    Ok(())
}

#[tokio::test]
async fn start_without_worker_rolls_back_registration() -> Result<()> {
    let (gateway, _sink, _addr) = serve_gateway().await?;

    let (callbacks, _out_rx, _done_rx, _err_rx) = channel_callbacks();
    let err = gateway
        .start_incident("inc-3", "task", None, None, Vec::new(), callbacks)
        .await
        .unwrap_err();

    assert!(matches!(err, DispatchError::WorkerNotConnected));
    assert!(!gateway.registry().is_registered("inc-3"));
    Ok(())
}

#[tokio::test]
async fn unclaimed_output_lands_in_sink() -> Result<()> {
    let (gateway, sink, addr) = serve_gateway().await?;
    let mut worker = connect_worker(addr, &gateway).await?;

    let mut orphan = Envelope::with_incident(MessageType::CodexOutput, "inc-gone");
    orphan.output = Some("late output".into());
    send_frame(&mut worker, &orphan).await?;

    timeout(Duration::from_secs(5), async {
        loop {
            if !sink.outputs.lock().unwrap().is_empty() {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await?;
    assert_eq!(
        sink.outputs.lock().unwrap()[0],
        ("inc-gone".to_string(), "late output".to_string())
    );
    Ok(())
}

#[tokio::test]
async fn proxy_config_broadcast_reaches_worker() -> Result<()> {
    let (gateway, _sink, addr) = serve_gateway().await?;
    let mut worker = connect_worker(addr, &gateway).await?;

    let config = ProxyConfig {
        url: "http://proxy.internal:3128".into(),
        no_proxy: "localhost".into(),
        openai_enabled: true,
        slack_enabled: false,
        zabbix_enabled: true,
    };
    gateway.broadcast_proxy_config(config.clone()).await?;

    let frame = next_frame(&mut worker).await?;
    assert_eq!(frame.kind, MessageType::ProxyConfigUpdate);
    assert_eq!(frame.proxy_config, Some(config));
    Ok(())
}

#[tokio::test]
async fn unknown_frames_are_ignored() -> Result<()> {
    let (gateway, _sink, addr) = serve_gateway().await?;
    let mut worker = connect_worker(addr, &gateway).await?;

    worker
        .send(Message::Text(r#"{"type":"future_feature","data":{}}"#.into()))
        .await?;
    worker.send(Message::Text("not json at all".into())).await?;

    // the connection survives both frames
    sleep(Duration::from_millis(100)).await;
    assert!(gateway.is_connected().await);
    Ok(())
}

#[cfg(unix)]
mod fallback {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn stub_agent(dir: &tempfile::TempDir, body: &str) -> String {
        let path = dir.path().join("fake-agent");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path.to_string_lossy().to_string()
    }

    fn local_service(gateway: Arc<AgentGateway>, binary: String) -> DispatchService {
        let executor = Arc::new(Executor::new(ExecutorConfig {
            binary,
            ..ExecutorConfig::default()
        }));
        DispatchService::new(
            gateway,
            LocalRunner::with_timeout(executor, Duration::from_secs(10)),
        )
    }

    #[tokio::test]
    async fn service_falls_back_to_local_run() -> Result<()> {
        let (gateway, _sink, _addr) = serve_gateway().await?;
        let dir = tempfile::TempDir::new()?;
        let script = stub_agent(
            &dir,
            r#"echo '{"type":"item.completed","item":{"type":"reasoning","text":"inspecting"}}'
echo '{"type":"item.completed","item":{"type":"agent_message","text":"resolved locally"}}'
echo '{"type":"turn.completed","usage":{"input_tokens":50,"output_tokens":10}}'"#,
        );
        let service = local_service(gateway, script);

        let (callbacks, mut out_rx, done_rx, _err_rx) = channel_callbacks();
        let mode = service
            .start_incident("inc-local", "fix it", None, None, Vec::new(), callbacks)
            .await?;
        assert_eq!(mode, DispatchMode::Local);

        let progress = timeout(Duration::from_secs(5), out_rx.recv())
            .await?
            .context("no progress callback")?;
        assert!(progress.contains("🤔 inspecting"));

        let info = timeout(Duration::from_secs(10), done_rx).await??;
        assert!(info.output.starts_with("resolved locally"));
        assert!(info.output.contains("🎯 Tokens: 60"));
        assert_eq!(info.tokens_used, 60);
        Ok(())
    }

    #[tokio::test]
    async fn local_failure_fires_single_error_callback() -> Result<()> {
        let (gateway, _sink, _addr) = serve_gateway().await?;
        let dir = tempfile::TempDir::new()?;
        let script = stub_agent(
            &dir,
            r#"echo '{"type":"error","message":"model unavailable"}'
exit 2"#,
        );
        let service = local_service(gateway, script);

        let (callbacks, _out_rx, done_rx, err_rx) = channel_callbacks();
        service
            .start_incident("inc-fail", "task", None, None, Vec::new(), callbacks)
            .await?;

        let error = timeout(Duration::from_secs(10), err_rx).await??;
        assert!(error.contains("model unavailable"));
        // completion channel never fires
        assert!(done_rx.await.is_err());
        Ok(())
    }
}
