//! Agent CLI process supervision.
//!
//! Spawns the `codex` CLI with a filtered environment, drains stdout (JSON
//! events) and stderr (diagnostics, session token) concurrently, and folds
//! the event stream into a [`RunOutcome`]. Failures still carry whatever was
//! decoded so callers can report partial telemetry.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use regex::Regex;
use serde::Deserialize;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::time;
use tracing::{debug, info, warn};

use triage_common::format::last_n_lines;
use triage_common::{ProviderSettings, ProxyConfig};

use crate::events::{AgentEvent, StreamFold};

/// Default per-run timeout (seconds).
pub const DEFAULT_TIMEOUT_SECS: u64 = 1800;

const SESSION_ID_PATTERN: &str = r"Session ID: ([a-zA-Z0-9-]+)";

/// Environment variables that are safe to pass to the agent child process.
/// Everything else is stripped so ambient credentials (database URLs, signing
/// secrets) never reach the agent.
const SAFE_ENV_VARS: &[&str] = &[
    "HOME",
    "USER",
    "PATH",
    "SHELL",
    "TERM",
    "LANG",
    "LC_ALL",
    "TZ",
    "TMPDIR",
    "XDG_CONFIG_HOME",
    "XDG_DATA_HOME",
    "XDG_CACHE_HOME",
    "NODE_PATH",
    "NPM_CONFIG_PREFIX",
    "GIT_AUTHOR_NAME",
    "GIT_AUTHOR_EMAIL",
    "GIT_COMMITTER_NAME",
    "GIT_COMMITTER_EMAIL",
    "PYTHONPATH",
    "PYTHONDONTWRITEBYTECODE",
    "EDITOR",
    "VISUAL",
    "CLICOLOR",
    "FORCE_COLOR",
    "NO_COLOR",
    "COLORTERM",
    "TERM_PROGRAM",
];

/// Called with the full accumulated progress log each time it grows.
pub type ProgressFn = Arc<dyn Fn(String) + Send + Sync>;

fn default_binary() -> String {
    "codex".to_string()
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

fn default_env_prefix() -> String {
    "CODEX_".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorConfig {
    #[serde(default = "default_binary")]
    pub binary: String,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Ambient variables matching this prefix pass through to the child in
    /// addition to the fixed allowlist.
    #[serde(default = "default_env_prefix")]
    pub env_prefix: String,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            binary: default_binary(),
            working_dir: None,
            timeout_secs: default_timeout_secs(),
            env_prefix: default_env_prefix(),
        }
    }
}

pub struct RunRequest {
    pub incident_id: String,
    pub task: String,
    /// Resume token from a previous run; `None` starts a fresh session.
    pub session_id: Option<String>,
    pub provider: Option<ProviderSettings>,
    pub proxy: Option<ProxyConfig>,
    pub timeout: Option<Duration>,
    pub on_progress: Option<ProgressFn>,
}

impl RunRequest {
    pub fn new(incident_id: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            incident_id: incident_id.into(),
            task: task.into(),
            session_id: None,
            provider: None,
            proxy: None,
            timeout: None,
            on_progress: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunOutcome {
    pub output: String,
    pub session_id: Option<String>,
    pub error_messages: Vec<String>,
    pub full_log: String,
    pub tokens_used: u64,
    pub duration: Duration,
}

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("failed to spawn {binary}: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },
    #[error("agent login failed: {0}")]
    Auth(String),
    #[error("run timed out after {}s", .timeout.as_secs())]
    Timeout {
        timeout: Duration,
        partial: Box<RunOutcome>,
    },
    #[error("agent exited with {status}: {stderr_tail}")]
    Failed {
        status: std::process::ExitStatus,
        stderr_tail: String,
        partial: Box<RunOutcome>,
    },
    #[error("stream reader failed: {0}")]
    Stream(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ExecError {
    /// Telemetry decoded before the failure, when any.
    pub fn partial(&self) -> Option<&RunOutcome> {
        match self {
            ExecError::Timeout { partial, .. } | ExecError::Failed { partial, .. } => {
                Some(partial)
            }
            _ => None,
        }
    }
}

/// Prefixes a task with the current time and incident framing.
pub fn prepend_guidance(task: &str) -> String {
    format!(
        "Current time: {}\nPlease help with the following incident or request:\n\n{}",
        Utc::now().format("%Y-%m-%d %H:%M:%S UTC"),
        task
    )
}

/// Builds the filtered child environment: fixed allowlist plus the
/// configured prefix namespace.
pub fn build_safe_env(prefix: &str) -> Vec<(String, String)> {
    std::env::vars()
        .filter(|(key, _)| {
            SAFE_ENV_VARS.contains(&key.as_str()) || (!prefix.is_empty() && key.starts_with(prefix))
        })
        .collect()
}

pub struct Executor {
    config: ExecutorConfig,
}

impl Executor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Authenticates the CLI with an API key piped over stdin. The key never
    /// appears in the environment or argv.
    pub async fn authenticate(&self, api_key: &str) -> Result<(), ExecError> {
        let mut cmd = Command::new(&self.config.binary);
        cmd.args(["login", "--with-api-key"])
            .env_clear()
            .envs(build_safe_env(&self.config.env_prefix))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|source| ExecError::Spawn {
            binary: self.config.binary.clone(),
            source,
        })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(api_key.as_bytes()).await?;
            // dropping stdin closes the pipe and lets login proceed
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(ExecError::Auth(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        info!("agent CLI authenticated");
        Ok(())
    }

    pub async fn run(&self, req: RunRequest) -> Result<RunOutcome, ExecError> {
        if let Some(provider) = &req.provider {
            if !provider.api_key.is_empty() {
                self.authenticate(&provider.api_key).await?;
            }
        }

        let prompt = prepend_guidance(&req.task);
        let args = match req.session_id.as_deref() {
            None => vec![
                "exec".to_string(),
                "--skip-git-repo-check".to_string(),
                "--dangerously-bypass-approvals-and-sandbox".to_string(),
                "--json".to_string(),
                prompt,
            ],
            Some(session) => vec![
                "exec".to_string(),
                "resume".to_string(),
                session.to_string(),
                "--dangerously-bypass-approvals-and-sandbox".to_string(),
                "--json".to_string(),
                "--message".to_string(),
                prompt,
            ],
        };

        let mut cmd = Command::new(&self.config.binary);
        cmd.args(&args)
            .env_clear()
            .envs(build_safe_env(&self.config.env_prefix))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = &self.config.working_dir {
            cmd.current_dir(dir);
        }

        if let Some(provider) = &req.provider {
            if let Some(model) = provider.model.as_deref().filter(|m| !m.is_empty()) {
                cmd.env("CODEX_MODEL", model);
            }
            if let Some(effort) = provider
                .reasoning_effort
                .as_deref()
                .filter(|e| !e.is_empty())
            {
                cmd.env("CODEX_REASONING_EFFORT", effort);
            }
            if let Some(base_url) = provider.base_url.as_deref().filter(|u| !u.is_empty()) {
                cmd.env("OPENAI_BASE_URL", base_url);
            }
        }
        if let Some(proxy) = &req.proxy {
            if proxy.openai_enabled && !proxy.url.is_empty() {
                cmd.env("HTTP_PROXY", &proxy.url);
                cmd.env("HTTPS_PROXY", &proxy.url);
            }
            if !proxy.no_proxy.is_empty() {
                cmd.env("NO_PROXY", &proxy.no_proxy);
            }
        }

        let started = Instant::now();
        let mut child = cmd.spawn().map_err(|source| ExecError::Spawn {
            binary: self.config.binary.clone(),
            source,
        })?;
        info!(
            incident_id = %req.incident_id,
            binary = %self.config.binary,
            resume = req.session_id.is_some(),
            "agent run started"
        );

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ExecError::Stream("stdout pipe unavailable".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ExecError::Stream("stderr pipe unavailable".into()))?;

        let on_progress = req.on_progress.clone();
        let stdout_drain = async move {
            let mut fold = StreamFold::new();
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<AgentEvent>(&line) {
                            Ok(event) => {
                                if fold.apply(&event) {
                                    if let Some(cb) = &on_progress {
                                        cb(fold.progress_log());
                                    }
                                }
                            }
                            Err(err) => {
                                // broken stream; keep what was decoded so far
                                warn!(error = %err, events = fold.events_seen(), "event decode failed, stopping");
                                break;
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        warn!(error = %err, "stdout read failed");
                        break;
                    }
                }
            }
            fold
        };

        let stderr_drain = async move {
            let session_re = Regex::new(SESSION_ID_PATTERN).ok();
            let mut session_id: Option<String> = None;
            let mut collected: Vec<String> = Vec::new();
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if session_id.is_none() {
                    if let Some(re) = &session_re {
                        if let Some(caps) = re.captures(&line) {
                            session_id = caps.get(1).map(|m| m.as_str().to_string());
                            debug!(session_id = ?session_id, "session token extracted");
                        }
                    }
                }
                collected.push(line);
            }
            (session_id, collected)
        };

        // Both pipes must be fully drained before wait(): wait() closes them
        // and trailing events would be lost. The deadline only decides when
        // to kill the child; after the kill both drains run to EOF.
        let run_timeout = req
            .timeout
            .unwrap_or(Duration::from_secs(self.config.timeout_secs));
        tokio::pin!(stdout_drain, stderr_drain);
        let deadline = time::sleep(run_timeout);
        tokio::pin!(deadline);

        let mut fold: Option<StreamFold> = None;
        let mut stderr_state: Option<(Option<String>, Vec<String>)> = None;
        let mut timed_out = false;
        while fold.is_none() || stderr_state.is_none() {
            tokio::select! {
                folded = &mut stdout_drain, if fold.is_none() => fold = Some(folded),
                drained = &mut stderr_drain, if stderr_state.is_none() => stderr_state = Some(drained),
                _ = &mut deadline, if !timed_out => {
                    timed_out = true;
                    warn!(incident_id = %req.incident_id, "run deadline hit, killing agent");
                    let _ = child.start_kill();
                }
            }
        }
        let fold = fold.unwrap_or_default();
        let (extracted_session, stderr_lines) = stderr_state.unwrap_or_default();

        let status = child.wait().await?;
        let duration = started.elapsed();

        let outcome = RunOutcome {
            output: fold.final_output(),
            session_id: extracted_session.or_else(|| req.session_id.clone()),
            error_messages: fold.error_messages.clone(),
            full_log: fold.progress_log(),
            tokens_used: fold.tokens_used,
            duration,
        };

        info!(
            incident_id = %req.incident_id,
            events = fold.events_seen(),
            tokens = outcome.tokens_used,
            elapsed_ms = duration.as_millis() as u64,
            exit = ?status.code(),
            "agent run finished"
        );

        if timed_out {
            return Err(ExecError::Timeout {
                timeout: run_timeout,
                partial: Box::new(outcome),
            });
        }
        if !status.success() {
            let stderr_tail = last_n_lines(&stderr_lines.join("\n"), 10);
            return Err(ExecError::Failed {
                status,
                stderr_tail,
                partial: Box::new(outcome),
            });
        }
        Ok(outcome)
    }
}
