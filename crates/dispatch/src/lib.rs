//! Incident dispatch core: routes incident work to the connected agent
//! worker over a persistent WebSocket, or runs the agent in-process when no
//! worker is available. Callers interact through three callbacks per
//! incident (output, completed, error); exactly one terminal callback fires.

pub mod gateway;
pub mod local;
pub mod registry;
pub mod service;
pub mod sink;

use thiserror::Error;

pub use gateway::AgentGateway;
pub use local::LocalRunner;
pub use registry::{CallbackRegistry, CompletionInfo, IncidentCallbacks};
pub use service::{DispatchMode, DispatchService};
pub use sink::IncidentSink;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("no agent worker connected")]
    WorkerNotConnected,
    #[error("failed to send to worker: {0}")]
    SendFailed(String),
    #[error("failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),
}
