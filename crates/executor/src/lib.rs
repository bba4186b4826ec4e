// # -----------------------------
// # crates/executor/src/lib.rs
// # -----------------------------
pub mod events;
pub mod runner;

pub use events::{AgentEvent, StreamFold, TokenUsage};
pub use runner::{
    prepend_guidance, ExecError, Executor, ExecutorConfig, ProgressFn, RunOutcome, RunRequest,
    DEFAULT_TIMEOUT_SECS,
};
