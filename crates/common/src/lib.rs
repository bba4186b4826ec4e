// # -----------------------------
// # crates/common/src/lib.rs
// # -----------------------------
pub mod format;
pub mod protocol;

pub use protocol::{Envelope, MessageType, ProviderSettings, ProxyConfig};
