//! Per-incident callback registry.
//!
//! Maps in-flight incident ids to the callbacks of whoever started them.
//! The map lock is never held while a callback runs, and terminal dispatch
//! removes the registration unconditionally so each incident sees exactly
//! one terminal callback.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use tracing::{debug, warn};

use crate::sink::IncidentSink;

/// Terminal result handed to `on_completed`. `output` already carries the
/// execution-metrics footer.
#[derive(Debug, Clone, Default)]
pub struct CompletionInfo {
    pub output: String,
    pub session_id: Option<String>,
    pub tokens_used: u64,
    pub duration: Duration,
}

pub struct IncidentCallbacks {
    pub on_output: Arc<dyn Fn(String) + Send + Sync>,
    pub on_completed: Box<dyn FnOnce(CompletionInfo) + Send + Sync>,
    pub on_error: Box<dyn FnOnce(String) + Send + Sync>,
}

impl IncidentCallbacks {
    pub fn new(
        on_output: impl Fn(String) + Send + Sync + 'static,
        on_completed: impl FnOnce(CompletionInfo) + Send + Sync + 'static,
        on_error: impl FnOnce(String) + Send + Sync + 'static,
    ) -> Self {
        Self {
            on_output: Arc::new(on_output),
            on_completed: Box::new(on_completed),
            on_error: Box::new(on_error),
        }
    }
}

pub struct CallbackRegistry {
    entries: RwLock<HashMap<String, IncidentCallbacks>>,
    sink: Arc<dyn IncidentSink>,
}

impl CallbackRegistry {
    pub fn new(sink: Arc<dyn IncidentSink>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            sink,
        }
    }

    /// Registers (or replaces) the callbacks for an incident.
    pub fn register(&self, incident_id: &str, callbacks: IncidentCallbacks) {
        let mut entries = self.write_entries();
        entries.insert(incident_id.to_string(), callbacks);
    }

    /// Drops a registration, e.g. to roll back after a failed send.
    pub fn remove(&self, incident_id: &str) -> bool {
        self.write_entries().remove(incident_id).is_some()
    }

    pub fn is_registered(&self, incident_id: &str) -> bool {
        self.read_entries().contains_key(incident_id)
    }

    /// Streamed output. The registration stays; output with no registration
    /// is persisted instead of dropped. Lookups only take the read lock, so
    /// output for different incidents never queues behind itself.
    pub async fn dispatch_output(&self, incident_id: &str, output: String) {
        let handler = {
            let entries = self.read_entries();
            entries.get(incident_id).map(|cb| cb.on_output.clone())
        };
        match handler {
            Some(on_output) => on_output(output),
            None => {
                debug!(incident_id = %incident_id, "output without registration, persisting");
                self.sink.append_output(incident_id, &output).await;
            }
        }
    }

    /// Terminal success. Removes the registration whether or not a callback
    /// was present.
    pub async fn dispatch_completed(&self, incident_id: &str, info: CompletionInfo) {
        let entry = self.write_entries().remove(incident_id);
        match entry {
            Some(callbacks) => (callbacks.on_completed)(info),
            None => {
                warn!(incident_id = %incident_id, "completion without registration, persisting");
                self.sink.complete(incident_id, &info).await;
            }
        }
    }

    /// Terminal failure. Removes the registration whether or not a callback
    /// was present.
    pub async fn dispatch_error(&self, incident_id: &str, error: String) {
        let entry = self.write_entries().remove(incident_id);
        match entry {
            Some(callbacks) => (callbacks.on_error)(error),
            None => {
                warn!(incident_id = %incident_id, error = %error, "error without registration, persisting");
                self.sink.fail(incident_id, &error).await;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.read_entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read_entries().is_empty()
    }

    fn read_entries(&self) -> RwLockReadGuard<'_, HashMap<String, IncidentCallbacks>> {
        match self.entries.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write_entries(&self) -> RwLockWriteGuard<'_, HashMap<String, IncidentCallbacks>> {
        match self.entries.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
