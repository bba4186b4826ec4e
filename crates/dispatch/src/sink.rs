//! Persistence seam for incident state. The dispatch core never talks to
//! storage directly; the embedding application implements this trait and
//! frames that arrive with no registered callback (for example after a
//! restart) are persisted through it instead of being dropped.

use async_trait::async_trait;

use crate::registry::CompletionInfo;

#[async_trait]
pub trait IncidentSink: Send + Sync {
    /// Appends streamed progress output to the incident's log.
    async fn append_output(&self, incident_id: &str, output: &str);

    /// Records a completed run that no caller was waiting on.
    async fn complete(&self, incident_id: &str, info: &CompletionInfo);

    /// Records a failed run that no caller was waiting on.
    async fn fail(&self, incident_id: &str, error: &str);
}
