//! Wire protocol shared between the dispatch gateway and agent workers.
//!
//! Every frame in both directions is one flat JSON envelope. Optional fields
//! are omitted when absent so either side can evolve independently; unknown
//! message types must be ignored, not rejected.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    // gateway -> worker
    NewIncident,
    ContinueIncident,
    CancelIncident,
    ProxyConfigUpdate,
    // worker -> gateway
    CodexOutput,
    CodexCompleted,
    CodexError,
    Heartbeat,
    Status,
    #[serde(other)]
    Unknown,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::NewIncident => "new_incident",
            MessageType::ContinueIncident => "continue_incident",
            MessageType::CancelIncident => "cancel_incident",
            MessageType::ProxyConfigUpdate => "proxy_config_update",
            MessageType::CodexOutput => "codex_output",
            MessageType::CodexCompleted => "codex_completed",
            MessageType::CodexError => "codex_error",
            MessageType::Heartbeat => "heartbeat",
            MessageType::Status => "status",
            MessageType::Unknown => "unknown",
        }
    }
}

/// Proxy configuration pushed to workers so agent traffic can be routed
/// through an egress proxy per integration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub no_proxy: String,
    #[serde(default)]
    pub openai_enabled: bool,
    #[serde(default)]
    pub slack_enabled: bool,
    #[serde(default)]
    pub zabbix_enabled: bool,
}

/// Model-provider credentials and overrides for a single run. Carried inside
/// `new_incident` / `continue_incident` frames only; the API key never comes
/// from the ambient environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProviderSettings {
    pub provider: String,
    pub api_key: String,
    pub model: Option<String>,
    pub reasoning_effort: Option<String>,
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub incident_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_used: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_time_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub openai_api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_config: Option<ProxyConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub enabled_skills: Vec<String>,
}

impl Envelope {
    pub fn new(kind: MessageType) -> Self {
        Self {
            kind,
            incident_id: None,
            task: None,
            message: None,
            output: None,
            session_id: None,
            error: None,
            data: None,
            tokens_used: None,
            execution_time_ms: None,
            provider: None,
            openai_api_key: None,
            model: None,
            reasoning_effort: None,
            base_url: None,
            proxy_config: None,
            enabled_skills: Vec::new(),
        }
    }

    pub fn with_incident(kind: MessageType, incident_id: impl Into<String>) -> Self {
        let mut env = Self::new(kind);
        env.incident_id = Some(incident_id.into());
        env
    }

    /// Copies provider overrides into the envelope fields the worker reads.
    pub fn apply_provider(&mut self, settings: &ProviderSettings) {
        self.provider = Some(settings.provider.clone());
        self.openai_api_key = Some(settings.api_key.clone());
        self.model = settings.model.clone();
        self.reasoning_effort = settings.reasoning_effort.clone();
        self.base_url = settings.base_url.clone();
    }

    /// Reassembles provider settings on the worker side. Returns `None` when
    /// the frame carried no credential, in which case the worker falls back
    /// to whatever its own configuration provides.
    pub fn provider_settings(&self) -> Option<ProviderSettings> {
        let api_key = self.openai_api_key.clone()?;
        Some(ProviderSettings {
            provider: self
                .provider
                .clone()
                .unwrap_or_else(|| "openai".to_string()),
            api_key,
            model: self.model.clone(),
            reasoning_effort: self.reasoning_effort.clone(),
            base_url: self.base_url.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_type_round_trips_wire_names() {
        let json = serde_json::to_string(&MessageType::CodexCompleted).unwrap();
        assert_eq!(json, "\"codex_completed\"");
        let back: MessageType = serde_json::from_str("\"new_incident\"").unwrap();
        assert_eq!(back, MessageType::NewIncident);
    }

    #[test]
    fn unknown_message_type_is_tolerated() {
        let msg: Envelope =
            serde_json::from_str(r#"{"type":"shiny_new_thing","incident_id":"inc-1"}"#).unwrap();
        assert_eq!(msg.kind, MessageType::Unknown);
        assert_eq!(msg.incident_id.as_deref(), Some("inc-1"));
    }

    #[test]
    fn envelope_skips_absent_fields() {
        let env = Envelope::with_incident(MessageType::CancelIncident, "inc-9");
        let json = serde_json::to_string(&env).unwrap();
        assert_eq!(json, r#"{"type":"cancel_incident","incident_id":"inc-9"}"#);
    }

    #[test]
    fn provider_settings_round_trip_through_envelope() {
        let settings = ProviderSettings {
            provider: "openai".into(),
            api_key: "sk-test".into(),
            model: Some("o4-mini".into()),
            reasoning_effort: Some("high".into()),
            base_url: None,
        };
        let mut env = Envelope::with_incident(MessageType::NewIncident, "inc-2");
        env.apply_provider(&settings);
        let decoded: Envelope =
            serde_json::from_str(&serde_json::to_string(&env).unwrap()).unwrap();
        assert_eq!(decoded.provider_settings(), Some(settings));
    }

    #[test]
    fn missing_api_key_yields_no_provider_settings() {
        let env = Envelope::with_incident(MessageType::NewIncident, "inc-3");
        assert!(env.provider_settings().is_none());
    }
}
