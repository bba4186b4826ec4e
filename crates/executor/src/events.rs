//! Decoding and folding of the agent CLI's `--json` event stream.
//!
//! The CLI emits newline-delimited JSON on stdout. Each decoded event is fed
//! into a [`StreamFold`] which accumulates the final answer, a human-readable
//! progress log, error messages and token usage.

use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Clone, Deserialize)]
pub struct AgentEvent {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub error: Option<Value>,
    #[serde(default)]
    pub item: Option<EventItem>,
    #[serde(default)]
    pub usage: Option<TokenUsage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventItem {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub aggregated_output: String,
    #[serde(default)]
    pub exit_code: Option<i64>,
    #[serde(default)]
    pub status: String,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub cached_input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

/// Accumulator for one run's event stream.
#[derive(Debug, Default)]
pub struct StreamFold {
    output_parts: Vec<String>,
    last_reasoning: String,
    progress: Vec<String>,
    pub error_messages: Vec<String>,
    pub tokens_used: u64,
    events_seen: usize,
}

impl StreamFold {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds one event in. Returns true when the progress log grew, so the
    /// caller knows to push an update to observers.
    pub fn apply(&mut self, event: &AgentEvent) -> bool {
        self.events_seen += 1;
        let mut changed = false;

        if event.kind == "error" {
            if let Some(msg) = event.message.as_deref().filter(|m| !m.is_empty()) {
                self.error_messages.push(msg.to_string());
                self.progress.push(format!("❌ Error: {}", msg));
                changed = true;
            }
        }

        if event.kind == "item.completed" {
            if let Some(item) = &event.item {
                let line = match item.kind.as_str() {
                    "agent_message" => {
                        self.output_parts.push(item.text.clone());
                        Some(format!("📝 Response ready ({} chars)", item.text.len()))
                    }
                    "reasoning" => {
                        // kept as fallback output when no agent_message arrives
                        self.last_reasoning = item.text.clone();
                        Some(format!("🤔 {}", item.text))
                    }
                    "command_execution" => {
                        let (mark, verb) = if item.status == "completed" {
                            ("✅", "Ran")
                        } else {
                            ("❌", "Failed")
                        };
                        if item.aggregated_output.is_empty() {
                            Some(format!("{} {}: {}", mark, verb, item.command))
                        } else {
                            Some(format!(
                                "{} {}: {}\nOutput:\n{}",
                                mark, verb, item.command, item.aggregated_output
                            ))
                        }
                    }
                    _ => None,
                };
                if let Some(line) = line {
                    self.progress.push(line);
                    changed = true;
                }
            }
        }

        if event.kind == "turn.completed" {
            if let Some(usage) = &event.usage {
                // last turn wins
                self.tokens_used = usage.input_tokens + usage.output_tokens;
            }
        }

        changed
    }

    /// Full human-readable progress log accumulated so far.
    pub fn progress_log(&self) -> String {
        self.progress.join("\n")
    }

    /// Final answer: agent messages joined with newlines, or the last
    /// reasoning text when the model never produced a message.
    pub fn final_output(&self) -> String {
        let joined = self.output_parts.join("\n");
        let trimmed = joined.trim();
        if trimmed.is_empty() {
            self.last_reasoning.clone()
        } else {
            trimmed.to_string()
        }
    }

    pub fn events_seen(&self) -> usize {
        self.events_seen
    }
}
