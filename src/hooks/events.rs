//! Hook event types consumed by the learning service.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A tool invocation failed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolFailureEvent {
    pub session_id: String,
    pub project_id: Option<String>,
    pub tool_name: String,
    pub error_type: String,
    pub error_message: String,
    pub timestamp: DateTime<Utc>,
}

/// A subagent finished.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubagentCompletionEvent {
    pub session_id: String,
    pub project_id: Option<String>,
    pub subagent_type: String,
    pub success: bool,
    pub result_summary: String,
    pub result_size: usize,
    pub duration_ms: u64,
}

/// An error notification surfaced to the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorNotificationEvent {
    pub session_id: String,
    pub project_id: Option<String>,
    pub error_type: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// A tool invocation succeeded with output worth mining.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSuccessEvent {
    pub session_id: String,
    pub project_id: Option<String>,
    pub tool_name: String,
    pub tool_output: String,
}

/// Any hook event, for single-channel consumers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HookEvent {
    ToolFailure(ToolFailureEvent),
    SubagentCompletion(SubagentCompletionEvent),
    ErrorNotification(ErrorNotificationEvent),
    ToolSuccess(ToolSuccessEvent),
}

impl HookEvent {
    /// The session the event belongs to.
    pub fn session_id(&self) -> &str {
        match self {
            Self::ToolFailure(e) => &e.session_id,
            Self::SubagentCompletion(e) => &e.session_id,
            Self::ErrorNotification(e) => &e.session_id,
            Self::ToolSuccess(e) => &e.session_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tagged_serialization() {
        let event = HookEvent::ToolFailure(ToolFailureEvent {
            session_id: "s1".into(),
            project_id: None,
            tool_name: "Bash".into(),
            error_type: "non_zero_exit".into(),
            error_message: "exit code 1".into(),
            timestamp: Utc::now(),
        });

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "tool_failure");
        assert_eq!(json["tool_name"], "Bash");

        let back: HookEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back.session_id(), "s1");
    }
}
