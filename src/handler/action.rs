//! Tool request/response envelope and the action vocabulary.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Actions every artifact tool accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Add,
    Update,
    Get,
    List,
    History,
    Deactivate,
    Delete,
    BulkAdd,
    BulkUpdate,
    BulkDelete,
}

impl Action {
    /// Whether this action mutates state.
    pub fn is_mutation(&self) -> bool {
        !matches!(self, Self::Get | Self::List | Self::History)
    }

    /// Whether this action operates on a batch of items.
    pub fn is_bulk(&self) -> bool {
        matches!(self, Self::BulkAdd | Self::BulkUpdate | Self::BulkDelete)
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Add => "add",
            Self::Update => "update",
            Self::Get => "get",
            Self::List => "list",
            Self::History => "history",
            Self::Deactivate => "deactivate",
            Self::Delete => "delete",
            Self::BulkAdd => "bulk_add",
            Self::BulkUpdate => "bulk_update",
            Self::BulkDelete => "bulk_delete",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for Action {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "add" => Ok(Self::Add),
            "update" => Ok(Self::Update),
            "get" => Ok(Self::Get),
            "list" => Ok(Self::List),
            "history" => Ok(Self::History),
            "deactivate" => Ok(Self::Deactivate),
            "delete" => Ok(Self::Delete),
            "bulk_add" => Ok(Self::BulkAdd),
            "bulk_update" => Ok(Self::BulkUpdate),
            "bulk_delete" => Ok(Self::BulkDelete),
            other => Err(Error::validation(
                "action",
                format!("unknown action '{}'", other),
            )),
        }
    }
}

/// One tool call.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolRequest {
    pub action: String,
    /// The calling agent
    pub agent_id: String,
    /// Action-specific parameters
    #[serde(default)]
    pub params: Value,
}

impl ToolRequest {
    pub fn new(action: &str, agent_id: &str, params: Value) -> Self {
        Self {
            action: action.to_string(),
            agent_id: agent_id.to_string(),
            params,
        }
    }

    /// A required string parameter.
    pub fn required_str(&self, field: &str) -> Result<&str> {
        self.params[field]
            .as_str()
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| Error::validation(field, "is required"))
    }

    /// An optional string parameter.
    pub fn optional_str(&self, field: &str) -> Option<&str> {
        self.params[field].as_str().filter(|s| !s.trim().is_empty())
    }
}

/// Pagination metadata attached to list responses.
#[derive(Debug, Clone, Serialize)]
pub struct ListMeta {
    #[serde(rename = "returnedCount")]
    pub returned_count: usize,
    #[serde(rename = "hasMore")]
    pub has_more: bool,
    #[serde(rename = "nextCursor", skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_action_round_trip() {
        for action in [
            Action::Add,
            Action::BulkDelete,
            Action::History,
            Action::List,
        ] {
            let parsed: Action = action.to_string().parse().unwrap();
            assert_eq!(parsed, action);
        }
        assert!("explode".parse::<Action>().is_err());
    }

    #[test]
    fn test_mutation_and_bulk_classification() {
        assert!(Action::Add.is_mutation());
        assert!(Action::Delete.is_mutation());
        assert!(!Action::Get.is_mutation());
        assert!(!Action::List.is_mutation());
        assert!(Action::BulkAdd.is_bulk());
        assert!(!Action::Update.is_bulk());
    }

    #[test]
    fn test_request_param_helpers() {
        let request = ToolRequest::new("add", "agent-a", json!({"name": "x", "blank": "  "}));
        assert_eq!(request.required_str("name").unwrap(), "x");
        assert!(request.required_str("missing").is_err());
        assert!(request.optional_str("blank").is_none());
    }
}
