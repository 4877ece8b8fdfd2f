//! Artifact envelope and payload types.
//!
//! Four artifact kinds share a common envelope and differ only in payload:
//!
//! - **Guideline**: rules an agent should follow
//! - **Tool**: a tool description with parameters and constraints
//! - **Knowledge**: facts with validity windows and confidence
//! - **Experience**: an outcome with an ordered trajectory of steps
//!
//! Updates never rewrite a version; they append a new one and swap the head.

use crate::scope::Scope;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Kind discriminator for stored artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryType {
    Guideline,
    Tool,
    Knowledge,
    Experience,
}

impl EntryType {
    /// All artifact kinds.
    pub const ALL: [EntryType; 4] = [
        EntryType::Guideline,
        EntryType::Tool,
        EntryType::Knowledge,
        EntryType::Experience,
    ];
}

impl std::fmt::Display for EntryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Guideline => "guideline",
            Self::Tool => "tool",
            Self::Knowledge => "knowledge",
            Self::Experience => "experience",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for EntryType {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> crate::error::Result<Self> {
        match s {
            "guideline" => Ok(Self::Guideline),
            "tool" => Ok(Self::Tool),
            "knowledge" => Ok(Self::Knowledge),
            "experience" => Ok(Self::Experience),
            other => Err(crate::error::Error::validation(
                "entry_type",
                format!("unknown entry type '{}'", other),
            )),
        }
    }
}

/// Envelope shared by every artifact kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Opaque id, unique within a kind
    pub id: String,
    /// Kind discriminator
    pub entry_type: EntryType,
    /// Owning scope
    pub scope: Scope,
    /// Head of the version chain
    pub current_version_id: String,
    /// Head version number (dense, starts at 1)
    pub version_num: i64,
    /// Inactive artifacts are hidden from default queries but keep history
    pub is_active: bool,
    /// Monotonic read counter, updated out-of-band
    pub access_count: i64,
    /// Last read time, updated out-of-band
    pub last_accessed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Envelope {
    /// Create a fresh envelope with a v1 head.
    pub fn new(entry_type: EntryType, scope: Scope) -> Self {
        let now = Utc::now();
        let id = Uuid::new_v4().to_string();
        Self {
            current_version_id: format!("{}:v1", id),
            id,
            entry_type,
            scope,
            version_num: 1,
            is_active: true,
            access_count: 0,
            last_accessed_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A guideline: a rule agents should follow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Guideline {
    pub envelope: Envelope,
    pub name: String,
    pub priority: i64,
    pub category: Option<String>,
    pub content: String,
    pub rationale: Option<String>,
    pub examples: Vec<String>,
}

/// A tool description: what a tool does and how to call it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCard {
    pub envelope: Envelope,
    pub name: String,
    pub category: Option<String>,
    pub description: String,
    /// JSON schema-ish parameter description
    pub parameters: Option<Value>,
    pub constraints: Vec<String>,
}

/// A knowledge entry: a fact with a validity window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Knowledge {
    pub envelope: Envelope,
    pub title: String,
    pub category: Option<String>,
    pub content: String,
    pub source: Option<String>,
    pub confidence: f64,
    pub valid_from: Option<DateTime<Utc>>,
    pub valid_until: Option<DateTime<Utc>>,
    /// Id of the newer entry that superseded this one
    pub invalidated_by: Option<String>,
}

/// Generalization level of an experience.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExperienceLevel {
    /// A single concrete occurrence
    Case,
    /// A generalized strategy distilled from cases
    Strategy,
}

impl std::fmt::Display for ExperienceLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Case => write!(f, "case"),
            Self::Strategy => write!(f, "strategy"),
        }
    }
}

impl std::str::FromStr for ExperienceLevel {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> crate::error::Result<Self> {
        match s {
            "case" => Ok(Self::Case),
            "strategy" => Ok(Self::Strategy),
            other => Err(crate::error::Error::validation(
                "level",
                format!("unknown experience level '{}'", other),
            )),
        }
    }
}

/// An experience: something that happened, with its trajectory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Experience {
    pub envelope: Envelope,
    pub title: String,
    pub level: ExperienceLevel,
    pub category: Option<String>,
    pub scenario: Option<String>,
    pub outcome: Option<String>,
    pub content: String,
    pub confidence: f64,
}

/// One ordered step of an experience trajectory. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryStep {
    pub step_num: i64,
    pub action: String,
    pub observation: Option<String>,
    pub reasoning: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl TrajectoryStep {
    pub fn new(step_num: i64, action: impl Into<String>) -> Self {
        Self {
            step_num,
            action: action.into(),
            observation: None,
            reasoning: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_observation(mut self, observation: impl Into<String>) -> Self {
        self.observation = Some(observation.into());
        self
    }

    pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = Some(reasoning.into());
        self
    }
}

/// One immutable row of a version chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionRecord {
    pub version_id: String,
    pub entry_id: String,
    pub version_num: i64,
    /// Full payload snapshot at this version
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

/// Input for creating or updating a guideline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GuidelineInput {
    pub name: String,
    pub priority: Option<i64>,
    pub category: Option<String>,
    pub content: String,
    pub rationale: Option<String>,
    #[serde(default)]
    pub examples: Vec<String>,
}

/// Input for creating or updating a tool card.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolInput {
    pub name: String,
    pub category: Option<String>,
    pub description: String,
    pub parameters: Option<Value>,
    #[serde(default)]
    pub constraints: Vec<String>,
}

/// Input for creating or updating a knowledge entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KnowledgeInput {
    pub title: String,
    pub category: Option<String>,
    pub content: String,
    pub source: Option<String>,
    pub confidence: Option<f64>,
    pub valid_from: Option<DateTime<Utc>>,
    pub valid_until: Option<DateTime<Utc>>,
}

/// Input for creating or updating an experience.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperienceInput {
    pub title: String,
    pub level: ExperienceLevel,
    pub category: Option<String>,
    pub scenario: Option<String>,
    pub outcome: Option<String>,
    pub content: String,
    pub confidence: Option<f64>,
}

impl Default for ExperienceInput {
    fn default() -> Self {
        Self {
            title: String::new(),
            level: ExperienceLevel::Case,
            category: None,
            scenario: None,
            outcome: None,
            content: String::new(),
            confidence: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::ScopeType;

    #[test]
    fn test_new_envelope_starts_at_v1() {
        let env = Envelope::new(EntryType::Guideline, Scope::global());
        assert_eq!(env.version_num, 1);
        assert_eq!(env.current_version_id, format!("{}:v1", env.id));
        assert!(env.is_active);
        assert_eq!(env.access_count, 0);
    }

    #[test]
    fn test_entry_type_round_trip() {
        for et in EntryType::ALL {
            let parsed: EntryType = et.to_string().parse().unwrap();
            assert_eq!(parsed, et);
        }
    }

    #[test]
    fn test_trajectory_step_builder() {
        let step = TrajectoryStep::new(1, "ran cargo test")
            .with_observation("3 failures")
            .with_reasoning("flaky network tests");
        assert_eq!(step.step_num, 1);
        assert_eq!(step.observation.as_deref(), Some("3 failures"));
    }

    #[test]
    fn test_scoped_envelope() {
        let scope = Scope::of(ScopeType::Project, "proj-1").unwrap();
        let env = Envelope::new(EntryType::Experience, scope.clone());
        assert_eq!(env.scope, scope);
    }
}
