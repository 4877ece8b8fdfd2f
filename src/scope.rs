//! Scope hierarchy for memory artifacts.
//!
//! Every artifact is pinned to exactly one scope. Lookups walk from the most
//! specific scope upward:
//!
//! - **Session**: a single agent conversation
//! - **Agent**: one agent identity across sessions
//! - **Project**: a working directory / repository
//! - **Org**: an organization of projects
//! - **Global**: shared by everyone

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// A level in the ownership hierarchy.
///
/// Ordering follows specificity: `Global` is the least specific,
/// `Session` the most.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopeType {
    Global,
    Org,
    Project,
    Agent,
    Session,
}

impl ScopeType {
    /// All scope types from least to most specific.
    pub const ALL: [ScopeType; 5] = [
        ScopeType::Global,
        ScopeType::Org,
        ScopeType::Project,
        ScopeType::Agent,
        ScopeType::Session,
    ];

    /// The next less specific scope, if any.
    pub fn parent(&self) -> Option<ScopeType> {
        match self {
            Self::Global => None,
            Self::Org => Some(Self::Global),
            Self::Project => Some(Self::Org),
            Self::Agent => Some(Self::Project),
            Self::Session => Some(Self::Agent),
        }
    }

    /// Walk from this scope upward to `Global`, inclusive.
    pub fn chain(&self) -> Vec<ScopeType> {
        let mut out = vec![*self];
        let mut cur = *self;
        while let Some(parent) = cur.parent() {
            out.push(parent);
            cur = parent;
        }
        out
    }

    /// Whether artifacts at this scope require a scope id.
    pub fn requires_id(&self) -> bool {
        !matches!(self, Self::Global)
    }
}

impl std::fmt::Display for ScopeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Global => "global",
            Self::Org => "org",
            Self::Project => "project",
            Self::Agent => "agent",
            Self::Session => "session",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for ScopeType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "global" => Ok(Self::Global),
            "org" => Ok(Self::Org),
            "project" => Ok(Self::Project),
            "agent" => Ok(Self::Agent),
            "session" => Ok(Self::Session),
            other => Err(Error::validation(
                "scope_type",
                format!("unknown scope type '{}'", other),
            )),
        }
    }
}

/// A fully resolved scope: type plus id (`None` only for `Global`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Scope {
    pub scope_type: ScopeType,
    pub scope_id: Option<String>,
}

impl Scope {
    /// The global scope.
    pub fn global() -> Self {
        Self {
            scope_type: ScopeType::Global,
            scope_id: None,
        }
    }

    /// Create a scope, validating the NULL-iff-global invariant.
    pub fn new(scope_type: ScopeType, scope_id: Option<String>) -> Result<Self> {
        match (scope_type.requires_id(), &scope_id) {
            (true, None) => Err(Error::validation(
                "scope_id",
                format!("scope type '{}' requires a scope_id", scope_type),
            )),
            (false, Some(_)) => Err(Error::validation(
                "scope_id",
                "global scope must not carry a scope_id",
            )),
            _ => Ok(Self {
                scope_type,
                scope_id,
            }),
        }
    }

    /// Create a non-global scope.
    pub fn of(scope_type: ScopeType, scope_id: impl Into<String>) -> Result<Self> {
        Self::new(scope_type, Some(scope_id.into()))
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.scope_id {
            Some(id) => write!(f, "{}:{}", self.scope_type, id),
            None => write!(f, "{}", self.scope_type),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_walks_upward() {
        let chain = ScopeType::Session.chain();
        assert_eq!(
            chain,
            vec![
                ScopeType::Session,
                ScopeType::Agent,
                ScopeType::Project,
                ScopeType::Org,
                ScopeType::Global,
            ]
        );
        assert_eq!(ScopeType::Global.chain(), vec![ScopeType::Global]);
    }

    #[test]
    fn test_specificity_ordering() {
        assert!(ScopeType::Session > ScopeType::Project);
        assert!(ScopeType::Global < ScopeType::Org);
    }

    #[test]
    fn test_scope_id_invariant() {
        assert!(Scope::new(ScopeType::Global, None).is_ok());
        assert!(Scope::new(ScopeType::Global, Some("x".into())).is_err());
        assert!(Scope::new(ScopeType::Project, None).is_err());
        assert!(Scope::of(ScopeType::Project, "proj-1").is_ok());
    }

    #[test]
    fn test_round_trip_parse() {
        for st in ScopeType::ALL {
            let parsed: ScopeType = st.to_string().parse().unwrap();
            assert_eq!(parsed, st);
        }
        assert!("workspace".parse::<ScopeType>().is_err());
    }
}
