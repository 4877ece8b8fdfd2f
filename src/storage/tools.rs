//! Tool repository.

use crate::artifact::{EntryType, Envelope, ToolCard, ToolInput, VersionRecord};
use crate::cursor::CursorCodec;
use crate::error::{Error, Result};
use crate::scope::{Scope, ScopeType};
use crate::storage::adapter::StorageAdapter;
use crate::storage::repository::{
    no_parent_scopes, AccessTracker, EntryCore, EntryFilter, EntryRecord, Page,
};
use serde_json::json;
use std::sync::Arc;

/// Versioned CRUD for tool descriptions.
pub struct ToolRepository {
    core: EntryCore,
}

impl ToolRepository {
    pub fn new(adapter: Arc<StorageAdapter>, cursors: CursorCodec) -> Self {
        Self {
            core: EntryCore::new(adapter, EntryType::Tool, cursors),
        }
    }

    pub fn with_tracker(mut self, tracker: AccessTracker) -> Self {
        self.core = self.core.with_tracker(tracker);
        self
    }

    pub fn create(&self, scope: &Scope, input: &ToolInput) -> Result<ToolCard> {
        if input.name.trim().is_empty() {
            return Err(Error::validation("name", "tool name is required"));
        }
        if input.description.trim().is_empty() {
            return Err(Error::validation(
                "description",
                "tool description is required",
            ));
        }

        let payload = payload_of(input);
        let envelope = self
            .core
            .create(scope, &input.name, &input.description, &payload)?;
        Ok(from_parts(envelope, input))
    }

    pub fn update(&self, id: &str, input: &ToolInput) -> Result<ToolCard> {
        let payload = payload_of(input);
        let envelope = self
            .core
            .update(id, &input.name, &input.description, &payload)?;
        Ok(from_parts(envelope, input))
    }

    pub fn get_by_id(&self, id: &str) -> Result<Option<ToolCard>> {
        Ok(self.core.get_by_id(id)?.map(from_record))
    }

    pub fn get_by_name(
        &self,
        name: &str,
        scope_type: ScopeType,
        scope_id: Option<&str>,
        inherit: bool,
    ) -> Result<Option<ToolCard>> {
        Ok(self
            .core
            .get_by_name(name, scope_type, scope_id, inherit, &no_parent_scopes)?
            .map(from_record))
    }

    pub fn list(
        &self,
        filter: &EntryFilter,
        limit: u64,
        cursor: Option<&str>,
    ) -> Result<Page<ToolCard>> {
        Ok(self.core.list(filter, limit, cursor)?.map(from_record))
    }

    pub fn get_history(&self, id: &str) -> Result<Vec<VersionRecord>> {
        self.core.get_history(id)
    }

    pub fn deactivate(&self, id: &str) -> Result<()> {
        self.core.set_active(id, false)
    }

    pub fn reactivate(&self, id: &str) -> Result<()> {
        self.core.set_active(id, true)
    }

    pub fn delete(&self, id: &str) -> Result<()> {
        self.core.delete(id)
    }

    pub fn set_tags(&self, id: &str, tags: &[String]) -> Result<()> {
        self.core.set_tags(id, tags)
    }

    pub fn get_tags(&self, id: &str) -> Result<Vec<String>> {
        self.core.get_tags(id)
    }
}

fn payload_of(input: &ToolInput) -> serde_json::Value {
    json!({
        "category": input.category,
        "description": input.description,
        "parameters": input.parameters,
        "constraints": input.constraints,
    })
}

fn from_parts(envelope: Envelope, input: &ToolInput) -> ToolCard {
    ToolCard {
        envelope,
        name: input.name.clone(),
        category: input.category.clone(),
        description: input.description.clone(),
        parameters: input.parameters.clone(),
        constraints: input.constraints.clone(),
    }
}

fn from_record(record: EntryRecord) -> ToolCard {
    let payload = record.payload;
    ToolCard {
        name: record.name,
        category: payload["category"].as_str().map(str::to_string),
        description: payload["description"]
            .as_str()
            .map(str::to_string)
            .unwrap_or_default(),
        parameters: match &payload["parameters"] {
            serde_json::Value::Null => None,
            other => Some(other.clone()),
        },
        constraints: payload["constraints"]
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default(),
        envelope: record.envelope,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo() -> ToolRepository {
        let adapter = StorageAdapter::in_memory().unwrap();
        ToolRepository::new(
            adapter,
            CursorCodec::new(Some("a-test-secret-at-least-32-bytes-long")),
        )
    }

    #[test]
    fn test_create_with_parameters() {
        let repo = repo();
        let input = ToolInput {
            name: "npm-build".to_string(),
            description: "Builds the frontend bundle".to_string(),
            category: Some("build".to_string()),
            parameters: Some(json!({"args": ["run", "build"]})),
            constraints: vec!["requires node 20".to_string()],
        };
        let tool = repo.create(&Scope::global(), &input).unwrap();

        let loaded = repo.get_by_id(&tool.envelope.id).unwrap().unwrap();
        assert_eq!(loaded.name, "npm-build");
        assert_eq!(loaded.parameters.unwrap()["args"][0], "run");
        assert_eq!(loaded.constraints, vec!["requires node 20"]);
    }

    #[test]
    fn test_inherited_name_lookup() {
        let repo = repo();
        let input = ToolInput {
            name: "deploy".to_string(),
            description: "Deploys to staging".to_string(),
            ..Default::default()
        };
        repo.create(&Scope::global(), &input).unwrap();

        let found = repo
            .get_by_name("deploy", ScopeType::Project, Some("p1"), true)
            .unwrap();
        assert!(found.is_some());

        let exact = repo
            .get_by_name("deploy", ScopeType::Project, Some("p1"), false)
            .unwrap();
        assert!(exact.is_none());
    }

    #[test]
    fn test_missing_description_rejected() {
        let repo = repo();
        let input = ToolInput {
            name: "x".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            repo.create(&Scope::global(), &input),
            Err(Error::Validation { .. })
        ));
    }
}
