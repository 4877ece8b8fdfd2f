//! Guideline repository.

use crate::artifact::{EntryType, Envelope, Guideline, GuidelineInput, VersionRecord};
use crate::cursor::CursorCodec;
use crate::error::{Error, Result};
use crate::scope::{Scope, ScopeType};
use crate::storage::adapter::StorageAdapter;
use crate::storage::repository::{
    no_parent_scopes, AccessTracker, EntryCore, EntryFilter, EntryRecord, Page,
};
use serde_json::json;
use std::sync::Arc;

/// Versioned CRUD for guidelines.
pub struct GuidelineRepository {
    core: EntryCore,
}

impl GuidelineRepository {
    pub fn new(adapter: Arc<StorageAdapter>, cursors: CursorCodec) -> Self {
        Self {
            core: EntryCore::new(adapter, EntryType::Guideline, cursors),
        }
    }

    pub fn with_tracker(mut self, tracker: AccessTracker) -> Self {
        self.core = self.core.with_tracker(tracker);
        self
    }

    pub fn create(&self, scope: &Scope, input: &GuidelineInput) -> Result<Guideline> {
        if input.name.trim().is_empty() {
            return Err(Error::validation("name", "guideline name is required"));
        }
        if input.content.trim().is_empty() {
            return Err(Error::validation("content", "guideline content is required"));
        }

        let payload = payload_of(input);
        let envelope = self
            .core
            .create(scope, &input.name, &input.content, &payload)?;
        Ok(from_parts(envelope, input))
    }

    /// Append a new version with the given input and swap the head.
    pub fn update(&self, id: &str, input: &GuidelineInput) -> Result<Guideline> {
        let payload = payload_of(input);
        let envelope = self.core.update(id, &input.name, &input.content, &payload)?;
        Ok(from_parts(envelope, input))
    }

    pub fn get_by_id(&self, id: &str) -> Result<Option<Guideline>> {
        Ok(self.core.get_by_id(id)?.map(from_record))
    }

    pub fn get_by_name(
        &self,
        name: &str,
        scope_type: ScopeType,
        scope_id: Option<&str>,
        inherit: bool,
    ) -> Result<Option<Guideline>> {
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
    ) -> Result<Page<Guideline>> {
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

fn payload_of(input: &GuidelineInput) -> serde_json::Value {
    json!({
        "priority": input.priority.unwrap_or(0),
        "category": input.category,
        "content": input.content,
        "rationale": input.rationale,
        "examples": input.examples,
    })
}

fn from_parts(envelope: Envelope, input: &GuidelineInput) -> Guideline {
    Guideline {
        envelope,
        name: input.name.clone(),
        priority: input.priority.unwrap_or(0),
        category: input.category.clone(),
        content: input.content.clone(),
        rationale: input.rationale.clone(),
        examples: input.examples.clone(),
    }
}

fn from_record(record: EntryRecord) -> Guideline {
    let payload = record.payload;
    Guideline {
        name: record.name,
        priority: payload["priority"].as_i64().unwrap_or(0),
        category: payload["category"].as_str().map(str::to_string),
        content: payload["content"]
            .as_str()
            .map(str::to_string)
            .unwrap_or_default(),
        rationale: payload["rationale"].as_str().map(str::to_string),
        examples: payload["examples"]
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

    fn repo() -> GuidelineRepository {
        let adapter = StorageAdapter::in_memory().unwrap();
        GuidelineRepository::new(
            adapter,
            CursorCodec::new(Some("a-test-secret-at-least-32-bytes-long")),
        )
    }

    fn input(name: &str, content: &str) -> GuidelineInput {
        GuidelineInput {
            name: name.to_string(),
            content: content.to_string(),
            priority: Some(5),
            category: Some("style".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_create_update_history() {
        let repo = repo();
        let scope = Scope::global();

        let g = repo
            .create(&scope, &input("strict-mode", "always use strict mode"))
            .unwrap();
        assert_eq!(g.envelope.version_num, 1);

        let mut edit = input("strict-mode", "always use strict mode, no exceptions");
        edit.rationale = Some("caught two prod bugs".to_string());
        let updated = repo.update(&g.envelope.id, &edit).unwrap();
        assert_eq!(updated.envelope.version_num, 2);

        let history = repo.get_history(&g.envelope.id).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].version_num, 2);
    }

    #[test]
    fn test_validation_rejects_blank() {
        let repo = repo();
        assert!(matches!(
            repo.create(&Scope::global(), &input("", "content")),
            Err(Error::Validation { .. })
        ));
        assert!(matches!(
            repo.create(&Scope::global(), &input("name", "  ")),
            Err(Error::Validation { .. })
        ));
    }

    #[test]
    fn test_category_filter() {
        let repo = repo();
        let scope = Scope::of(ScopeType::Project, "p1").unwrap();
        repo.create(&scope, &input("a", "alpha content")).unwrap();

        let mut other = input("b", "beta content");
        other.category = Some("testing".to_string());
        repo.create(&scope, &other).unwrap();

        let filter = EntryFilter {
            category: Some("testing".to_string()),
            ..Default::default()
        };
        let page = repo.list(&filter, 10, None).unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].name, "b");
    }

    #[test]
    fn test_round_trip_fields() {
        let repo = repo();
        let mut inp = input("g", "content text");
        inp.examples = vec!["example one".to_string(), "example two".to_string()];
        let g = repo.create(&Scope::global(), &inp).unwrap();

        let loaded = repo.get_by_id(&g.envelope.id).unwrap().unwrap();
        assert_eq!(loaded.priority, 5);
        assert_eq!(loaded.category.as_deref(), Some("style"));
        assert_eq!(loaded.examples.len(), 2);
        assert_eq!(loaded.content, "content text");
    }
}
