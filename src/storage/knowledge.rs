//! Knowledge repository.
//!
//! Knowledge is never rewritten in place; superseding a fact creates a new
//! entry and points the old one's `invalidated_by` at it.

use crate::artifact::{EntryType, Envelope, Knowledge, KnowledgeInput, VersionRecord};
use crate::cursor::CursorCodec;
use crate::error::{Error, Result};
use crate::scope::{Scope, ScopeType};
use crate::storage::adapter::StorageAdapter;
use crate::storage::repository::{
    no_parent_scopes, parse_datetime, AccessTracker, EntryCore, EntryFilter, EntryRecord, Page,
};
use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::Arc;

/// Default confidence when the caller does not supply one.
pub const DEFAULT_CONFIDENCE: f64 = 0.7;

/// Versioned CRUD for knowledge entries.
pub struct KnowledgeRepository {
    core: EntryCore,
}

impl KnowledgeRepository {
    pub fn new(adapter: Arc<StorageAdapter>, cursors: CursorCodec) -> Self {
        Self {
            core: EntryCore::new(adapter, EntryType::Knowledge, cursors),
        }
    }

    pub fn with_tracker(mut self, tracker: AccessTracker) -> Self {
        self.core = self.core.with_tracker(tracker);
        self
    }

    pub fn create(&self, scope: &Scope, input: &KnowledgeInput) -> Result<Knowledge> {
        if input.title.trim().is_empty() {
            return Err(Error::validation("title", "knowledge title is required"));
        }
        if input.content.trim().is_empty() {
            return Err(Error::validation(
                "content",
                "knowledge content is required",
            ));
        }
        if let (Some(from), Some(until)) = (input.valid_from, input.valid_until) {
            if until < from {
                return Err(Error::validation(
                    "valid_until",
                    "valid_until precedes valid_from",
                ));
            }
        }

        let payload = payload_of(input, None);
        let envelope = self
            .core
            .create(scope, &input.title, &input.content, &payload)?;
        Ok(from_parts(envelope, input))
    }

    pub fn update(&self, id: &str, input: &KnowledgeInput) -> Result<Knowledge> {
        // Preserve any invalidation marker across payload rewrites
        let invalidated_by = self
            .core
            .get_by_id(id)?
            .and_then(|r| r.payload["invalidated_by"].as_str().map(str::to_string));
        let payload = payload_of(input, invalidated_by.as_deref());
        let envelope = self.core.update(id, &input.title, &input.content, &payload)?;
        let mut knowledge = from_parts(envelope, input);
        knowledge.invalidated_by = invalidated_by;
        Ok(knowledge)
    }

    /// Mark `id` as superseded by `newer_id` and deactivate it.
    pub fn invalidate(&self, id: &str, newer_id: &str) -> Result<()> {
        let record = self
            .core
            .get_by_id(id)?
            .ok_or_else(|| Error::not_found("knowledge", id))?;

        let mut payload = record.payload;
        payload["invalidated_by"] = json!(newer_id);
        let content = payload["content"].as_str().unwrap_or_default().to_string();
        self.core.update(id, &record.name, &content, &payload)?;
        self.core.set_active(id, false)
    }

    pub fn get_by_id(&self, id: &str) -> Result<Option<Knowledge>> {
        Ok(self.core.get_by_id(id)?.map(from_record))
    }

    pub fn get_by_title(
        &self,
        title: &str,
        scope_type: ScopeType,
        scope_id: Option<&str>,
        inherit: bool,
    ) -> Result<Option<Knowledge>> {
        Ok(self
            .core
            .get_by_name(title, scope_type, scope_id, inherit, &no_parent_scopes)?
            .map(from_record))
    }

    pub fn list(
        &self,
        filter: &EntryFilter,
        limit: u64,
        cursor: Option<&str>,
    ) -> Result<Page<Knowledge>> {
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

fn payload_of(input: &KnowledgeInput, invalidated_by: Option<&str>) -> serde_json::Value {
    json!({
        "category": input.category,
        "content": input.content,
        "source": input.source,
        "confidence": input.confidence.unwrap_or(DEFAULT_CONFIDENCE),
        "valid_from": input.valid_from.map(|dt| dt.to_rfc3339()),
        "valid_until": input.valid_until.map(|dt| dt.to_rfc3339()),
        "invalidated_by": invalidated_by,
    })
}

fn from_parts(envelope: Envelope, input: &KnowledgeInput) -> Knowledge {
    Knowledge {
        envelope,
        title: input.title.clone(),
        category: input.category.clone(),
        content: input.content.clone(),
        source: input.source.clone(),
        confidence: input.confidence.unwrap_or(DEFAULT_CONFIDENCE),
        valid_from: input.valid_from,
        valid_until: input.valid_until,
        invalidated_by: None,
    }
}

fn from_record(record: EntryRecord) -> Knowledge {
    let payload = record.payload;
    let parse_opt = |v: &serde_json::Value| -> Option<DateTime<Utc>> {
        v.as_str().map(|s| parse_datetime(s.to_string()))
    };
    Knowledge {
        title: record.name,
        category: payload["category"].as_str().map(str::to_string),
        content: payload["content"]
            .as_str()
            .map(str::to_string)
            .unwrap_or_default(),
        source: payload["source"].as_str().map(str::to_string),
        confidence: payload["confidence"].as_f64().unwrap_or(DEFAULT_CONFIDENCE),
        valid_from: parse_opt(&payload["valid_from"]),
        valid_until: parse_opt(&payload["valid_until"]),
        invalidated_by: payload["invalidated_by"].as_str().map(str::to_string),
        envelope: record.envelope,
    }
}
