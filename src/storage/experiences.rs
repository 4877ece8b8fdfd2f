//! Experience repository with append-only trajectories.

use crate::artifact::{
    EntryType, Envelope, Experience, ExperienceInput, ExperienceLevel, TrajectoryStep,
    VersionRecord,
};
use crate::cursor::CursorCodec;
use crate::error::{Error, Result};
use crate::scope::{Scope, ScopeType};
use crate::storage::adapter::StorageAdapter;
use crate::storage::repository::{
    no_parent_scopes, parse_datetime, AccessTracker, EntryCore, EntryFilter, EntryRecord, Page,
};
use chrono::Utc;
use rusqlite::params;
use serde_json::json;
use std::sync::Arc;

/// Default confidence when the caller does not supply one.
pub const DEFAULT_CONFIDENCE: f64 = 0.6;

/// Versioned CRUD for experiences, plus trajectory operations.
pub struct ExperienceRepository {
    core: EntryCore,
}

impl ExperienceRepository {
    pub fn new(adapter: Arc<StorageAdapter>, cursors: CursorCodec) -> Self {
        Self {
            core: EntryCore::new(adapter, EntryType::Experience, cursors),
        }
    }

    pub fn with_tracker(mut self, tracker: AccessTracker) -> Self {
        self.core = self.core.with_tracker(tracker);
        self
    }

    pub fn create(&self, scope: &Scope, input: &ExperienceInput) -> Result<Experience> {
        if input.title.trim().is_empty() {
            return Err(Error::validation("title", "experience title is required"));
        }
        if input.content.trim().is_empty() {
            return Err(Error::validation(
                "content",
                "experience content is required",
            ));
        }

        let payload = payload_of(input);
        let envelope = self
            .core
            .create(scope, &input.title, &input.content, &payload)?;
        Ok(from_parts(envelope, input))
    }

    pub fn update(&self, id: &str, input: &ExperienceInput) -> Result<Experience> {
        let payload = payload_of(input);
        let envelope = self.core.update(id, &input.title, &input.content, &payload)?;
        Ok(from_parts(envelope, input))
    }

    /// Append one trajectory step. Steps are append-only; step numbers are
    /// assigned densely from 1.
    pub fn add_step(
        &self,
        id: &str,
        action: &str,
        observation: Option<&str>,
        reasoning: Option<&str>,
    ) -> Result<TrajectoryStep> {
        if self.core.get_by_id(id)?.is_none() {
            return Err(Error::not_found("experience", id));
        }

        self.core.adapter().transaction(|conn| {
            let next: i64 = conn
                .query_row(
                    "SELECT COALESCE(MAX(step_num), 0) + 1 FROM trajectory_steps WHERE entry_id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .map_err(|e| Error::Storage(e.to_string()))?;

            let now = Utc::now();
            conn.execute(
                "INSERT INTO trajectory_steps (entry_id, step_num, action, observation, reasoning, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![id, next, action, observation, reasoning, now.to_rfc3339()],
            )
            .map_err(|e| Error::Storage(e.to_string()))?;

            Ok(TrajectoryStep {
                step_num: next,
                action: action.to_string(),
                observation: observation.map(str::to_string),
                reasoning: reasoning.map(str::to_string),
                created_at: now,
            })
        })
    }

    /// The full trajectory in step order.
    pub fn get_trajectory(&self, id: &str) -> Result<Vec<TrajectoryStep>> {
        self.core.adapter().with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT step_num, action, observation, reasoning, created_at
                 FROM trajectory_steps WHERE entry_id = ?1 ORDER BY step_num",
            )?;
            let steps = stmt
                .query_map(params![id], |row| {
                    Ok(TrajectoryStep {
                        step_num: row.get(0)?,
                        action: row.get(1)?,
                        observation: row.get(2)?,
                        reasoning: row.get(3)?,
                        created_at: parse_datetime(row.get::<_, String>(4)?),
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(steps)
        })
    }

    /// Record (or revise) the outcome of an experience.
    pub fn record_outcome(&self, id: &str, outcome: &str) -> Result<Experience> {
        let record = self
            .core
            .get_by_id(id)?
            .ok_or_else(|| Error::not_found("experience", id))?;

        let mut payload = record.payload;
        payload["outcome"] = json!(outcome);
        let content = payload["content"].as_str().unwrap_or_default().to_string();
        let envelope = self.core.update(id, &record.name, &content, &payload)?;
        Ok(from_record(EntryRecord {
            envelope,
            name: record.name,
            payload,
        }))
    }

    pub fn get_by_id(&self, id: &str) -> Result<Option<Experience>> {
        Ok(self.core.get_by_id(id)?.map(from_record))
    }

    pub fn get_by_title(
        &self,
        title: &str,
        scope_type: ScopeType,
        scope_id: Option<&str>,
        inherit: bool,
    ) -> Result<Option<Experience>> {
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
    ) -> Result<Page<Experience>> {
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

fn payload_of(input: &ExperienceInput) -> serde_json::Value {
    json!({
        "level": input.level.to_string(),
        "category": input.category,
        "scenario": input.scenario,
        "outcome": input.outcome,
        "content": input.content,
        "confidence": input.confidence.unwrap_or(DEFAULT_CONFIDENCE),
    })
}

fn from_parts(envelope: Envelope, input: &ExperienceInput) -> Experience {
    Experience {
        envelope,
        title: input.title.clone(),
        level: input.level,
        category: input.category.clone(),
        scenario: input.scenario.clone(),
        outcome: input.outcome.clone(),
        content: input.content.clone(),
        confidence: input.confidence.unwrap_or(DEFAULT_CONFIDENCE),
    }
}

fn from_record(record: EntryRecord) -> Experience {
    let payload = record.payload;
    Experience {
        title: record.name,
        level: payload["level"]
            .as_str()
            .and_then(|s| s.parse().ok())
            .unwrap_or(ExperienceLevel::Case),
        category: payload["category"].as_str().map(str::to_string),
        scenario: payload["scenario"].as_str().map(str::to_string),
        outcome: payload["outcome"].as_str().map(str::to_string),
        content: payload["content"]
            .as_str()
            .map(str::to_string)
            .unwrap_or_default(),
        confidence: payload["confidence"].as_f64().unwrap_or(DEFAULT_CONFIDENCE),
        envelope: record.envelope,
    }
}
