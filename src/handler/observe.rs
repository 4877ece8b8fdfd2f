//! Observation commit: classified observations become artifacts.
//!
//! High-confidence observations land at project scope; low-confidence ones
//! stay at session scope and are flagged for review. Duplicates at the
//! target scope are skipped, and the session's metadata records the commit.

use crate::artifact::{EntryType, GuidelineInput, KnowledgeInput, ToolInput};
use crate::config::ClassificationConfig;
use crate::duplicate::DuplicateService;
use crate::error::{Error, Result};
use crate::scope::{Scope, ScopeType};
use crate::storage::{
    GuidelineRepository, KnowledgeRepository, ScopeRepository, ToolRepository,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

/// One classified observation awaiting persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Observation {
    pub entry_type: EntryType,
    /// Name (guideline/tool) or title (knowledge)
    pub name: String,
    pub content: String,
    pub confidence: f64,
    pub category: Option<String>,
}

/// Outcome of one commit batch.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CommitOutcome {
    #[serde(rename = "storedCount")]
    pub stored_count: usize,
    #[serde(rename = "storedToProject")]
    pub stored_to_project: usize,
    #[serde(rename = "storedToSession")]
    pub stored_to_session: usize,
    #[serde(rename = "needsReviewCount")]
    pub needs_review_count: usize,
    #[serde(rename = "skippedDuplicates")]
    pub skipped_duplicates: usize,
}

/// The observe-commit service.
pub struct ObserveService {
    guidelines: Arc<GuidelineRepository>,
    tools: Arc<ToolRepository>,
    knowledge: Arc<KnowledgeRepository>,
    duplicates: Arc<DuplicateService>,
    scopes: Arc<ScopeRepository>,
    config: ClassificationConfig,
}

impl ObserveService {
    pub fn new(
        guidelines: Arc<GuidelineRepository>,
        tools: Arc<ToolRepository>,
        knowledge: Arc<KnowledgeRepository>,
        duplicates: Arc<DuplicateService>,
        scopes: Arc<ScopeRepository>,
        config: ClassificationConfig,
    ) -> Self {
        Self {
            guidelines,
            tools,
            knowledge,
            duplicates,
            scopes,
            config,
        }
    }

    /// Commit a batch of observations for a session.
    pub fn commit(
        &self,
        session_id: &str,
        project_id: Option<&str>,
        observations: &[Observation],
    ) -> Result<CommitOutcome> {
        let mut outcome = CommitOutcome::default();

        for observation in observations {
            // High confidence graduates to project scope when one exists
            let to_project = project_id.is_some()
                && observation.confidence >= self.config.high_confidence_threshold;
            let scope = if to_project {
                Scope::of(ScopeType::Project, project_id.expect("checked above"))?
            } else {
                Scope::of(ScopeType::Session, session_id)?
            };

            let check = self.duplicates.check(
                observation.entry_type,
                &observation.name,
                scope.scope_type,
                scope.scope_id.as_deref(),
            )?;
            if check.is_duplicate {
                outcome.skipped_duplicates += 1;
                tracing::debug!(name = %observation.name, scope = %scope, "duplicate observation skipped");
                continue;
            }

            self.store(observation, &scope)?;
            outcome.stored_count += 1;
            if to_project {
                outcome.stored_to_project += 1;
            } else {
                outcome.stored_to_session += 1;
                if observation.confidence < self.config.high_confidence_threshold {
                    outcome.needs_review_count += 1;
                }
            }
        }

        self.scopes.merge_session_metadata(
            session_id,
            &json!({
                "observe": {
                    "committedAt": Utc::now().to_rfc3339(),
                    "needsReviewCount": outcome.needs_review_count,
                    "reviewedAt": null,
                }
            }),
        )?;

        Ok(outcome)
    }

    fn store(&self, observation: &Observation, scope: &Scope) -> Result<()> {
        match observation.entry_type {
            EntryType::Guideline => {
                self.guidelines.create(
                    scope,
                    &GuidelineInput {
                        name: observation.name.clone(),
                        content: observation.content.clone(),
                        category: observation.category.clone(),
                        ..Default::default()
                    },
                )?;
            }
            EntryType::Tool => {
                self.tools.create(
                    scope,
                    &ToolInput {
                        name: observation.name.clone(),
                        description: observation.content.clone(),
                        category: observation.category.clone(),
                        ..Default::default()
                    },
                )?;
            }
            EntryType::Knowledge => {
                self.knowledge.create(
                    scope,
                    &KnowledgeInput {
                        title: observation.name.clone(),
                        content: observation.content.clone(),
                        category: observation.category.clone(),
                        confidence: Some(observation.confidence),
                        ..Default::default()
                    },
                )?;
            }
            EntryType::Experience => {
                return Err(Error::validation(
                    "entry_type",
                    "observations cannot be experiences",
                ));
            }
        }
        Ok(())
    }
}
