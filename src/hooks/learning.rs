//! Hook-driven learning: failure streams become durable experiences,
//! significant output becomes knowledge.
//!
//! Per-session counters decide when a pattern is worth keeping; dedup sets
//! guarantee one artifact per `(session, pattern)`. Created experiences
//! feed an analysis counter that triggers the librarian once it crosses
//! the configured threshold.

use crate::artifact::{ExperienceInput, ExperienceLevel, KnowledgeInput};
use crate::config::LearningConfig;
use crate::error::Result;
use crate::hooks::events::{
    ErrorNotificationEvent, HookEvent, SubagentCompletionEvent, ToolFailureEvent, ToolSuccessEvent,
};
use crate::hooks::extraction::extract_knowledge;
use crate::scope::{Scope, ScopeType};
use crate::storage::{ExperienceRepository, KnowledgeRepository};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

#[derive(Default)]
struct LearningState {
    /// (session, tool, error_type) -> consecutive failure count
    failure_counts: HashMap<(String, String, String), u32>,
    /// Patterns that already produced an experience this session
    failure_dedup: HashSet<(String, String, String)>,
    /// (session, error_type) -> timestamps inside the window
    error_windows: HashMap<(String, String), Vec<DateTime<Utc>>>,
    error_dedup: HashSet<(String, String)>,
    /// (session, content hash) of extracted knowledge
    knowledge_dedup: HashSet<(String, String)>,
    /// Experiences created per scope since the last analysis trigger
    analysis_counters: HashMap<String, u32>,
}

/// The learning service.
pub struct LearningService {
    experiences: Arc<ExperienceRepository>,
    knowledge: Arc<KnowledgeRepository>,
    config: LearningConfig,
    state: Mutex<LearningState>,
    /// Scopes whose experience volume crossed the analysis threshold
    analysis_tx: Option<mpsc::UnboundedSender<Scope>>,
}

impl LearningService {
    pub fn new(
        experiences: Arc<ExperienceRepository>,
        knowledge: Arc<KnowledgeRepository>,
        config: LearningConfig,
    ) -> Self {
        Self {
            experiences,
            knowledge,
            config,
            state: Mutex::new(LearningState::default()),
            analysis_tx: None,
        }
    }

    /// Wire the librarian trigger channel.
    pub fn with_analysis_channel(mut self, tx: mpsc::UnboundedSender<Scope>) -> Self {
        self.analysis_tx = Some(tx);
        self
    }

    /// Dispatch any hook event.
    pub fn handle(&self, event: &HookEvent) -> Result<Vec<String>> {
        match event {
            HookEvent::ToolFailure(e) => Ok(self.on_tool_failure(e)?.into_iter().collect()),
            HookEvent::SubagentCompletion(e) => {
                Ok(self.on_subagent_completion(e)?.into_iter().collect())
            }
            HookEvent::ErrorNotification(e) => {
                Ok(self.on_error_notification(e)?.into_iter().collect())
            }
            HookEvent::ToolSuccess(e) => self.on_tool_success(e),
        }
    }

    /// Count a tool failure; at the threshold, persist one `tool-failure`
    /// case experience for this `(tool, error_type)` pattern per session.
    pub fn on_tool_failure(&self, event: &ToolFailureEvent) -> Result<Option<String>> {
        if !self.config.enabled {
            return Ok(None);
        }

        let key = (
            event.session_id.clone(),
            event.tool_name.clone(),
            event.error_type.clone(),
        );

        let should_create = {
            let mut state = self.state.lock().expect("learning state poisoned");
            let count = state.failure_counts.entry(key.clone()).or_insert(0);
            *count += 1;
            *count >= self.config.min_failures_for_experience
                && !state.failure_dedup.contains(&key)
        };
        if !should_create {
            return Ok(None);
        }

        let scope = self.scope_for(&event.project_id, &event.session_id)?;
        let experience = self.experiences.create(
            &scope,
            &ExperienceInput {
                title: format!("{} failing with {}", event.tool_name, event.error_type),
                level: ExperienceLevel::Case,
                category: Some("tool-failure".to_string()),
                scenario: Some(format!(
                    "Repeated {} failures in one session",
                    event.tool_name
                )),
                outcome: None,
                content: format!(
                    "{} failed {} times with {}: {}",
                    event.tool_name,
                    self.config.min_failures_for_experience,
                    event.error_type,
                    event.error_message
                ),
                confidence: Some(self.config.default_confidence),
            },
        )?;
        self.experiences.add_step(
            &experience.envelope.id,
            &format!("invoked {}", event.tool_name),
            Some(event.error_message.clone()).as_deref(),
            None,
        )?;

        {
            let mut state = self.state.lock().expect("learning state poisoned");
            state.failure_dedup.insert(key);
        }
        self.bump_analysis(&scope);
        tracing::info!(
            tool = %event.tool_name,
            error_type = %event.error_type,
            experience_id = %experience.envelope.id,
            "tool-failure experience created"
        );
        Ok(Some(experience.envelope.id))
    }

    /// Record subagent completions: failures always, successes only when
    /// the summary is significant.
    pub fn on_subagent_completion(
        &self,
        event: &SubagentCompletionEvent,
    ) -> Result<Option<String>> {
        if !self.config.enabled {
            return Ok(None);
        }

        let (category, title) = if event.success {
            if event.result_summary.len() < self.config.min_summary_length_for_success {
                return Ok(None);
            }
            (
                "subagent-success",
                format!("{} subagent completed", event.subagent_type),
            )
        } else {
            (
                "subagent-failure",
                format!("{} subagent failed", event.subagent_type),
            )
        };

        let scope = self.scope_for(&event.project_id, &event.session_id)?;
        let experience = self.experiences.create(
            &scope,
            &ExperienceInput {
                title,
                level: ExperienceLevel::Case,
                category: Some(category.to_string()),
                scenario: Some(format!(
                    "subagent run of {} ({} bytes, {} ms)",
                    event.subagent_type, event.result_size, event.duration_ms
                )),
                outcome: Some(if event.success { "success" } else { "failure" }.to_string()),
                content: event.result_summary.clone(),
                confidence: Some(self.config.default_confidence),
            },
        )?;
        self.bump_analysis(&scope);
        Ok(Some(experience.envelope.id))
    }

    /// Window-count error notifications; a storm inside the window becomes
    /// one `error-pattern` experience per `(session, error_type)`.
    pub fn on_error_notification(&self, event: &ErrorNotificationEvent) -> Result<Option<String>> {
        if !self.config.enabled {
            return Ok(None);
        }

        let key = (event.session_id.clone(), event.error_type.clone());
        let window = chrono::Duration::milliseconds(self.config.error_pattern_window_ms as i64);

        let should_create = {
            let mut state = self.state.lock().expect("learning state poisoned");
            let timestamps = state.error_windows.entry(key.clone()).or_default();
            timestamps.push(event.timestamp);
            let cutoff = event.timestamp - window;
            timestamps.retain(|t| *t >= cutoff);
            timestamps.len() as u32 >= self.config.error_pattern_threshold
                && !state.error_dedup.contains(&key)
        };
        if !should_create {
            return Ok(None);
        }

        let scope = self.scope_for(&event.project_id, &event.session_id)?;
        let experience = self.experiences.create(
            &scope,
            &ExperienceInput {
                title: format!("Recurring {} errors", event.error_type),
                level: ExperienceLevel::Case,
                category: Some("error-pattern".to_string()),
                scenario: Some(format!(
                    "{} occurrences within {} ms",
                    self.config.error_pattern_threshold, self.config.error_pattern_window_ms
                )),
                outcome: None,
                content: event.message.clone(),
                confidence: Some(self.config.default_confidence),
            },
        )?;

        {
            let mut state = self.state.lock().expect("learning state poisoned");
            state.error_dedup.insert(key);
        }
        self.bump_analysis(&scope);
        Ok(Some(experience.envelope.id))
    }

    /// Mine successful tool output for knowledge, deduplicated per session
    /// by content hash.
    pub fn on_tool_success(&self, event: &ToolSuccessEvent) -> Result<Vec<String>> {
        if !self.config.enabled || !self.config.enable_knowledge_extraction {
            return Ok(Vec::new());
        }
        if !self
            .config
            .knowledge_extraction_tools
            .iter()
            .any(|t| t == &event.tool_name)
        {
            return Ok(Vec::new());
        }
        if event.tool_output.len() < self.config.min_output_length_for_knowledge {
            return Ok(Vec::new());
        }

        let scope = self.scope_for(&event.project_id, &event.session_id)?;
        let mut created = Vec::new();

        for candidate in extract_knowledge(&event.tool_name, &event.tool_output) {
            if candidate.confidence < self.config.knowledge_confidence_threshold {
                continue;
            }

            let hash = content_hash(&candidate.content);
            {
                let mut state = self.state.lock().expect("learning state poisoned");
                if !state
                    .knowledge_dedup
                    .insert((event.session_id.clone(), hash))
                {
                    continue;
                }
            }

            let knowledge = self.knowledge.create(
                &scope,
                &KnowledgeInput {
                    title: candidate.title,
                    category: Some("extracted".to_string()),
                    content: candidate.content,
                    source: Some(format!("tool:{}", event.tool_name)),
                    confidence: Some(candidate.confidence),
                    valid_from: None,
                    valid_until: None,
                },
            )?;
            created.push(knowledge.envelope.id);
        }

        Ok(created)
    }

    /// Forget every per-session counter and dedup set.
    pub fn cleanup_session(&self, session_id: &str) {
        let mut state = self.state.lock().expect("learning state poisoned");
        state
            .failure_counts
            .retain(|(session, _, _), _| session != session_id);
        state
            .failure_dedup
            .retain(|(session, _, _)| session != session_id);
        state
            .error_windows
            .retain(|(session, _), _| session != session_id);
        state.error_dedup.retain(|(session, _)| session != session_id);
        state
            .knowledge_dedup
            .retain(|(session, _)| session != session_id);
    }

    fn scope_for(&self, project_id: &Option<String>, session_id: &str) -> Result<Scope> {
        match project_id {
            Some(project_id) => Scope::of(ScopeType::Project, project_id.clone()),
            None => Scope::of(ScopeType::Session, session_id),
        }
    }

    fn bump_analysis(&self, scope: &Scope) {
        let triggered = {
            let mut state = self.state.lock().expect("learning state poisoned");
            let counter = state
                .analysis_counters
                .entry(scope.to_string())
                .or_insert(0);
            *counter += 1;
            if *counter >= self.config.analysis_threshold {
                *counter = 0;
                true
            } else {
                false
            }
        };

        if triggered {
            if let Some(tx) = &self.analysis_tx {
                tracing::info!(scope = %scope, "analysis threshold reached; notifying librarian");
                let _ = tx.send(scope.clone());
            }
        }
    }
}

fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}
