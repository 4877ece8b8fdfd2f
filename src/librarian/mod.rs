//! The librarian: batch analysis and recommendation workflow.
//!
//! Given a scope, the librarian scans recent experiences, clusters them,
//! and produces typed recommendations. Recommendations wait in `pending`
//! until a user approves, rejects, or skips them; approving a promotion
//! materializes a strategy-level experience distilled from the cluster.

mod jobs;
mod recommend;

pub use jobs::{AnalysisJob, JobRegistry, JobState, StepStatus, TaskStep};
pub use recommend::{
    cluster_experiences, derive_recommendations, Cluster, Recommendation, RecommendConfig,
    RecommendationKind, RecommendationState,
};

use crate::artifact::{ExperienceInput, ExperienceLevel};
use crate::error::{Error, Result};
use crate::scope::Scope;
use crate::storage::{EntryFilter, ExperienceRepository};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::mpsc;

/// How many recent experiences one analysis scans.
const SCAN_LIMIT: u64 = 100;

/// The librarian service.
pub struct Librarian {
    experiences: Arc<ExperienceRepository>,
    config: RecommendConfig,
    jobs: JobRegistry,
    recommendations: Mutex<HashMap<String, Recommendation>>,
    stopped: AtomicBool,
}

impl Librarian {
    pub fn new(experiences: Arc<ExperienceRepository>) -> Self {
        Self {
            experiences,
            config: RecommendConfig::default(),
            jobs: JobRegistry::new(),
            recommendations: Mutex::new(HashMap::new()),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn with_config(mut self, config: RecommendConfig) -> Self {
        self.config = config;
        self
    }

    /// The job ledger (status queries).
    pub fn jobs(&self) -> &JobRegistry {
        &self.jobs
    }

    /// Run one analysis for a scope. Returns the job id.
    pub fn analyze(&self, scope: &Scope) -> Result<String> {
        let job_id = self
            .jobs
            .create(scope.clone(), &["scan", "cluster", "recommend"]);
        self.jobs.set_state(&job_id, JobState::Running);

        match self.run_steps(&job_id, scope) {
            Ok(count) => {
                self.jobs.set_state(&job_id, JobState::Completed);
                tracing::info!(scope = %scope, recommendations = count, "analysis completed");
            }
            Err(err) => {
                self.jobs.set_state(&job_id, JobState::Failed);
                tracing::error!(scope = %scope, error = %err, "analysis failed");
            }
        }
        Ok(job_id)
    }

    fn run_steps(&self, job_id: &str, scope: &Scope) -> Result<usize> {
        // Scan
        let started = Instant::now();
        self.jobs.start_step(job_id, "scan");
        let filter = EntryFilter {
            scope_type: Some(scope.scope_type),
            scope_id: scope.scope_id.clone(),
            ..Default::default()
        };
        let page = match self.experiences.list(&filter, SCAN_LIMIT, None) {
            Ok(page) => page,
            Err(err) => {
                self.jobs.fail_step(
                    job_id,
                    "scan",
                    err.to_string(),
                    started.elapsed().as_millis() as u64,
                );
                return Err(err);
            }
        };
        self.jobs.complete_step(
            job_id,
            "scan",
            format!("{} experiences", page.items.len()),
            started.elapsed().as_millis() as u64,
        );

        // Cluster
        let started = Instant::now();
        self.jobs.start_step(job_id, "cluster");
        let clusters = cluster_experiences(page.items);
        self.jobs.complete_step(
            job_id,
            "cluster",
            format!("{} clusters", clusters.len()),
            started.elapsed().as_millis() as u64,
        );

        // Recommend
        let started = Instant::now();
        self.jobs.start_step(job_id, "recommend");
        let recommendations = derive_recommendations(scope, &clusters, &self.config);
        let count = recommendations.len();
        {
            let mut stored = self
                .recommendations
                .lock()
                .expect("recommendations poisoned");
            for recommendation in recommendations {
                stored.insert(recommendation.id.clone(), recommendation);
            }
        }
        self.jobs.complete_step(
            job_id,
            "recommend",
            format!("{} recommendations", count),
            started.elapsed().as_millis() as u64,
        );

        Ok(count)
    }

    /// Pending-first listing for a scope.
    pub fn list_recommendations(&self, scope: Option<&Scope>) -> Vec<Recommendation> {
        let stored = self
            .recommendations
            .lock()
            .expect("recommendations poisoned");
        let mut out: Vec<Recommendation> = stored
            .values()
            .filter(|r| scope.map(|s| r.scope == *s).unwrap_or(true))
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            let rank = |s: RecommendationState| match s {
                RecommendationState::Pending => 0,
                _ => 1,
            };
            rank(a.state)
                .cmp(&rank(b.state))
                .then(b.created_at.cmp(&a.created_at))
        });
        out
    }

    pub fn show_recommendation(&self, id: &str) -> Result<Recommendation> {
        self.recommendations
            .lock()
            .expect("recommendations poisoned")
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found("recommendation", id))
    }

    /// Approve: materialize the recommendation, then mark it approved.
    /// For promotions this creates a strategy-level experience.
    pub fn approve(&self, id: &str) -> Result<Option<String>> {
        let recommendation = self.transition(id, RecommendationState::Approved)?;

        match recommendation.kind {
            RecommendationKind::Promotion => {
                let strategy = self.experiences.create(
                    &recommendation.scope,
                    &ExperienceInput {
                        title: recommendation.title.clone(),
                        level: ExperienceLevel::Strategy,
                        category: Some("promoted".to_string()),
                        scenario: None,
                        outcome: None,
                        content: recommendation.description.clone(),
                        confidence: Some(recommendation.confidence),
                    },
                )?;
                Ok(Some(strategy.envelope.id))
            }
            RecommendationKind::Consolidation => {
                // Keep the first, deactivate the rest
                for stale in recommendation.experience_ids.iter().skip(1) {
                    if let Err(err) = self.experiences.deactivate(stale) {
                        tracing::warn!(id = %stale, error = %err, "consolidation deactivate failed");
                    }
                }
                Ok(None)
            }
            RecommendationKind::Deprecation => {
                for stale in &recommendation.experience_ids {
                    if let Err(err) = self.experiences.deactivate(stale) {
                        tracing::warn!(id = %stale, error = %err, "deprecation deactivate failed");
                    }
                }
                Ok(None)
            }
        }
    }

    pub fn reject(&self, id: &str) -> Result<()> {
        self.transition(id, RecommendationState::Rejected).map(|_| ())
    }

    pub fn skip(&self, id: &str) -> Result<()> {
        self.transition(id, RecommendationState::Skipped).map(|_| ())
    }

    fn transition(&self, id: &str, to: RecommendationState) -> Result<Recommendation> {
        let mut stored = self
            .recommendations
            .lock()
            .expect("recommendations poisoned");
        let recommendation = stored
            .get_mut(id)
            .ok_or_else(|| Error::not_found("recommendation", id))?;
        if recommendation.state != RecommendationState::Pending {
            return Err(Error::validation(
                "state",
                format!("recommendation already {:?}", recommendation.state),
            ));
        }
        recommendation.state = to;
        Ok(recommendation.clone())
    }

    /// Consume analysis triggers from the learning service until stopped.
    pub async fn listen(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<Scope>) {
        while let Some(scope) = rx.recv().await {
            if self.stopped.load(Ordering::SeqCst) {
                break;
            }
            if let Err(err) = self.analyze(&scope) {
                tracing::error!(scope = %scope, error = %err, "triggered analysis failed");
            }
        }
    }

    /// Cooperatively stop the listener.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::ExperienceInput;
    use crate::cursor::CursorCodec;
    use crate::scope::ScopeType;
    use crate::storage::StorageAdapter;

    fn librarian() -> (Arc<Librarian>, Arc<ExperienceRepository>, Scope) {
        let adapter = StorageAdapter::in_memory().unwrap();
        let experiences = Arc::new(ExperienceRepository::new(
            adapter,
            CursorCodec::new(Some("a-test-secret-at-least-32-bytes-long")),
        ));
        let librarian = Arc::new(Librarian::new(Arc::clone(&experiences)));
        let scope = Scope::of(ScopeType::Project, "p1").unwrap();
        (librarian, experiences, scope)
    }

    fn seed_cases(experiences: &ExperienceRepository, scope: &Scope, count: usize) {
        for i in 0..count {
            experiences
                .create(
                    scope,
                    &ExperienceInput {
                        title: format!("Bash failure {}", i),
                        level: ExperienceLevel::Case,
                        category: Some("tool-failure".to_string()),
                        content: "cargo test exited 101".to_string(),
                        ..Default::default()
                    },
                )
                .unwrap();
        }
    }

    #[test]
    fn test_analysis_produces_promotion() {
        let (librarian, experiences, scope) = librarian();
        seed_cases(&experiences, &scope, 4);

        let job_id = librarian.analyze(&scope).unwrap();
        let job = librarian.jobs().get(&job_id).unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.progress(), (3, 3));

        let recommendations = librarian.list_recommendations(Some(&scope));
        let promotion = recommendations
            .iter()
            .find(|r| r.kind == RecommendationKind::Promotion)
            .expect("promotion for 4 similar cases");
        assert_eq!(promotion.pattern_count, 4);
        assert_eq!(promotion.state, RecommendationState::Pending);
    }

    #[test]
    fn test_approval_materializes_strategy() {
        let (librarian, experiences, scope) = librarian();
        seed_cases(&experiences, &scope, 3);
        librarian.analyze(&scope).unwrap();

        let promotion_id = librarian
            .list_recommendations(Some(&scope))
            .into_iter()
            .find(|r| r.kind == RecommendationKind::Promotion)
            .unwrap()
            .id;

        let strategy_id = librarian.approve(&promotion_id).unwrap().unwrap();
        let strategy = experiences.get_by_id(&strategy_id).unwrap().unwrap();
        assert_eq!(strategy.level, ExperienceLevel::Strategy);

        // Already-approved recommendations refuse further transitions
        assert!(librarian.reject(&promotion_id).is_err());
        assert_eq!(
            librarian.show_recommendation(&promotion_id).unwrap().state,
            RecommendationState::Approved
        );
    }

    #[test]
    fn test_reject_and_skip() {
        let (librarian, experiences, scope) = librarian();
        seed_cases(&experiences, &scope, 3);
        librarian.analyze(&scope).unwrap();

        let ids: Vec<String> = librarian
            .list_recommendations(Some(&scope))
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert!(!ids.is_empty());

        librarian.reject(&ids[0]).unwrap();
        assert_eq!(
            librarian.show_recommendation(&ids[0]).unwrap().state,
            RecommendationState::Rejected
        );
    }

    #[tokio::test]
    async fn test_listener_runs_triggered_analysis() {
        let (librarian, experiences, scope) = librarian();
        seed_cases(&experiences, &scope, 3);

        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(Arc::clone(&librarian).listen(rx));

        tx.send(scope.clone()).unwrap();
        drop(tx);
        handle.await.unwrap();

        assert!(!librarian.list_recommendations(Some(&scope)).is_empty());
    }
}
