//! Analysis job ledger: states, task steps, and mid-run progress.

use crate::scope::Scope;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Lifecycle of an analysis job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Running,
    Completed,
    Failed,
}

/// Lifecycle of one task step inside a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// One ordered step of a job.
#[derive(Debug, Clone, Serialize)]
pub struct TaskStep {
    pub name: String,
    pub status: StepStatus,
    pub result: Option<String>,
    pub duration_ms: Option<u64>,
    pub error: Option<String>,
}

/// An analysis job over one scope.
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisJob {
    pub id: String,
    pub scope: Scope,
    pub state: JobState,
    pub steps: Vec<TaskStep>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl AnalysisJob {
    /// The step currently running, if any.
    pub fn current_task(&self) -> Option<&TaskStep> {
        self.steps.iter().find(|s| s.status == StepStatus::Running)
    }

    /// Completed steps over total steps.
    pub fn progress(&self) -> (usize, usize) {
        let done = self
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .count();
        (done, self.steps.len())
    }
}

/// In-process job registry, readable mid-run.
#[derive(Clone, Default)]
pub struct JobRegistry {
    jobs: Arc<Mutex<HashMap<String, AnalysisJob>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pending job with its planned steps.
    pub fn create(&self, scope: Scope, step_names: &[&str]) -> String {
        let job = AnalysisJob {
            id: Uuid::new_v4().to_string(),
            scope,
            state: JobState::Pending,
            steps: step_names
                .iter()
                .map(|name| TaskStep {
                    name: name.to_string(),
                    status: StepStatus::Pending,
                    result: None,
                    duration_ms: None,
                    error: None,
                })
                .collect(),
            created_at: Utc::now(),
            finished_at: None,
        };
        let id = job.id.clone();
        self.jobs
            .lock()
            .expect("job registry poisoned")
            .insert(id.clone(), job);
        id
    }

    pub fn get(&self, id: &str) -> Option<AnalysisJob> {
        self.jobs
            .lock()
            .expect("job registry poisoned")
            .get(id)
            .cloned()
    }

    /// All jobs, newest first.
    pub fn list(&self) -> Vec<AnalysisJob> {
        let jobs = self.jobs.lock().expect("job registry poisoned");
        let mut out: Vec<AnalysisJob> = jobs.values().cloned().collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        out
    }

    pub fn set_state(&self, id: &str, state: JobState) {
        let mut jobs = self.jobs.lock().expect("job registry poisoned");
        if let Some(job) = jobs.get_mut(id) {
            job.state = state;
            if matches!(state, JobState::Completed | JobState::Failed) {
                job.finished_at = Some(Utc::now());
            }
        }
    }

    pub fn start_step(&self, id: &str, step: &str) {
        self.update_step(id, step, |s| s.status = StepStatus::Running);
    }

    pub fn complete_step(&self, id: &str, step: &str, result: String, duration_ms: u64) {
        self.update_step(id, step, |s| {
            s.status = StepStatus::Completed;
            s.result = Some(result);
            s.duration_ms = Some(duration_ms);
        });
    }

    pub fn fail_step(&self, id: &str, step: &str, error: String, duration_ms: u64) {
        self.update_step(id, step, |s| {
            s.status = StepStatus::Failed;
            s.error = Some(error);
            s.duration_ms = Some(duration_ms);
        });
    }

    fn update_step(&self, id: &str, step: &str, f: impl FnOnce(&mut TaskStep)) {
        let mut jobs = self.jobs.lock().expect("job registry poisoned");
        if let Some(job) = jobs.get_mut(id) {
            if let Some(task) = job.steps.iter_mut().find(|s| s.name == step) {
                f(task);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::ScopeType;

    fn scope() -> Scope {
        Scope::of(ScopeType::Project, "p1").unwrap()
    }

    #[test]
    fn test_job_lifecycle() {
        let registry = JobRegistry::new();
        let id = registry.create(scope(), &["scan", "cluster", "recommend"]);

        let job = registry.get(&id).unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.progress(), (0, 3));

        registry.set_state(&id, JobState::Running);
        registry.start_step(&id, "scan");

        let job = registry.get(&id).unwrap();
        assert_eq!(job.current_task().unwrap().name, "scan");

        registry.complete_step(&id, "scan", "41 experiences".to_string(), 12);
        registry.complete_step(&id, "cluster", "5 clusters".to_string(), 3);
        registry.complete_step(&id, "recommend", "2 recommendations".to_string(), 1);
        registry.set_state(&id, JobState::Completed);

        let job = registry.get(&id).unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.progress(), (3, 3));
        assert!(job.finished_at.is_some());
        assert!(job.current_task().is_none());
    }

    #[test]
    fn test_failed_step_records_error() {
        let registry = JobRegistry::new();
        let id = registry.create(scope(), &["scan"]);
        registry.start_step(&id, "scan");
        registry.fail_step(&id, "scan", "storage offline".to_string(), 40);
        registry.set_state(&id, JobState::Failed);

        let job = registry.get(&id).unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.steps[0].error.as_deref(), Some("storage offline"));
    }

    #[test]
    fn test_list_newest_first() {
        let registry = JobRegistry::new();
        let a = registry.create(scope(), &["scan"]);
        let b = registry.create(scope(), &["scan"]);

        let listed = registry.list();
        assert_eq!(listed.len(), 2);
        assert!(listed.iter().any(|j| j.id == a));
        assert!(listed.iter().any(|j| j.id == b));
    }
}
