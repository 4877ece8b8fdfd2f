//! Context detection: working directory and environment to
//! `(project, session, agent)`.
//!
//! Agent identity resolves explicit parameter first, then the environment
//! capture, then the configured default. Project detection is a longest-
//! prefix path lookup; the active session follows the project. Results are
//! cached with a TTL; explicit parameters bypass the cache.

use crate::config::AutoContextConfig;
use crate::error::Result;
use crate::scope::ScopeType;
use crate::storage::ScopeRepository;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// A resolved execution context.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectedContext {
    pub agent_id: String,
    pub project_id: Option<String>,
    pub session_id: Option<String>,
}

/// Where a resolved project id came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopeSource {
    Explicit,
    Detected,
}

/// Result of `resolve_project_scope`.
#[derive(Debug, Clone, Serialize)]
pub struct ScopeResolution {
    pub project_id: Option<String>,
    pub source: ScopeSource,
    pub session_id: Option<String>,
    /// Non-fatal advisory, e.g. explicit project disagrees with the
    /// active session's project
    pub warning: Option<String>,
}

/// Detects and caches execution contexts.
pub struct ContextDetector {
    scopes: Arc<ScopeRepository>,
    config: AutoContextConfig,
    /// Agent id captured from the environment at boot
    env_agent_id: Option<String>,
    cache: Mutex<HashMap<String, (DetectedContext, Instant)>>,
}

impl ContextDetector {
    pub fn new(scopes: Arc<ScopeRepository>, config: AutoContextConfig) -> Self {
        Self {
            scopes,
            config,
            env_agent_id: None,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Supply the agent id captured from the environment at boot.
    pub fn with_env_agent(mut self, agent_id: Option<String>) -> Self {
        self.env_agent_id = agent_id;
        self
    }

    fn resolve_agent(&self, explicit: Option<&str>) -> String {
        explicit
            .map(str::to_string)
            .or_else(|| self.env_agent_id.clone())
            .unwrap_or_else(|| self.config.default_agent_id.clone())
    }

    /// Detect the context for a working directory.
    pub fn detect(&self, cwd: &str, explicit_agent: Option<&str>) -> Result<DetectedContext> {
        // Explicit parameters bypass the cache entirely
        if explicit_agent.is_none() && self.config.enabled {
            let cache = self.cache.lock().expect("context cache poisoned");
            if let Some((cached, at)) = cache.get(cwd) {
                if at.elapsed() < Duration::from_millis(self.config.cache_ttl_ms) {
                    return Ok(cached.clone());
                }
            }
        }

        let agent_id = self.resolve_agent(explicit_agent);
        let project = self.scopes.find_project_by_path(cwd)?;
        let session = match (&project, self.config.auto_session) {
            (Some(project), true) => self.scopes.active_session_for_project(&project.id)?,
            _ => None,
        };

        let context = DetectedContext {
            agent_id,
            project_id: project.map(|p| p.id),
            session_id: session.map(|s| s.id),
        };

        if explicit_agent.is_none() && self.config.enabled {
            let mut cache = self.cache.lock().expect("context cache poisoned");
            cache.insert(cwd.to_string(), (context.clone(), Instant::now()));
        }
        Ok(context)
    }

    /// Resolve the project id for a scoped operation.
    ///
    /// An explicit id wins but earns a warning when the active session
    /// belongs to a different project.
    pub fn resolve_project_scope(
        &self,
        scope_type: ScopeType,
        explicit_scope_id: Option<&str>,
        cwd: &str,
    ) -> Result<ScopeResolution> {
        if scope_type != ScopeType::Project {
            return Ok(ScopeResolution {
                project_id: explicit_scope_id.map(str::to_string),
                source: if explicit_scope_id.is_some() {
                    ScopeSource::Explicit
                } else {
                    ScopeSource::Detected
                },
                session_id: None,
                warning: None,
            });
        }

        let detected = self.detect(cwd, None)?;

        match explicit_scope_id {
            Some(explicit) => {
                let mut warning = None;
                if let Some(detected_project) = &detected.project_id {
                    if detected_project != explicit && detected.session_id.is_some() {
                        warning = Some(format!(
                            "explicit project '{}' differs from the active session's project '{}'",
                            explicit, detected_project
                        ));
                        tracing::warn!(explicit, detected = %detected_project, "project scope mismatch");
                    }
                }
                Ok(ScopeResolution {
                    project_id: Some(explicit.to_string()),
                    source: ScopeSource::Explicit,
                    session_id: detected.session_id,
                    warning,
                })
            }
            None => Ok(ScopeResolution {
                project_id: detected.project_id,
                source: ScopeSource::Detected,
                session_id: detected.session_id,
                warning: None,
            }),
        }
    }

    /// Drop every cached detection.
    pub fn invalidate_cache(&self) {
        self.cache.lock().expect("context cache poisoned").clear();
    }
}
