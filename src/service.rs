//! The root application context.
//!
//! All long-lived services (limiters, breaker registry, embedding queue,
//! learning, librarian) are owned here and injected by value into the
//! components that use them. Nothing reads ambient globals; tests get
//! explicit `reset_*_for_tests` hooks.

use crate::breaker::{BreakerConfig, BreakerRegistry};
use crate::classify::Classifier;
use crate::config::MemoryConfig;
use crate::context::ContextDetector;
use crate::cursor::CursorCodec;
use crate::duplicate::DuplicateService;
use crate::embedding::{
    EmbeddingProvider, EmbeddingQueue, HashEmbeddingProvider, ReembedService, StoredTextSource,
    VectorStore,
};
use crate::error::Result;
use crate::handler::{
    experience_spec, guideline_spec, knowledge_spec, tool_spec, AnalyticsService, CrudHandler,
    ObserveService, ToolRequest,
};
use crate::artifact::EntryType;
use crate::hooks::LearningService;
use crate::librarian::Librarian;
use crate::metrics::Metrics;
use crate::permissions::PermissionService;
use crate::ratelimit::CompositeRateLimiter;
use crate::scope::Scope;
use crate::storage::{
    AuditLog, EntryCore, ExperienceRepository, GuidelineRepository, KnowledgeRepository,
    ScopeRepository, StorageAdapter, ToolRepository,
};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Everything a running memory service owns.
pub struct MemoryService {
    pub config: MemoryConfig,
    pub metrics: Metrics,
    pub adapter: Arc<StorageAdapter>,
    pub cursors: CursorCodec,
    pub scopes: Arc<ScopeRepository>,
    pub guidelines: Arc<GuidelineRepository>,
    pub tools: Arc<ToolRepository>,
    pub knowledge: Arc<KnowledgeRepository>,
    pub experiences: Arc<ExperienceRepository>,
    pub permissions: Arc<PermissionService>,
    pub audit: AuditLog,
    pub limiter: Arc<CompositeRateLimiter>,
    pub breakers: Arc<BreakerRegistry>,
    pub classifier: Arc<Classifier>,
    pub vectors: VectorStore,
    pub embedding_queue: Arc<EmbeddingQueue>,
    pub reembed: Arc<ReembedService>,
    pub duplicates: Arc<DuplicateService>,
    pub context: Arc<ContextDetector>,
    pub learning: Arc<LearningService>,
    pub librarian: Arc<Librarian>,
    pub observe: Arc<ObserveService>,
    pub analytics: Arc<AnalyticsService>,
    handlers: HashMap<EntryType, CrudHandler>,
    /// Pending librarian trigger stream, consumed by `start_background`
    analysis_rx: Mutex<Option<mpsc::UnboundedReceiver<Scope>>>,
}

impl MemoryService {
    /// Open (or create) a service over a database file.
    pub fn open(path: impl AsRef<Path>, config: MemoryConfig) -> Result<Self> {
        let metrics = Metrics::new();
        let adapter = StorageAdapter::open(path, metrics.clone())?;
        Self::build(adapter, config, metrics)
    }

    /// In-memory service (tests, ephemeral sessions).
    pub fn in_memory(config: MemoryConfig) -> Result<Self> {
        let adapter = StorageAdapter::in_memory()?;
        let metrics = adapter.metrics().clone();
        Self::build(adapter, config, metrics)
    }

    fn build(
        adapter: Arc<StorageAdapter>,
        config: MemoryConfig,
        metrics: Metrics,
    ) -> Result<Self> {
        let cursors = CursorCodec::new(config.cursor.secret.as_deref());

        let scopes = Arc::new(ScopeRepository::new(Arc::clone(&adapter)));
        let guidelines = Arc::new(GuidelineRepository::new(
            Arc::clone(&adapter),
            cursors.clone(),
        ));
        let tools = Arc::new(ToolRepository::new(Arc::clone(&adapter), cursors.clone()));
        let knowledge = Arc::new(KnowledgeRepository::new(
            Arc::clone(&adapter),
            cursors.clone(),
        ));
        let experiences = Arc::new(ExperienceRepository::new(
            Arc::clone(&adapter),
            cursors.clone(),
        ));

        let permissions = Arc::new(PermissionService::new(Arc::clone(&adapter)));
        let audit = AuditLog::new(Arc::clone(&adapter));
        let limiter = Arc::new(CompositeRateLimiter::new(&config.rate_limit));
        let breakers = Arc::new(BreakerRegistry::new(BreakerConfig::default()));
        let classifier = Arc::new(Classifier::new(
            Arc::clone(&adapter),
            config.classification.clone(),
        ));
        let duplicates = Arc::new(DuplicateService::new(Arc::clone(&adapter)));

        let provider: Arc<dyn EmbeddingProvider> = Arc::new(HashEmbeddingProvider::new(384));
        let vectors = VectorStore::new(Arc::clone(&adapter));
        let embedding_queue = Arc::new(EmbeddingQueue::new(
            Arc::clone(&provider),
            vectors.clone(),
            config.embedding.clone(),
        ));
        let reembed = Arc::new(ReembedService::new(
            provider,
            vectors.clone(),
            Arc::new(StoredTextSource::new(Arc::clone(&adapter))),
            config.embedding.clone(),
        ));

        let context = Arc::new(ContextDetector::new(
            Arc::clone(&scopes),
            config.auto_context.clone(),
        ));

        let (analysis_tx, analysis_rx) = mpsc::unbounded_channel();
        let learning = Arc::new(
            LearningService::new(
                Arc::clone(&experiences),
                Arc::clone(&knowledge),
                config.learning.clone(),
            )
            .with_analysis_channel(analysis_tx),
        );
        let librarian = Arc::new(Librarian::new(Arc::clone(&experiences)));

        let observe = Arc::new(ObserveService::new(
            Arc::clone(&guidelines),
            Arc::clone(&tools),
            Arc::clone(&knowledge),
            Arc::clone(&duplicates),
            Arc::clone(&scopes),
            config.classification.clone(),
        ));
        let analytics = Arc::new(AnalyticsService::new(Arc::clone(&adapter)));

        let mut handlers = HashMap::new();
        for spec in [
            guideline_spec(),
            tool_spec(),
            knowledge_spec(),
            experience_spec(),
        ] {
            let entry_type = spec.entry_type;
            let handler = CrudHandler::new(
                spec,
                EntryCore::new(Arc::clone(&adapter), entry_type, cursors.clone()),
                Arc::clone(&permissions),
                audit.clone(),
                Arc::clone(&duplicates),
            )
            .with_limiter(Arc::clone(&limiter))
            .with_embeddings(Arc::clone(&embedding_queue));
            handlers.insert(entry_type, handler);
        }

        Ok(Self {
            config,
            metrics,
            adapter,
            cursors,
            scopes,
            guidelines,
            tools,
            knowledge,
            experiences,
            permissions,
            audit,
            limiter,
            breakers,
            classifier,
            vectors,
            embedding_queue,
            reembed,
            duplicates,
            context,
            learning,
            librarian,
            observe,
            analytics,
            handlers,
            analysis_rx: Mutex::new(Some(analysis_rx)),
        })
    }

    /// The action handler for one artifact kind.
    pub fn handler(&self, entry_type: EntryType) -> &CrudHandler {
        self.handlers
            .get(&entry_type)
            .expect("all entry types registered")
    }

    /// Dispatch a `memory_<kind>` tool request.
    pub fn dispatch(&self, entry_type: EntryType, request: &ToolRequest) -> Result<Value> {
        self.handler(entry_type).handle(request)
    }

    /// Start the background tasks: embedding workers and the librarian
    /// trigger listener. Requires a tokio runtime.
    pub fn start_background(&self) {
        self.embedding_queue.start();
        if let Some(rx) = self
            .analysis_rx
            .lock()
            .expect("analysis receiver poisoned")
            .take()
        {
            tokio::spawn(Arc::clone(&self.librarian).listen(rx));
        }
    }

    /// Stop background work: queue workers, librarian listener, limiter
    /// enforcement.
    pub fn stop(&self) {
        self.embedding_queue.stop();
        self.librarian.stop();
        self.limiter.stop();
    }

    /// Clear cross-request state. Test hook.
    pub async fn reset_for_tests(&self) {
        self.limiter.reset_all();
        self.breakers.reset_all().await;
        self.metrics.reset_for_tests();
        self.context.invalidate_cache();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::{GuidelineInput, KnowledgeInput, ToolInput};
    use crate::permissions::Permission;
    use crate::scope::ScopeType;
    use serde_json::json;

    fn service() -> MemoryService {
        MemoryService::in_memory(MemoryConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_classifier_routes_to_repositories() {
        let service = service();
        let scope = Scope::global();

        // "Rule: ..." classifies as a guideline and lands there
        let result = service
            .classifier
            .classify("Rule: always use strict mode")
            .await
            .unwrap();
        assert_eq!(result.entry_type, EntryType::Guideline);
        service
            .guidelines
            .create(
                &scope,
                &GuidelineInput {
                    name: "strict-mode".to_string(),
                    content: "Rule: always use strict mode".to_string(),
                    ..Default::default()
                },
            )
            .unwrap();

        let result = service
            .classifier
            .classify("We decided to use React")
            .await
            .unwrap();
        assert_eq!(result.entry_type, EntryType::Knowledge);
        service
            .knowledge
            .create(
                &scope,
                &KnowledgeInput {
                    title: "frontend framework".to_string(),
                    content: "We decided to use React".to_string(),
                    ..Default::default()
                },
            )
            .unwrap();

        let result = service.classifier.classify("npm run build").await.unwrap();
        assert_eq!(result.entry_type, EntryType::Tool);
        service
            .tools
            .create(
                &scope,
                &ToolInput {
                    name: "npm run build".to_string(),
                    description: "builds the frontend bundle".to_string(),
                    ..Default::default()
                },
            )
            .unwrap();

        assert!(service
            .guidelines
            .get_by_name("strict-mode", ScopeType::Global, None, false)
            .unwrap()
            .is_some());
        assert!(service
            .tools
            .get_by_name("npm run build", ScopeType::Global, None, false)
            .unwrap()
            .is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_handler_write_feeds_embedding_queue() {
        let service = service();
        service
            .permissions
            .grant("agent-a", None, None, None, Permission::Admin)
            .unwrap();
        service.start_background();

        let added = service
            .dispatch(
                EntryType::Guideline,
                &ToolRequest::new(
                    "add",
                    "agent-a",
                    json!({
                        "scope_type": "global",
                        "name": "strict-mode",
                        "content": "always use strict mode",
                    }),
                ),
            )
            .unwrap();
        let id = added["guideline"]["id"].as_str().unwrap().to_string();

        // The embedding worker picks the job up off the write path
        tokio::time::timeout(std::time::Duration::from_secs(10), async {
            loop {
                if service.embedding_queue.stats().processed >= 1 {
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("embedding processed");

        let stored = service
            .vectors
            .get(EntryType::Guideline, &id)
            .unwrap()
            .unwrap();
        assert_eq!(stored.dimension, 384);

        service.stop();
    }

    #[tokio::test]
    async fn test_rate_limit_disabled_via_settings() {
        let mut config = MemoryConfig::default();
        config.rate_limit = crate::config::RateLimitSettings::disabled();
        let service = MemoryService::in_memory(config).unwrap();
        service
            .permissions
            .grant("agent-a", None, None, None, Permission::Admin)
            .unwrap();

        for i in 0..200 {
            service
                .dispatch(
                    EntryType::Guideline,
                    &ToolRequest::new(
                        "add",
                        "agent-a",
                        json!({
                            "scope_type": "global",
                            "name": format!("g{}", i),
                            "content": "content",
                        }),
                    ),
                )
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_reset_for_tests() {
        let service = service();
        service.metrics.incr("x");
        service.reset_for_tests().await;
        assert_eq!(service.metrics.counter("x"), 0);
    }
}
