//! # amem-core
//!
//! A scope-aware persistent memory service for autonomous agents. Typed
//! knowledge artifacts (guidelines, tools, knowledge, experiences with
//! trajectories) live in a versioned SQLite store under a
//! global/org/project/agent/session scope hierarchy, with full-text and
//! vector search, classification of free-form text, hook-driven learning,
//! per-agent authorization and rate limits.
//!
//! ## Core Components
//!
//! - **Storage**: versioned repositories over one synchronous SQLite
//!   handle, with a transaction-escape detector
//! - **Classify**: rule-based text classification with self-adjusting
//!   pattern confidence
//! - **Embedding**: bounded-concurrency queue, vector store, and
//!   dimension-drift re-embedding
//! - **Ratelimit / Breaker**: token buckets with burst floors and
//!   per-service circuit breakers around every outbound call
//! - **Hooks / Librarian**: failure streams become experiences; batch
//!   analysis proposes promotions and consolidations
//!
//! ## Example
//!
//! ```rust,ignore
//! use amem_core::{MemoryConfig, MemoryService};
//! use amem_core::artifact::{EntryType};
//! use amem_core::handler::ToolRequest;
//!
//! let service = MemoryService::open("memory.db", MemoryConfig::from_env())?;
//! service.start_background();
//!
//! let response = service.dispatch(
//!     EntryType::Guideline,
//!     &ToolRequest::new("add", "agent-a", serde_json::json!({
//!         "scope_type": "project",
//!         "scope_id": "proj-1",
//!         "name": "strict-mode",
//!         "content": "Always enable strict mode",
//!     })),
//! )?;
//! ```

pub mod artifact;
pub mod breaker;
pub mod classify;
pub mod config;
pub mod context;
pub mod cursor;
pub mod duplicate;
pub mod embedding;
pub mod error;
pub mod export;
pub mod handler;
pub mod hooks;
pub mod librarian;
pub mod metrics;
pub mod permissions;
pub mod ratelimit;
pub mod scope;
pub mod service;
pub mod storage;
pub mod validation;

// Re-exports for convenience
pub use artifact::{
    EntryType, Envelope, Experience, ExperienceInput, ExperienceLevel, Guideline, GuidelineInput,
    Knowledge, KnowledgeInput, ToolCard, ToolInput, TrajectoryStep, VersionRecord,
};
pub use breaker::{BreakerConfig, BreakerRegistry, BreakerState, BreakerStats, CircuitBreaker};
pub use classify::{Classification, ClassificationMethod, Classifier, LlmFallback};
pub use config::{
    AutoContextConfig, ClassificationConfig, CursorConfig, EmbeddingConfig, FailMode,
    LearningConfig, LimiterConfig, MemoryConfig, RateLimitSettings,
};
pub use context::{ContextDetector, DetectedContext, ScopeResolution, ScopeSource};
pub use cursor::{CursorCodec, CursorPayload, MAX_CURSOR_BYTES};
pub use duplicate::{DuplicateCheck, DuplicateService, SimilarEntry};
pub use embedding::{
    EmbeddingProvider, EmbeddingQueue, HashEmbeddingProvider, QueueStats, ReembedService,
    ReembedState, VectorStore,
};
pub use error::{Error, Result};
pub use export::{ExportFormat, ExportService, ExportedArtifact, ImportOutcome};
pub use handler::{
    Action, AnalyticsService, BackupService, CommitOutcome, CrudHandler, Observation,
    ObserveService, ToolRequest,
};
pub use hooks::{
    ErrorNotificationEvent, HookEvent, LearningService, SubagentCompletionEvent, ToolFailureEvent,
    ToolSuccessEvent,
};
pub use librarian::{
    AnalysisJob, JobState, Librarian, Recommendation, RecommendationKind, RecommendationState,
};
pub use metrics::{Metrics, MetricsSnapshot};
pub use permissions::{Permission, PermissionService, ResourceRef};
pub use ratelimit::{
    CompositeRateLimiter, LocalRateLimiter, RateLimitBackend, RateLimitDecision, RemoteRateLimiter,
};
pub use scope::{Scope, ScopeType};
pub use service::MemoryService;
pub use storage::{
    AuditLog, AuditOutcome, EntryFilter, ExperienceRepository, GuidelineRepository,
    InvalidationAction, InvalidationBus, InvalidationEvent, KnowledgeRepository, Page,
    ScopeRepository, StorageAdapter, ToolRepository,
};
pub use validation::{check_pattern_safety, compile_guarded, ValidationReport, Validator};
