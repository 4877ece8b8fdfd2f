//! Tool-call handlers.
//!
//! One generic action dispatcher serves every artifact kind through a
//! small per-kind strategy; observe-commit, analytics, and backup round
//! out the tool surface. Every mutation is rate-limited,
//! permission-checked, audited, and followed by a cache-invalidation
//! event.

mod action;
mod analytics;
mod backup;
mod crud;
mod observe;

pub use action::{Action, ListMeta, ToolRequest};
pub use analytics::{
    AnalyticsService, ErrorCorrelation, KindUsage, LowDiversityScope, SubtaskStats, TopEntry,
    TrendPoint,
};
pub use backup::{BackupInfo, BackupService, DEFAULT_KEEP_COUNT};
pub use crud::{
    experience_spec, guideline_spec, knowledge_spec, record_to_json, tool_spec, CrudHandler,
    KindSpec,
};
pub use observe::{CommitOutcome, Observation, ObserveService};
