//! Scope-aware versioned storage engine.
//!
//! The storage adapter exclusively owns the SQLite handle; typed
//! repositories borrow it and provide versioned CRUD per artifact kind.
//! Writes append to immutable version chains and swap the head atomically;
//! committed writes publish cache-invalidation events; reads report access
//! for out-of-band counter updates.
//!
//! ## Example
//!
//! ```rust,ignore
//! use amem_core::storage::{StorageAdapter, GuidelineRepository};
//!
//! let adapter = StorageAdapter::open("memory.db", metrics)?;
//! let guidelines = GuidelineRepository::new(adapter.clone(), cursors);
//!
//! let g = guidelines.create(&scope, &input)?;
//! guidelines.update(&g.envelope.id, &edited)?;   // appends v2
//! let history = guidelines.get_history(&g.envelope.id)?;
//! ```

mod adapter;
mod audit;
mod events;
mod experiences;
mod guidelines;
mod knowledge;
mod repository;
mod schema;
mod sessions;
mod tools;

pub use adapter::StorageAdapter;
pub use audit::{AuditEvent, AuditLog, AuditOutcome};
pub use events::{InvalidationAction, InvalidationBus, InvalidationEvent};
pub use experiences::ExperienceRepository;
pub use guidelines::GuidelineRepository;
pub use knowledge::KnowledgeRepository;
pub use repository::{
    no_parent_scopes, AccessTracker, EntryCore, EntryFilter, EntryRecord, Page, MAX_PAGE_SIZE,
};
pub use schema::{get_schema_version, initialize_schema, is_initialized, SCHEMA_VERSION};
pub use sessions::{Org, Project, ScopeRepository, Session};
pub use tools::ToolRepository;
