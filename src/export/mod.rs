//! Artifact export and sentinel-driven re-import.
//!
//! Exports carry a sentinel per artifact (source id, version, scope,
//! export time). Importing uses the sentinel to decide create-vs-update,
//! optionally remapping scopes; re-importing an unchanged export is a
//! no-op.

mod formats;

pub use formats::{parse, render, ExportFormat, ExportSentinel, ExportedArtifact};

use crate::artifact::EntryType;
use crate::cursor::CursorCodec;
use crate::error::Result;
use crate::scope::Scope;
use crate::storage::{EntryCore, EntryFilter, StorageAdapter};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

/// Outcome of one import pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ImportOutcome {
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
}

/// Export/import over every artifact kind.
pub struct ExportService {
    cores: HashMap<EntryType, EntryCore>,
}

impl ExportService {
    pub fn new(adapter: Arc<StorageAdapter>, cursors: CursorCodec) -> Self {
        let cores = EntryType::ALL
            .into_iter()
            .map(|entry_type| {
                (
                    entry_type,
                    EntryCore::new(Arc::clone(&adapter), entry_type, cursors.clone()),
                )
            })
            .collect();
        Self { cores }
    }

    fn core(&self, entry_type: EntryType) -> &EntryCore {
        self.cores
            .get(&entry_type)
            .expect("all entry types registered")
    }

    /// Export every matching artifact of a kind.
    pub fn export(
        &self,
        entry_type: EntryType,
        filter: &EntryFilter,
        format: ExportFormat,
    ) -> Result<String> {
        let mut artifacts = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = self
                .core(entry_type)
                .list(filter, crate::storage::MAX_PAGE_SIZE, cursor.as_deref())?;
            artifacts.extend(page.items.iter().map(ExportedArtifact::from_record));
            if !page.has_more {
                break;
            }
            cursor = page.next_cursor;
        }
        render(&artifacts, format)
    }

    /// Import artifacts, creating or updating by sentinel id.
    ///
    /// `scope_remap` rewrites exported scopes (keys are the exported
    /// scope's display form, e.g. `project:p1`).
    pub fn import(
        &self,
        content: &str,
        format: ExportFormat,
        scope_remap: &HashMap<String, Scope>,
    ) -> Result<ImportOutcome> {
        let artifacts = parse(content, format)?;
        let mut outcome = ImportOutcome::default();

        for artifact in artifacts {
            let core = self.core(artifact.sentinel.entry_type);
            let scope = scope_remap
                .get(&artifact.sentinel.scope.to_string())
                .cloned()
                .unwrap_or_else(|| artifact.sentinel.scope.clone());
            let content_text = artifact.payload["content"]
                .as_str()
                .or_else(|| artifact.payload["description"].as_str())
                .unwrap_or_default()
                .to_string();

            match core.get_by_id(&artifact.sentinel.id)? {
                Some(existing) => {
                    if existing.name == artifact.name && existing.payload == artifact.payload {
                        outcome.unchanged += 1;
                    } else {
                        core.update(
                            &artifact.sentinel.id,
                            &artifact.name,
                            &content_text,
                            &artifact.payload,
                        )?;
                        outcome.updated += 1;
                    }
                }
                None => {
                    core.create_with_id(
                        &artifact.sentinel.id,
                        &scope,
                        &artifact.name,
                        &content_text,
                        &artifact.payload,
                    )?;
                    outcome.created += 1;
                }
            }
        }

        tracing::info!(
            created = outcome.created,
            updated = outcome.updated,
            unchanged = outcome.unchanged,
            "import finished"
        );
        Ok(outcome)
    }
}
