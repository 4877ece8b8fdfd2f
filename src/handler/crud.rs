//! Generic action dispatcher over a per-kind strategy.
//!
//! One handler implements every artifact tool; each kind supplies a small
//! strategy value (name field, parameter extraction, response keys). All
//! mutations are permission-checked and audited; bulk operations check the
//! whole batch first and fail fast before executing anything.

use crate::artifact::EntryType;
use crate::duplicate::DuplicateService;
use crate::embedding::EmbeddingQueue;
use crate::error::{Error, Result};
use crate::handler::action::{Action, ListMeta, ToolRequest};
use crate::permissions::{Permission, PermissionService, ResourceRef};
use crate::ratelimit::CompositeRateLimiter;
use crate::scope::{Scope, ScopeType};
use crate::storage::{AuditLog, AuditOutcome, EntryCore, EntryFilter, EntryRecord};
use crate::validation::{ValidationReport, Validator};
use serde_json::{json, Value};
use std::sync::Arc;

/// Per-kind strategy consumed by the generic handler.
pub struct KindSpec {
    pub entry_type: EntryType,
    /// "name" for guidelines/tools, "title" for knowledge/experiences
    pub name_field: &'static str,
    pub singular_key: &'static str,
    pub plural_key: &'static str,
    /// Extract `(name, content, payload)` from request params
    pub extract: fn(&Value) -> Result<(String, String, Value)>,
}

/// Strategy for guidelines.
pub fn guideline_spec() -> KindSpec {
    KindSpec {
        entry_type: EntryType::Guideline,
        name_field: "name",
        singular_key: "guideline",
        plural_key: "guidelines",
        extract: |params| {
            let name = str_field(params, "name")?;
            let content = str_field(params, "content")?;
            let payload = json!({
                "priority": params["priority"].as_i64().unwrap_or(0),
                "category": params["category"].as_str(),
                "content": content,
                "rationale": params["rationale"].as_str(),
                "examples": params["examples"].as_array().cloned().unwrap_or_default(),
            });
            Ok((name, content, payload))
        },
    }
}

/// Strategy for tools.
pub fn tool_spec() -> KindSpec {
    KindSpec {
        entry_type: EntryType::Tool,
        name_field: "name",
        singular_key: "tool",
        plural_key: "tools",
        extract: |params| {
            let name = str_field(params, "name")?;
            let description = str_field(params, "description")?;
            let payload = json!({
                "category": params["category"].as_str(),
                "description": description,
                "parameters": params["parameters"].clone(),
                "constraints": params["constraints"].as_array().cloned().unwrap_or_default(),
            });
            Ok((name, description, payload))
        },
    }
}

/// Strategy for knowledge.
pub fn knowledge_spec() -> KindSpec {
    KindSpec {
        entry_type: EntryType::Knowledge,
        name_field: "title",
        singular_key: "knowledge",
        plural_key: "knowledgeEntries",
        extract: |params| {
            let title = str_field(params, "title")?;
            let content = str_field(params, "content")?;

            let mut report = ValidationReport::default();
            for field in ["valid_from", "valid_until"] {
                if let Some(value) = params[field].as_str() {
                    Validator::date_in_range(&mut report, field, value);
                }
            }
            if let Some(confidence) = params["confidence"].as_f64() {
                Validator::confidence(&mut report, "confidence", confidence);
            }
            report.into_result()?;

            let payload = json!({
                "category": params["category"].as_str(),
                "content": content,
                "source": params["source"].as_str(),
                "confidence": params["confidence"].as_f64().unwrap_or(0.7),
                "valid_from": params["valid_from"].as_str(),
                "valid_until": params["valid_until"].as_str(),
                "invalidated_by": null,
            });
            Ok((title, content, payload))
        },
    }
}

/// Strategy for experiences.
pub fn experience_spec() -> KindSpec {
    KindSpec {
        entry_type: EntryType::Experience,
        name_field: "title",
        singular_key: "experience",
        plural_key: "experiences",
        extract: |params| {
            let title = str_field(params, "title")?;
            let content = str_field(params, "content")?;
            let level = params["level"].as_str().unwrap_or("case");
            if !matches!(level, "case" | "strategy") {
                return Err(Error::validation("level", "must be 'case' or 'strategy'"));
            }
            let payload = json!({
                "level": level,
                "category": params["category"].as_str(),
                "scenario": params["scenario"].as_str(),
                "outcome": params["outcome"].as_str(),
                "content": content,
                "confidence": params["confidence"].as_f64().unwrap_or(0.6),
            });
            Ok((title, content, payload))
        },
    }
}

fn str_field(params: &Value, field: &str) -> Result<String> {
    params[field]
        .as_str()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| Error::validation(field, "is required"))
}

/// The generic CRUD handler.
pub struct CrudHandler {
    spec: KindSpec,
    core: EntryCore,
    permissions: Arc<PermissionService>,
    audit: AuditLog,
    limiter: Option<Arc<CompositeRateLimiter>>,
    duplicates: Arc<DuplicateService>,
    embeddings: Option<Arc<EmbeddingQueue>>,
}

impl CrudHandler {
    pub fn new(
        spec: KindSpec,
        core: EntryCore,
        permissions: Arc<PermissionService>,
        audit: AuditLog,
        duplicates: Arc<DuplicateService>,
    ) -> Self {
        Self {
            spec,
            core,
            permissions,
            audit,
            limiter: None,
            duplicates,
            embeddings: None,
        }
    }

    pub fn with_limiter(mut self, limiter: Arc<CompositeRateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn with_embeddings(mut self, embeddings: Arc<EmbeddingQueue>) -> Self {
        self.embeddings = Some(embeddings);
        self
    }

    /// Dispatch one tool request.
    pub fn handle(&self, request: &ToolRequest) -> Result<Value> {
        if let Some(limiter) = &self.limiter {
            limiter.check(&request.agent_id).into_result()?;
        }

        let action: Action = request.action.parse()?;
        let result = self.dispatch(action, request);

        if action.is_mutation() {
            let outcome = match &result {
                Ok(_) => AuditOutcome::Success,
                Err(Error::PermissionDenied { .. }) => AuditOutcome::Denied,
                Err(_) => AuditOutcome::Failed,
            };
            self.audit.record(
                &request.agent_id,
                &format!("{}.{}", self.spec.singular_key, action),
                &format!(
                    "{}:{}",
                    self.spec.entry_type,
                    request.optional_str("id").unwrap_or("*")
                ),
                outcome,
                result.as_ref().err().map(|e| e.to_string()).as_deref(),
            );
        }

        result
    }

    fn dispatch(&self, action: Action, request: &ToolRequest) -> Result<Value> {
        match action {
            Action::Add => self.add(request, &request.params),
            Action::Update => self.update(request, &request.params),
            Action::Get => self.get(request),
            Action::List => self.list(request),
            Action::History => self.history(request),
            Action::Deactivate => self.set_active(request, false),
            Action::Delete => self.delete(request),
            Action::BulkAdd => self.bulk(request, Action::BulkAdd),
            Action::BulkUpdate => self.bulk(request, Action::BulkUpdate),
            Action::BulkDelete => self.bulk(request, Action::BulkDelete),
        }
    }

    fn scope_from(&self, params: &Value) -> Result<Scope> {
        let scope_type: ScopeType = params["scope_type"]
            .as_str()
            .ok_or_else(|| Error::validation("scope_type", "is required"))?
            .parse()?;
        let scope_id = params["scope_id"].as_str().map(str::to_string);
        // Scope::new enforces non-global-requires-id and global-forbids-id
        Scope::new(scope_type, scope_id)
    }

    fn add(&self, request: &ToolRequest, params: &Value) -> Result<Value> {
        let scope = self.scope_from(params)?;
        let (name, content, payload) = (self.spec.extract)(params)?;

        self.require(
            &request.agent_id,
            Permission::Write,
            &ResourceRef::scope(scope.clone()),
        )?;

        let check = self.duplicates.check(
            self.spec.entry_type,
            &name,
            scope.scope_type,
            scope.scope_id.as_deref(),
        )?;
        if check.is_duplicate {
            return Err(Error::DuplicateEntry {
                name,
                similar: check
                    .similar_entries
                    .into_iter()
                    .map(|e| e.entry_id)
                    .collect(),
            });
        }

        let envelope = self.core.create(&scope, &name, &content, &payload)?;
        if let Some(tags) = params["tags"].as_array() {
            let tags: Vec<String> = tags
                .iter()
                .filter_map(|t| t.as_str().map(str::to_string))
                .collect();
            self.core.set_tags(&envelope.id, &tags)?;
        }
        self.enqueue_embedding(&envelope.id, &envelope.current_version_id, &name, &content);

        Ok(json!({
            (self.spec.singular_key): self.record_json(&name, &payload, &envelope.id)?,
        }))
    }

    fn update(&self, request: &ToolRequest, params: &Value) -> Result<Value> {
        let id = params["id"]
            .as_str()
            .ok_or_else(|| Error::validation("id", "is required"))?;
        let existing = self
            .core
            .get_by_id(id)?
            .ok_or_else(|| Error::not_found(self.spec.singular_key, id))?;

        self.require(
            &request.agent_id,
            Permission::Write,
            &ResourceRef::entry(
                existing.envelope.scope.clone(),
                self.spec.entry_type,
                id,
            ),
        )?;

        let (name, content, payload) = (self.spec.extract)(params)?;
        let envelope = self.core.update(id, &name, &content, &payload)?;
        self.enqueue_embedding(id, &envelope.current_version_id, &name, &content);

        Ok(json!({
            (self.spec.singular_key): self.record_json(&name, &payload, id)?,
        }))
    }

    fn get(&self, request: &ToolRequest) -> Result<Value> {
        let record = match request.optional_str("id") {
            Some(id) => self.core.get_by_id(id)?,
            None => {
                let name = request
                    .optional_str(self.spec.name_field)
                    .ok_or_else(|| {
                        Error::validation(
                            "id",
                            format!("either 'id' or ('{}', 'scope_type') is required", self.spec.name_field),
                        )
                    })?;
                let scope_type: ScopeType = request.required_str("scope_type")?.parse()?;
                let inherit = request.params["inherit"].as_bool().unwrap_or(true);
                self.core.get_by_name(
                    name,
                    scope_type,
                    request.optional_str("scope_id"),
                    inherit,
                    &crate::storage::no_parent_scopes,
                )?
            }
        };

        let record = record.ok_or_else(|| {
            Error::not_found(self.spec.singular_key, request.optional_str("id").unwrap_or("?"))
        })?;
        self.require(
            &request.agent_id,
            Permission::Read,
            &ResourceRef::entry(
                record.envelope.scope.clone(),
                self.spec.entry_type,
                record.envelope.id.clone(),
            ),
        )?;

        Ok(json!({ (self.spec.singular_key): record_to_json(&record, self.spec.name_field) }))
    }

    fn list(&self, request: &ToolRequest) -> Result<Value> {
        let params = &request.params;
        let filter = EntryFilter {
            scope_type: match params["scope_type"].as_str() {
                Some(s) => Some(s.parse()?),
                None => None,
            },
            scope_id: params["scope_id"].as_str().map(str::to_string),
            category: params["category"].as_str().map(str::to_string),
            level: params["level"].as_str().map(str::to_string),
            tag: params["tag"].as_str().map(str::to_string),
            text_query: params["query"].as_str().map(str::to_string),
            include_inactive: params["include_inactive"].as_bool().unwrap_or(false),
        };
        let limit = params["limit"].as_u64().unwrap_or(20);
        let page = self
            .core
            .list(&filter, limit, params["cursor"].as_str())?;

        // Post-filter by read permission
        let resources: Vec<ResourceRef> = page
            .items
            .iter()
            .map(|record| {
                ResourceRef::entry(
                    record.envelope.scope.clone(),
                    self.spec.entry_type,
                    record.envelope.id.clone(),
                )
            })
            .collect();
        let allowed = self
            .permissions
            .check_batch(&request.agent_id, Permission::Read, &resources);

        let items: Vec<Value> = page
            .items
            .iter()
            .zip(resources.iter())
            .filter(|(_, resource)| allowed.get(&resource.key()).copied().unwrap_or(false))
            .map(|(record, _)| record_to_json(record, self.spec.name_field))
            .collect();

        let meta = ListMeta {
            returned_count: items.len(),
            has_more: page.has_more,
            next_cursor: page.next_cursor,
        };
        Ok(json!({ (self.spec.plural_key): items, "meta": meta }))
    }

    fn history(&self, request: &ToolRequest) -> Result<Value> {
        let id = request.required_str("id")?;
        let record = self
            .core
            .get_by_id(id)?
            .ok_or_else(|| Error::not_found(self.spec.singular_key, id))?;
        self.require(
            &request.agent_id,
            Permission::Read,
            &ResourceRef::entry(record.envelope.scope, self.spec.entry_type, id),
        )?;

        let versions = self.core.get_history(id)?;
        Ok(json!({
            "id": id,
            "versions": versions
                .iter()
                .map(|v| json!({
                    "versionId": v.version_id,
                    "versionNum": v.version_num,
                    "payload": v.payload,
                    "createdAt": v.created_at.to_rfc3339(),
                }))
                .collect::<Vec<_>>(),
        }))
    }

    fn set_active(&self, request: &ToolRequest, active: bool) -> Result<Value> {
        let id = request.required_str("id")?;
        let record = self
            .core
            .get_by_id(id)?
            .ok_or_else(|| Error::not_found(self.spec.singular_key, id))?;
        self.require(
            &request.agent_id,
            Permission::Write,
            &ResourceRef::entry(record.envelope.scope, self.spec.entry_type, id),
        )?;
        self.core.set_active(id, active)?;
        Ok(json!({ "id": id, "isActive": active }))
    }

    fn delete(&self, request: &ToolRequest) -> Result<Value> {
        let id = request.required_str("id")?;
        let record = self
            .core
            .get_by_id(id)?
            .ok_or_else(|| Error::not_found(self.spec.singular_key, id))?;
        self.require(
            &request.agent_id,
            Permission::Admin,
            &ResourceRef::entry(record.envelope.scope, self.spec.entry_type, id),
        )?;
        self.core.delete(id)?;
        Ok(json!({ "id": id, "deleted": true }))
    }

    /// Bulk operations: check the whole batch first; if any item is
    /// denied, nothing executes.
    fn bulk(&self, request: &ToolRequest, action: Action) -> Result<Value> {
        let items = request.params["items"]
            .as_array()
            .ok_or_else(|| Error::validation("items", "must be an array"))?;
        if items.is_empty() {
            return Err(Error::validation("items", "must not be empty"));
        }

        let (permission, resources): (Permission, Vec<ResourceRef>) = match action {
            Action::BulkAdd => {
                let mut resources = Vec::new();
                for item in items {
                    resources.push(ResourceRef::scope(self.scope_from(item)?));
                }
                (Permission::Write, resources)
            }
            Action::BulkUpdate | Action::BulkDelete => {
                let mut resources = Vec::new();
                for item in items {
                    let id = item["id"]
                        .as_str()
                        .ok_or_else(|| Error::validation("id", "is required per item"))?;
                    let record = self
                        .core
                        .get_by_id(id)?
                        .ok_or_else(|| Error::not_found(self.spec.singular_key, id))?;
                    resources.push(ResourceRef::entry(
                        record.envelope.scope,
                        self.spec.entry_type,
                        id,
                    ));
                }
                let permission = if action == Action::BulkDelete {
                    Permission::Admin
                } else {
                    Permission::Write
                };
                (permission, resources)
            }
            _ => unreachable!("bulk dispatch only receives bulk actions"),
        };

        let allowed = self
            .permissions
            .check_batch(&request.agent_id, permission, &resources);
        if let Some(denied) = resources.iter().find(|r| !allowed.get(&r.key()).copied().unwrap_or(false)) {
            return Err(Error::permission_denied(
                &request.agent_id,
                permission.to_string(),
                denied.key(),
            ));
        }

        let mut results = Vec::with_capacity(items.len());
        for item in items {
            let sub_request = ToolRequest::new(&request.action, &request.agent_id, item.clone());
            let result = match action {
                Action::BulkAdd => self.add(&sub_request, item)?,
                Action::BulkUpdate => self.update(&sub_request, item)?,
                Action::BulkDelete => {
                    let id = item["id"].as_str().expect("validated above");
                    self.core.delete(id)?;
                    json!({ "id": id, "deleted": true })
                }
                _ => unreachable!(),
            };
            results.push(result);
        }

        Ok(json!({ "results": results, "count": results.len() }))
    }

    fn require(
        &self,
        agent_id: &str,
        permission: Permission,
        resource: &ResourceRef,
    ) -> Result<()> {
        if self.permissions.check(agent_id, permission, resource) {
            Ok(())
        } else {
            Err(Error::permission_denied(
                agent_id,
                permission.to_string(),
                resource.key(),
            ))
        }
    }

    fn enqueue_embedding(&self, id: &str, version_id: &str, name: &str, content: &str) {
        if let Some(embeddings) = &self.embeddings {
            let text = format!("{} {}", name, content);
            if let Err(err) =
                embeddings.enqueue(self.spec.entry_type, id, version_id, &text)
            {
                tracing::debug!(id, error = %err, "embedding enqueue failed");
            }
        }
    }

    fn record_json(&self, name: &str, payload: &Value, id: &str) -> Result<Value> {
        let record = self
            .core
            .get_by_id(id)?
            .ok_or_else(|| Error::not_found(self.spec.singular_key, id))?;
        let mut body = record_to_json(&record, self.spec.name_field);
        body[self.spec.name_field] = json!(name);
        if let (Some(target), Some(source)) = (body.as_object_mut(), payload.as_object()) {
            for (key, value) in source {
                target.entry(key.clone()).or_insert_with(|| value.clone());
            }
        }
        Ok(body)
    }
}

/// Render an entry record for tool responses.
pub fn record_to_json(record: &EntryRecord, name_field: &str) -> Value {
    let mut body = json!({
        "id": record.envelope.id,
        (name_field): record.name,
        "scopeType": record.envelope.scope.scope_type.to_string(),
        "scopeId": record.envelope.scope.scope_id,
        "versionNum": record.envelope.version_num,
        "isActive": record.envelope.is_active,
        "createdAt": record.envelope.created_at.to_rfc3339(),
        "updatedAt": record.envelope.updated_at.to_rfc3339(),
    });
    if let (Some(target), Some(payload)) = (body.as_object_mut(), record.payload.as_object()) {
        for (key, value) in payload {
            target.entry(key.clone()).or_insert_with(|| value.clone());
        }
    }
    body
}
