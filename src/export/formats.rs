//! Export formats: JSON (canonical), YAML, Markdown with front-matter,
//! and OpenAPI for tools.
//!
//! Every exported artifact carries a sentinel naming its source id,
//! version, scope, and export time; re-import reads the sentinel to
//! decide create-versus-update.

use crate::artifact::EntryType;
use crate::error::{Error, Result};
use crate::scope::Scope;
use crate::storage::EntryRecord;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Supported export formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Json,
    Yaml,
    Markdown,
    /// Tools only
    OpenApi,
}

/// The sentinel carried by every exported artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportSentinel {
    pub id: String,
    pub entry_type: EntryType,
    pub version_num: i64,
    pub scope: Scope,
    pub exported_at: DateTime<Utc>,
}

/// A format-independent exported artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportedArtifact {
    pub sentinel: ExportSentinel,
    pub name: String,
    pub payload: Value,
}

impl ExportedArtifact {
    pub fn from_record(record: &EntryRecord) -> Self {
        Self {
            sentinel: ExportSentinel {
                id: record.envelope.id.clone(),
                entry_type: record.envelope.entry_type,
                version_num: record.envelope.version_num,
                scope: record.envelope.scope.clone(),
                exported_at: Utc::now(),
            },
            name: record.name.clone(),
            payload: record.payload.clone(),
        }
    }
}

/// Render artifacts in the requested format.
pub fn render(artifacts: &[ExportedArtifact], format: ExportFormat) -> Result<String> {
    match format {
        ExportFormat::Json => {
            serde_json::to_string_pretty(&json!({ "artifacts": artifacts }))
                .map_err(Error::from)
        }
        ExportFormat::Yaml => serde_yaml::to_string(&json!({ "artifacts": artifacts }))
            .map_err(|e| Error::Internal(format!("yaml render: {}", e))),
        ExportFormat::Markdown => Ok(render_markdown(artifacts)),
        ExportFormat::OpenApi => render_openapi(artifacts),
    }
}

/// Parse artifacts back out of an export.
pub fn parse(content: &str, format: ExportFormat) -> Result<Vec<ExportedArtifact>> {
    match format {
        ExportFormat::Json => {
            let doc: Value = serde_json::from_str(content)?;
            serde_json::from_value(doc["artifacts"].clone()).map_err(Error::from)
        }
        ExportFormat::Yaml => {
            let doc: Value = serde_yaml::from_str(content)
                .map_err(|e| Error::validation("content", format!("invalid yaml: {}", e)))?;
            serde_json::from_value(doc["artifacts"].clone()).map_err(Error::from)
        }
        ExportFormat::Markdown => parse_markdown(content),
        ExportFormat::OpenApi => Err(Error::validation(
            "format",
            "openapi exports are not re-importable",
        )),
    }
}

fn render_markdown(artifacts: &[ExportedArtifact]) -> String {
    let mut out = String::new();
    for artifact in artifacts {
        out.push_str("---\n");
        out.push_str(
            &serde_yaml::to_string(&json!({ "amem": artifact.sentinel }))
                .unwrap_or_default(),
        );
        out.push_str("---\n\n");
        out.push_str(&format!("# {}\n\n", artifact.name));
        if let Some(content) = artifact.payload["content"].as_str() {
            out.push_str(content);
            out.push('\n');
        } else if let Some(description) = artifact.payload["description"].as_str() {
            out.push_str(description);
            out.push('\n');
        }
        out.push_str("\n```json\n");
        out.push_str(
            &serde_json::to_string_pretty(&artifact.payload).unwrap_or_default(),
        );
        out.push_str("\n```\n\n");
    }
    out
}

/// A record starts only at a `---` fence whose next line opens the
/// sentinel mapping. Body text (which may contain `---` horizontal rules)
/// cannot forge a boundary.
fn is_record_start(lines: &[&str], idx: usize) -> bool {
    lines[idx].trim_end() == "---"
        && lines
            .get(idx + 1)
            .map(|line| line.starts_with("amem:"))
            .unwrap_or(false)
}

fn parse_markdown(content: &str) -> Result<Vec<ExportedArtifact>> {
    let lines: Vec<&str> = content.lines().collect();
    let mut artifacts = Vec::new();
    let mut idx = 0;

    while idx < lines.len() {
        if !is_record_start(&lines, idx) {
            idx += 1;
            continue;
        }

        // Front-matter runs to the closing fence
        let open = idx + 1;
        let mut close = open;
        while close < lines.len() && lines[close].trim_end() != "---" {
            close += 1;
        }
        if close == lines.len() {
            return Err(Error::validation("content", "unterminated front-matter"));
        }
        let front = lines[open..close].join("\n");
        let doc: Value = serde_yaml::from_str(&front)
            .map_err(|e| Error::validation("content", format!("invalid front-matter: {}", e)))?;
        let sentinel: ExportSentinel = serde_json::from_value(doc["amem"].clone())?;

        // Body runs to the next record start or end of document
        let mut end = close + 1;
        while end < lines.len() && !is_record_start(&lines, end) {
            end += 1;
        }
        let body = lines[close + 1..end].join("\n");

        let name = body
            .lines()
            .find_map(|line| line.strip_prefix("# "))
            .unwrap_or_default()
            .to_string();
        // The payload block is the last json fence of the record; escaped
        // newlines inside JSON strings cannot reproduce the closing fence
        let payload = body
            .rsplit_once("```json\n")
            .and_then(|(_, rest)| rest.split("\n```").next())
            .map(serde_json::from_str)
            .transpose()?
            .unwrap_or(Value::Null);

        artifacts.push(ExportedArtifact {
            sentinel,
            name,
            payload,
        });
        idx = end;
    }

    Ok(artifacts)
}

fn render_openapi(artifacts: &[ExportedArtifact]) -> Result<String> {
    let mut schemas = serde_json::Map::new();
    for artifact in artifacts {
        if artifact.sentinel.entry_type != EntryType::Tool {
            return Err(Error::validation(
                "format",
                "openapi export accepts tools only",
            ));
        }
        schemas.insert(
            artifact.name.clone(),
            json!({
                "type": "object",
                "description": artifact.payload["description"],
                "properties": artifact.payload["parameters"],
                "x-amem": artifact.sentinel,
            }),
        );
    }

    serde_json::to_string_pretty(&json!({
        "openapi": "3.0.3",
        "info": {
            "title": "Agent memory tools",
            "version": "1.0.0",
        },
        "paths": {},
        "components": { "schemas": schemas },
    }))
    .map_err(Error::from)
}
