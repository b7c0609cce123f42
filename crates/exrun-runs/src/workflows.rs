//! Read-only access to workflow definitions stored as JSON files.

use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;

use exrun_core::read_json_file;

const UNTITLED_WORKFLOW: &str = "untitled";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorkflowError {
    #[error("Invalid workflow file")]
    InvalidReference,
    #[error("workflowFile not found")]
    NotFound,
    #[error("workflowFile is not valid JSON: {0}")]
    Malformed(String),
    #[error("workflowFile could not be read: {0}")]
    Unreadable(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowListing {
    pub file: String,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct WorkflowLibrary {
    dir: PathBuf,
}

impl WorkflowLibrary {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Reads `<dir>/<file_ref>`. References must name a `.json` file inside
    /// the library directory.
    pub fn resolve(&self, file_ref: &str) -> Result<Value, WorkflowError> {
        let file_ref = file_ref.trim();
        if !file_ref.ends_with(".json") {
            return Err(WorkflowError::InvalidReference);
        }
        let relative = Path::new(file_ref);
        if !relative
            .components()
            .all(|component| matches!(component, Component::Normal(_)))
        {
            return Err(WorkflowError::InvalidReference);
        }
        let path = self.dir.join(relative);
        if !path.is_file() {
            return Err(WorkflowError::NotFound);
        }
        read_json_file(&path).map_err(|error| WorkflowError::Malformed(format!("{error:#}")))
    }

    /// [`Self::resolve`] on the blocking pool, for callers on the runtime.
    pub async fn resolve_blocking(&self, file_ref: &str) -> Result<Value, WorkflowError> {
        let library = self.clone();
        let file_ref = file_ref.to_string();
        tokio::task::spawn_blocking(move || library.resolve(&file_ref))
            .await
            .unwrap_or_else(|error| Err(WorkflowError::Unreadable(error.to_string())))
    }

    /// Lists every top-level `.json` file, sorted by file name. Files that do
    /// not parse are skipped.
    pub fn list(&self) -> Vec<WorkflowListing> {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        let mut files = entries
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().map(|kind| kind.is_file()).unwrap_or(false))
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .filter(|file| file.ends_with(".json"))
            .collect::<Vec<_>>();
        files.sort();
        files
            .into_iter()
            .filter_map(|file| match read_json_file(&self.dir.join(&file)) {
                Ok(definition) => Some(WorkflowListing {
                    name: workflow_name(&definition),
                    file,
                }),
                Err(error) => {
                    tracing::debug!(file = %file, error = %format!("{error:#}"), "skipping unreadable workflow");
                    None
                }
            })
            .collect()
    }
}

pub fn workflow_name(definition: &Value) -> String {
    definition
        .get("name")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .unwrap_or(UNTITLED_WORKFLOW)
        .to_string()
}

/// Builds `{name, nodes:[{id, label, rawLabel}]}` from `drawflow.nodes`.
///
/// `drawflow` may be embedded as a JSON string; nodes may be an array or an
/// id-keyed object. Labels prefer the block's description.
pub fn workflow_meta(definition: &Value) -> Value {
    let drawflow = match definition.get("drawflow") {
        Some(Value::String(raw)) => serde_json::from_str::<Value>(raw).unwrap_or(Value::Null),
        Some(value) => value.clone(),
        None => Value::Null,
    };
    let nodes = match drawflow.get("nodes") {
        Some(Value::Array(nodes)) => nodes.iter().filter_map(node_meta).collect::<Vec<_>>(),
        Some(Value::Object(nodes)) => nodes.values().filter_map(node_meta).collect(),
        _ => Vec::new(),
    };
    json!({ "name": workflow_name(definition), "nodes": nodes })
}

fn node_meta(node: &Value) -> Option<Value> {
    let id = match node.get("id")? {
        Value::String(id) => id.clone(),
        Value::Number(id) => id.to_string(),
        _ => return None,
    };
    let raw_label = node
        .get("label")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let label = node
        .get("data")
        .and_then(|data| data.get("description"))
        .and_then(Value::as_str)
        .filter(|description| !description.trim().is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| raw_label.clone());
    let mut meta = Map::new();
    meta.insert("id".to_string(), Value::String(id));
    meta.insert("label".to_string(), Value::String(label));
    meta.insert("rawLabel".to_string(), Value::String(raw_label));
    Some(Value::Object(meta))
}
