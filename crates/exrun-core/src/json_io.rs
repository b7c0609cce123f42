use std::path::Path;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde_json::Value;

/// Reads and parses a JSON document from disk.
pub fn read_json_file(path: &Path) -> Result<Value> {
    read_json_file_as(path)
}

/// Reads a JSON document from disk into a typed value.
pub fn read_json_file_as<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let payload = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&payload)
        .with_context(|| format!("failed to parse JSON in {}", path.display()))
}
