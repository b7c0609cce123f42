//! `.env` loading for the runner root.
//!
//! The runner root comes from a first argument parse (flag or `RUNNER_ROOT`);
//! when its env files supply variables the arguments are parsed again so
//! clap's `env` fallbacks see them. Variables already present in the process
//! environment always win.

use std::path::Path;

use anyhow::{Context, Result};

use crate::Cli;

pub const ENV_FILE: &str = ".env";
pub const DEVELOPMENT_ENV_FILE: &str = ".env.development";
pub const APP_ENV_VAR: &str = "APP_ENV";

/// Parses one `KEY=value` line. Comments, blank lines and lines without a
/// key yield `None`; matching surrounding quotes are stripped.
pub fn parse_env_line(line: &str) -> Option<(String, String)> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let (key, value) = line.split_once('=')?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }
    let value = value.trim();
    let value = ['"', '\'']
        .iter()
        .find_map(|quote| {
            value
                .strip_prefix(*quote)
                .and_then(|rest| rest.strip_suffix(*quote))
        })
        .unwrap_or(value);
    Some((key.to_string(), value.to_string()))
}

pub fn parse_env_file(contents: &str) -> Vec<(String, String)> {
    contents.lines().filter_map(parse_env_line).collect()
}

/// Applies every variable of `path` that is not already set. Returns the
/// keys that were applied; a missing file applies nothing.
pub fn apply_env_file(path: &Path) -> Result<Vec<String>> {
    if !path.is_file() {
        return Ok(Vec::new());
    }
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let mut applied = Vec::new();
    for (key, value) in parse_env_file(&contents) {
        if std::env::var_os(&key).is_none() {
            std::env::set_var(&key, value);
            applied.push(key);
        }
    }
    Ok(applied)
}

/// Loads `<root>/.env`, then `<root>/.env.development` when
/// `APP_ENV=development`. Must run before any thread is spawned.
pub fn load_runner_env_files(root: &Path) -> Result<Vec<String>> {
    let mut applied = apply_env_file(&root.join(ENV_FILE))?;
    if std::env::var(APP_ENV_VAR).as_deref() == Ok("development") {
        applied.extend(apply_env_file(&root.join(DEVELOPMENT_ENV_FILE))?);
    }
    Ok(applied)
}

/// Parses the command line, loads the env files of the runner root it names
/// and re-parses when they applied anything. Must run before any thread is
/// spawned.
pub fn parse_cli_with_env_files(parse: impl Fn() -> Cli) -> Result<(Cli, Vec<String>)> {
    let preliminary = parse();
    let applied = load_runner_env_files(&preliminary.runner_root)?;
    if applied.is_empty() {
        return Ok((preliminary, applied));
    }
    Ok((parse(), applied))
}
