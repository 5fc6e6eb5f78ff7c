// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;
use tracing::debug;

use crate::{team_config_path, IterationFile, TeamConfig};

/// Load `.team/team.json`, resolving any `$NAME` api-key reference.
pub fn load_team_config(team_dir: &Path, project_root: &Path) -> anyhow::Result<TeamConfig> {
    let path = team_config_path(team_dir);
    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("reading {}", path.display()))?;
    let mut config: TeamConfig =
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;

    if let Some(key) = config.model.api_key.take() {
        config.model.api_key = Some(resolve_api_key(&key, project_root));
    }
    Ok(config)
}

pub fn save_team_config(team_dir: &Path, config: &TeamConfig) -> anyhow::Result<()> {
    let path = team_config_path(team_dir);
    let text = serde_json::to_string_pretty(config)?;
    std::fs::write(&path, text + "\n").with_context(|| format!("writing {}", path.display()))
}

/// Load `.team/iteration.json`. A missing file is an empty iteration list.
pub fn load_iterations(team_dir: &Path) -> anyhow::Result<IterationFile> {
    let path = crate::iteration_file_path(team_dir);
    if !path.is_file() {
        return Ok(IterationFile::default());
    }
    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

/// Replace `.team/iteration.json` wholesale (whole-file write, crash-safe
/// for single-writer use).
pub fn save_iterations(team_dir: &Path, file: &IterationFile) -> anyhow::Result<()> {
    let path = crate::iteration_file_path(team_dir);
    let text = serde_json::to_string_pretty(file)?;
    std::fs::write(&path, text + "\n").with_context(|| format!("writing {}", path.display()))
}

/// Resolve an api-key value.
///
/// Values starting with `$` name a variable looked up in the project `.env`
/// file first and the process environment second. Unresolvable references
/// and literal keys pass through unchanged.
pub fn resolve_api_key(value: &str, project_root: &Path) -> String {
    let Some(name) = value.strip_prefix('$') else {
        return value.to_string();
    };

    let env_file = project_root.join(".env");
    if env_file.is_file() {
        if let Ok(text) = std::fs::read_to_string(&env_file) {
            let vars = parse_env_file(&text);
            if let Some(v) = vars.get(name) {
                debug!(name, "api key resolved from .env");
                return v.clone();
            }
        }
    }

    if let Ok(v) = std::env::var(name) {
        debug!(name, "api key resolved from process environment");
        return v;
    }

    value.to_string()
}

/// Minimal `.env` parser: `KEY=value` lines, `#` comments, optional
/// single/double quotes around the value.
fn parse_env_file(text: &str) -> HashMap<String, String> {
    let mut vars = HashMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        let mut value = value.trim();
        if value.len() >= 2
            && ((value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\'')))
        {
            value = &value[1..value.len() - 1];
        }
        vars.insert(key.to_string(), value.to_string());
    }
    vars
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
