// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::TASKS_FILE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Done,
    Blocked,
}

/// Planning output: one implementable unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub description: String,
    #[serde(default)]
    pub done_criteria: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<String>,
    #[serde(default = "default_status")]
    pub status: TaskStatus,
    /// Depth in the dependency DAG; derived, never hand-set.
    #[serde(default)]
    pub layer: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approach: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub anti_patterns: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requirements: Vec<String>,
    /// "Files to create" hints extracted after planning.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_by: Option<String>,
}

fn default_status() -> TaskStatus {
    TaskStatus::Pending
}

impl Task {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            done_criteria: String::new(),
            depends_on: Vec::new(),
            assigned_to: None,
            status: TaskStatus::Pending,
            layer: 0,
            approach: None,
            anti_patterns: Vec::new(),
            requirements: Vec::new(),
            notes: None,
            completion_summary: None,
            completed_by: None,
            blocked_reason: None,
            blocked_by: None,
        }
    }

    /// Actionable during implementation: neither done nor blocked.
    pub fn is_pending(&self) -> bool {
        self.status == TaskStatus::Pending
    }
}

#[derive(Debug, Error)]
pub enum LayerError {
    #[error("task '{task}' depends on unknown task '{dependency}'")]
    UnknownDependency { task: String, dependency: String },
    #[error("dependency cycle involving task '{0}'")]
    Cycle(String),
}

/// Compute the dependency layer of every task:
/// `layer(t) = 1 + max(layer(d))` over its dependencies, `0` with none.
///
/// Stable under reordering of the input. Cycles and unknown dependencies
/// are non-recoverable errors surfaced to the supervisor.
pub fn compute_layers(tasks: &[Task]) -> Result<HashMap<String, u32>, LayerError> {
    let by_id: HashMap<&str, &Task> = tasks.iter().map(|t| (t.id.as_str(), t)).collect();
    let mut layers: HashMap<String, u32> = HashMap::new();

    fn visit(
        id: &str,
        by_id: &HashMap<&str, &Task>,
        layers: &mut HashMap<String, u32>,
        in_progress: &mut Vec<String>,
    ) -> Result<u32, LayerError> {
        if let Some(layer) = layers.get(id) {
            return Ok(*layer);
        }
        if in_progress.iter().any(|p| p == id) {
            return Err(LayerError::Cycle(id.to_string()));
        }
        let task = by_id[id];
        in_progress.push(id.to_string());
        let mut layer = 0;
        for dep in &task.depends_on {
            if !by_id.contains_key(dep.as_str()) {
                return Err(LayerError::UnknownDependency {
                    task: id.to_string(),
                    dependency: dep.clone(),
                });
            }
            layer = layer.max(1 + visit(dep, by_id, layers, in_progress)?);
        }
        in_progress.pop();
        layers.insert(id.to_string(), layer);
        Ok(layer)
    }

    let mut in_progress = Vec::new();
    for task in tasks {
        visit(&task.id, &by_id, &mut layers, &mut in_progress)?;
    }
    Ok(layers)
}

/// The deepest layer present, or `None` with no tasks.
pub fn max_layer(tasks: &[Task]) -> Option<u32> {
    tasks.iter().map(|t| t.layer).max()
}

pub fn layer_tasks(tasks: &[Task], layer: u32) -> Vec<&Task> {
    tasks.iter().filter(|t| t.layer == layer).collect()
}

pub fn load_tasks(iter_dir: &Path) -> anyhow::Result<Vec<Task>> {
    let path = iter_dir.join(TASKS_FILE);
    let text =
        std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

/// Whole-file replacement; single writer per §concurrency model.
pub fn save_tasks(iter_dir: &Path, tasks: &[Task]) -> anyhow::Result<()> {
    let path = iter_dir.join(TASKS_FILE);
    let text = serde_json::to_string_pretty(tasks)?;
    std::fs::write(&path, text + "\n").with_context(|| format!("writing {}", path.display()))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str, deps: &[&str]) -> Task {
        let mut t = Task::new(id, format!("task {id}"));
        t.depends_on = deps.iter().map(|d| d.to_string()).collect();
        t
    }

    // ── Layer computation ─────────────────────────────────────────────────────

    #[test]
    fn no_deps_is_layer_zero() {
        let layers = compute_layers(&[task("t1", &[])]).unwrap();
        assert_eq!(layers["t1"], 0);
    }

    #[test]
    fn diamond_layers() {
        let tasks = [
            task("t1", &[]),
            task("t2", &["t1"]),
            task("t3", &["t1"]),
            task("t4", &["t2", "t3"]),
        ];
        let layers = compute_layers(&tasks).unwrap();
        assert_eq!(layers["t1"], 0);
        assert_eq!(layers["t2"], 1);
        assert_eq!(layers["t3"], 1);
        assert_eq!(layers["t4"], 2);
    }

    #[test]
    fn layer_is_one_plus_max_of_deps() {
        let tasks = [
            task("a", &[]),
            task("b", &["a"]),
            task("c", &["b"]),
            task("d", &["a", "c"]),
        ];
        let layers = compute_layers(&tasks).unwrap();
        assert_eq!(layers["d"], 3);
    }

    #[test]
    fn stable_under_reordering() {
        let mut tasks = vec![
            task("t1", &[]),
            task("t2", &["t1"]),
            task("t3", &["t1"]),
            task("t4", &["t2", "t3"]),
        ];
        let forward = compute_layers(&tasks).unwrap();
        tasks.reverse();
        let backward = compute_layers(&tasks).unwrap();
        assert_eq!(forward, backward);
    }

    #[test]
    fn cycle_is_an_error() {
        let tasks = [task("t1", &["t2"]), task("t2", &["t1"])];
        assert!(matches!(compute_layers(&tasks), Err(LayerError::Cycle(_))));
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        assert!(compute_layers(&[task("t1", &["t1"])]).is_err());
    }

    #[test]
    fn unknown_dependency_is_an_error() {
        let result = compute_layers(&[task("t1", &["ghost"])]);
        assert!(matches!(result, Err(LayerError::UnknownDependency { .. })));
    }

    // ── Persistence ───────────────────────────────────────────────────────────

    #[test]
    fn save_and_load_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let mut t = task("t1", &[]);
        t.assigned_to = Some("agent-1".into());
        t.anti_patterns = vec!["Do not use eval".into()];
        t.done_criteria = "tests pass".into();
        save_tasks(tmp.path(), &[t]).unwrap();
        let back = load_tasks(tmp.path()).unwrap();
        assert_eq!(back.len(), 1);
        assert_eq!(back[0].assigned_to.as_deref(), Some("agent-1"));
        assert_eq!(back[0].anti_patterns, vec!["Do not use eval"]);
        assert_eq!(back[0].status, TaskStatus::Pending);
    }

    #[test]
    fn optional_fields_omitted_in_json() {
        let tmp = tempfile::tempdir().unwrap();
        save_tasks(tmp.path(), &[task("t1", &[])]).unwrap();
        let text = std::fs::read_to_string(tmp.path().join(TASKS_FILE)).unwrap();
        assert!(!text.contains("completion_summary"));
        assert!(!text.contains("blocked_reason"));
        assert!(!text.contains("anti_patterns"));
    }

    #[test]
    fn done_task_keeps_completion_summary() {
        let tmp = tempfile::tempdir().unwrap();
        let mut t = task("t1", &[]);
        t.status = TaskStatus::Done;
        t.completion_summary = Some("implemented the parser".into());
        t.completed_by = Some("agent-1".into());
        save_tasks(tmp.path(), &[t]).unwrap();
        let back = load_tasks(tmp.path()).unwrap();
        assert_eq!(back[0].status, TaskStatus::Done);
        assert_eq!(
            back[0].completion_summary.as_deref(),
            Some("implemented the parser")
        );
    }

    // ── Filters ───────────────────────────────────────────────────────────────

    #[test]
    fn layer_filter_and_max() {
        let mut t1 = task("t1", &[]);
        let mut t2 = task("t2", &[]);
        t1.layer = 0;
        t2.layer = 2;
        let tasks = vec![t1, t2];
        assert_eq!(layer_tasks(&tasks, 0).len(), 1);
        assert_eq!(layer_tasks(&tasks, 1).len(), 0);
        assert_eq!(max_layer(&tasks), Some(2));
        assert_eq!(max_layer(&[]), None);
    }
}
