pub mod categorize;
pub mod config;
pub mod insights;
pub mod predict;
pub mod train;

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use kz_core::{Config, FileArtifactStore, Task};
use kz_intelligence::PredictiveEngine;

pub fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    let config = match path {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    };
    config.context("failed to load configuration")
}

/// Read a JSON array of tasks. Records whose status and `completed_at`
/// disagree are dropped with a warning.
pub fn load_tasks(path: &Path) -> anyhow::Result<Vec<Task>> {
    let text = std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    let tasks: Vec<Task> =
        serde_json::from_str(&text).with_context(|| format!("{} is not a JSON array of tasks", path.display()))?;
    let total = tasks.len();
    let tasks: Vec<Task> = tasks.into_iter().filter(Task::is_consistent).collect();
    if tasks.len() < total {
        tracing::warn!(dropped = total - tasks.len(), "skipping tasks with inconsistent completion state");
    }
    Ok(tasks)
}

/// Keep only the task with `id`, when one is requested.
pub fn select(tasks: Vec<Task>, id: Option<i64>) -> anyhow::Result<Vec<Task>> {
    let Some(id) = id else {
        return Ok(tasks);
    };
    let found: Vec<Task> = tasks.into_iter().filter(|t| t.id == id).collect();
    if found.is_empty() {
        anyhow::bail!("no task with id {id}");
    }
    Ok(found)
}

/// Engine over the configured model directory, already initialized.
pub async fn build_engine(config: &Config) -> anyhow::Result<PredictiveEngine> {
    let dir = &config.storage.model_dir;
    std::fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
    let engine = PredictiveEngine::with_default_transport(Arc::new(FileArtifactStore::new(dir)));
    engine.initialize(config.ai.clone()).await;
    Ok(engine)
}

pub fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_tasks_drops_inconsistent_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.json");
        std::fs::write(
            &path,
            r#"[
                {"id": 1, "title": "Comprar pão", "status": "today",
                 "created_at": "2024-05-01T10:00:00Z", "updated_at": "2024-05-01T10:00:00Z"},
                {"id": 2, "title": "Broken", "status": "done",
                 "created_at": "2024-05-01T10:00:00Z", "updated_at": "2024-05-01T10:00:00Z"}
            ]"#,
        )
        .unwrap();

        let tasks = load_tasks(&path).unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].id, 1);
    }

    #[test]
    fn load_tasks_rejects_non_arrays() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.json");
        std::fs::write(&path, r#"{"id": 1}"#).unwrap();
        assert!(load_tasks(&path).is_err());
    }

    #[test]
    fn select_by_id() {
        let tasks = vec![Task::new(1, "a"), Task::new(2, "b")];
        assert_eq!(select(tasks.clone(), Some(2)).unwrap()[0].title, "b");
        assert_eq!(select(tasks.clone(), None).unwrap().len(), 2);
        assert!(select(tasks, Some(9)).is_err());
    }
}
