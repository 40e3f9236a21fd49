use std::path::Path;

use kz_core::Config;
use kz_intelligence::PredictiveEngine;
use serde_json::json;

use super::{build_engine, load_tasks, print_json, select};

/// Run `predict`: one duration outcome per task, printed as a JSON array.
pub async fn run(config: &Config, tasks_path: &Path, id: Option<i64>) -> anyhow::Result<PredictiveEngine> {
    let tasks = select(load_tasks(tasks_path)?, id)?;
    let engine = build_engine(config).await?;

    let mut results = Vec::with_capacity(tasks.len());
    for task in &tasks {
        let outcome = engine.predict_duration(task).await;
        results.push(json!({ "task_id": task.id, "title": task.title, "duration": outcome }));
    }
    print_json(&results)?;
    Ok(engine)
}
