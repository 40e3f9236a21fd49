use std::path::Path;

use kz_core::Config;
use kz_intelligence::PredictiveEngine;

use super::{build_engine, load_tasks, print_json};

pub async fn run(config: &Config, tasks_path: &Path) -> anyhow::Result<PredictiveEngine> {
    let tasks = load_tasks(tasks_path)?;
    let engine = build_engine(config).await?;
    let insights = engine.generate_insights(&tasks).await;
    tracing::info!(tasks = tasks.len(), insights = insights.len(), "insights generated");
    print_json(&insights)?;
    Ok(engine)
}
