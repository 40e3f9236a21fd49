use std::path::Path;

use kz_core::Config;
use kz_intelligence::{PredictiveEngine, TrainingOutcome};

use super::{build_engine, load_tasks, print_json};

/// Run `train`. A failed run is reported and turns into a non-zero exit.
pub async fn run(config: &Config, tasks_path: &Path, if_needed: bool) -> anyhow::Result<PredictiveEngine> {
    let tasks = load_tasks(tasks_path)?;
    let engine = build_engine(config).await?;

    let outcome = if if_needed {
        engine.maybe_retrain(&tasks).await
    } else {
        engine.train_models(&tasks).await
    };
    print_json(&outcome)?;

    if let TrainingOutcome::Failed(reason) = outcome {
        anyhow::bail!("training failed: {reason}");
    }
    Ok(engine)
}
