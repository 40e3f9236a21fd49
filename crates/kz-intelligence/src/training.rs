//! Training orchestration for the local models.
//!
//! At most one job runs at a time; a second caller is turned away instead of
//! queued. Fitting happens on copies of the live models inside a blocking
//! worker, and the copies only replace the live models once both artifacts
//! have been written.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Duration, Local, Utc};
use kz_core::{AiConfig, RetrainingPolicy, Task};
use kz_telemetry::MetricsCollector;
use ndarray::Array2;
use rand::rngs::SmallRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::features::{
    estimate_task_duration, extract_category_features, extract_duration_features_at, keyword_category,
    CATEGORY_COUNT, CATEGORY_FEATURES, DURATION_FEATURES,
};
use crate::nn::{Adam, ModelError, TrainingHistory};
use crate::runtime::{LocalModel, LocalModelRuntime, ModelKind, LEARNING_RATE};

pub const MIN_TRAINING_TASKS: usize = 10;
pub const MIN_DURATION_SAMPLES: usize = 5;
pub const MIN_CATEGORY_SAMPLES: usize = 10;

// ---------------------------------------------------------------------------
// Outcome types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    InsufficientData { tasks: usize, required: usize },
    AlreadyRunning,
    Disabled,
    NotInitialized,
    /// The retraining policy found nothing to do.
    UpToDate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelReport {
    pub samples: usize,
    pub epochs: usize,
    pub final_loss: Option<f32>,
    pub validation_loss: Option<f32>,
    /// MAE for duration, accuracy for category.
    pub validation_metric: Option<f32>,
}

impl ModelReport {
    fn from_history(samples: usize, history: &TrainingHistory) -> Self {
        Self {
            samples,
            epochs: history.epochs(),
            final_loss: history.final_loss(),
            validation_loss: history.final_val_loss(),
            validation_metric: history.final_val_metric(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingReport {
    pub duration: Option<ModelReport>,
    pub category: Option<ModelReport>,
    /// Category validation accuracy fell below the policy threshold.
    pub below_accuracy_threshold: bool,
    pub elapsed_ms: u64,
    pub trained_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum TrainingOutcome {
    Skipped(SkipReason),
    Completed(TrainingReport),
    Failed(String),
}

impl TrainingOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            TrainingOutcome::Skipped(_) => "skipped",
            TrainingOutcome::Completed(_) => "completed",
            TrainingOutcome::Failed(_) => "failed",
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, TrainingOutcome::Completed(_))
    }
}

// ---------------------------------------------------------------------------
// Training sets
// ---------------------------------------------------------------------------

/// Completed tasks as duration features, labelled with the heuristic estimate.
/// Time slots come from each task's creation time on the local clock.
pub fn duration_training_set(tasks: &[&Task]) -> (Array2<f32>, Array2<f32>) {
    let mut x = Array2::zeros((tasks.len(), DURATION_FEATURES));
    let mut y = Array2::zeros((tasks.len(), 1));
    for (i, task) in tasks.iter().enumerate() {
        let local = task.created_at.with_timezone(&Local).naive_local();
        for (j, v) in extract_duration_features_at(task, &local).into_iter().enumerate() {
            x[[i, j]] = v;
        }
        y[[i, 0]] = estimate_task_duration(task) as f32;
    }
    (x, y)
}

/// Completed tasks with a keyword match, one-hot labelled by that match.
pub fn category_training_set(tasks: &[&Task]) -> (Array2<f32>, Array2<f32>) {
    let labelled: Vec<(&Task, usize)> = tasks
        .iter()
        .filter_map(|t| keyword_category(t).map(|c| (*t, c.index())))
        .collect();
    let mut x = Array2::zeros((labelled.len(), CATEGORY_FEATURES));
    let mut y = Array2::zeros((labelled.len(), CATEGORY_COUNT));
    for (i, (task, class)) in labelled.iter().enumerate() {
        for (j, v) in extract_category_features(task).into_iter().enumerate() {
            x[[i, j]] = v;
        }
        y[[i, *class]] = 1.0;
    }
    (x, y)
}

fn fit_copy(
    model: &LocalModel,
    x: &Array2<f32>,
    y: &Array2<f32>,
    trained_at: DateTime<Utc>,
    rng: &mut SmallRng,
) -> Result<(LocalModel, ModelReport), ModelError> {
    let mut copy = model.clone();
    let kind = copy.kind;
    let history = copy.network.fit(
        x,
        y,
        kind.loss(),
        &mut Adam::new(LEARNING_RATE),
        &kind.fit_options(),
        rng,
    )?;
    copy.sample_count = x.nrows();
    copy.trained_at = Some(trained_at);
    tracing::info!(
        model = kind.as_str(),
        samples = x.nrows(),
        loss = ?history.final_loss(),
        val_metric = ?history.final_val_metric(),
        "model fitted"
    );
    Ok((copy, ModelReport::from_history(x.nrows(), &history)))
}

type Fitted = (Option<(LocalModel, ModelReport)>, Option<(LocalModel, ModelReport)>);

// ---------------------------------------------------------------------------
// TrainingOrchestrator
// ---------------------------------------------------------------------------

pub struct TrainingOrchestrator {
    lock: Mutex<()>,
    metrics: Arc<MetricsCollector>,
}

impl TrainingOrchestrator {
    pub fn new(metrics: Arc<MetricsCollector>) -> Self {
        Self {
            lock: Mutex::new(()),
            metrics,
        }
    }

    pub fn is_running(&self) -> bool {
        self.lock.try_lock().is_err()
    }

    pub async fn train(&self, runtime: &LocalModelRuntime, tasks: &[Task], config: &AiConfig) -> TrainingOutcome {
        let Ok(_guard) = self.lock.try_lock() else {
            tracing::debug!("training already running, skipping");
            let outcome = TrainingOutcome::Skipped(SkipReason::AlreadyRunning);
            self.metrics.record_training(outcome.label(), None);
            return outcome;
        };

        let started = Instant::now();
        let outcome = self.run(runtime, tasks, config, started).await;
        let secs = outcome.is_completed().then(|| started.elapsed().as_secs_f64());
        self.metrics.record_training(outcome.label(), secs);
        outcome
    }

    async fn run(
        &self,
        runtime: &LocalModelRuntime,
        tasks: &[Task],
        config: &AiConfig,
        started: Instant,
    ) -> TrainingOutcome {
        if tasks.len() < MIN_TRAINING_TASKS {
            return TrainingOutcome::Skipped(SkipReason::InsufficientData {
                tasks: tasks.len(),
                required: MIN_TRAINING_TASKS,
            });
        }

        let completed: Vec<&Task> = tasks.iter().filter(|t| t.is_done()).collect();
        let (dx, dy) = duration_training_set(&completed);
        let (cx, cy) = category_training_set(&completed);
        let train_duration = dx.nrows() >= MIN_DURATION_SAMPLES;
        let train_category = cx.nrows() >= MIN_CATEGORY_SAMPLES;
        if !train_duration && !train_category {
            return TrainingOutcome::Skipped(SkipReason::InsufficientData {
                tasks: completed.len(),
                required: MIN_DURATION_SAMPLES,
            });
        }

        let duration_model = runtime.duration_model().await;
        let category_model = runtime.category_model().await;
        let seed = config.training.seed;
        let trained_at = Utc::now();

        let worker = tokio::task::spawn_blocking(move || -> Result<Fitted, ModelError> {
            let mut rng = match seed {
                Some(seed) => SmallRng::seed_from_u64(seed),
                None => SmallRng::from_entropy(),
            };
            let duration = if train_duration {
                Some(fit_copy(&duration_model, &dx, &dy, trained_at, &mut rng)?)
            } else {
                None
            };
            let category = if train_category {
                Some(fit_copy(&category_model, &cx, &cy, trained_at, &mut rng)?)
            } else {
                None
            };
            Ok((duration, category))
        });

        let (duration, category) = match worker.await {
            Ok(Ok(fitted)) => fitted,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "model fitting failed");
                return TrainingOutcome::Failed(e.to_string());
            }
            Err(e) => {
                tracing::warn!(error = %e, "training worker aborted");
                return TrainingOutcome::Failed(format!("training worker aborted: {e}"));
            }
        };

        let (duration_model, duration_report) = duration.unzip();
        let (category_model, category_report) = category.unzip();

        let threshold = config.retraining.accuracy_threshold;
        let accuracy = category_report.as_ref().and_then(|r| r.validation_metric);
        let below_accuracy_threshold = accuracy.map_or(false, |a| a < threshold);
        if below_accuracy_threshold {
            tracing::warn!(
                accuracy = ?accuracy,
                threshold,
                "category accuracy below threshold, installing anyway"
            );
        }

        if let Err(e) = runtime.install(duration_model, category_model).await {
            tracing::warn!(error = %e, "persisting trained models failed, keeping previous models");
            return TrainingOutcome::Failed(e.to_string());
        }

        let report = TrainingReport {
            duration: duration_report,
            category: category_report,
            below_accuracy_threshold,
            elapsed_ms: started.elapsed().as_millis() as u64,
            trained_at,
        };
        tracing::info!(
            duration_samples = report.duration.as_ref().map(|r| r.samples),
            category_samples = report.category.as_ref().map(|r| r.samples),
            elapsed_ms = report.elapsed_ms,
            "training completed"
        );
        TrainingOutcome::Completed(report)
    }

    /// Retraining policy check.
    pub async fn needs_retraining(
        &self,
        runtime: &LocalModelRuntime,
        tasks: &[Task],
        policy: &RetrainingPolicy,
        now: DateTime<Utc>,
    ) -> bool {
        if !policy.auto_retrain {
            return false;
        }
        let duration = runtime.duration_model().await;
        let category = runtime.category_model().await;
        let trained: Vec<&LocalModel> = [duration.as_ref(), category.as_ref()]
            .into_iter()
            .filter(|m| m.is_trained())
            .collect();
        let last = trained.iter().filter_map(|m| m.trained_at).max();
        // The duration model sees every completed task; the category model
        // only the keyword-matched ones.
        let samples = trained.iter().map(|m| m.sample_count).max().unwrap_or(0);

        match last {
            None => tasks.len() >= MIN_TRAINING_TASKS,
            Some(trained_at) => {
                let completed = tasks.iter().filter(|t| t.is_done()).count();
                let grown = completed >= samples.saturating_add(policy.min_new_samples);
                let stale = now - trained_at > Duration::days(i64::from(policy.max_data_age_days));
                grown || stale
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
