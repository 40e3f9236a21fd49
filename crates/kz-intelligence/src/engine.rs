//! `PredictiveEngine`: the façade the host application talks to.
//!
//! Nothing here returns an error to the caller. Failures become typed
//! outcomes and a log line; the engine keeps serving afterwards.

use std::sync::Arc;

use chrono::{Local, NaiveDateTime, Utc};
use kz_core::{AiConfig, ArtifactStore, Task};
use kz_telemetry::{MetricsCollector, PredictionKind};
use tokio::sync::{Mutex, RwLock};

use crate::features::{
    category_reasoning, duration_factors, extract_category_features, extract_duration_features_at,
    suggested_tags,
};
use crate::insights::{AiInsight, InsightGenerator};
use crate::prediction::{gate, CategoryPrediction, DurationPrediction, Outcome};
use crate::providers::{HttpTransport, ProviderError, ReqwestTransport};
use crate::router::{ProviderRouter, Route};
use crate::runtime::{LocalModelRuntime, LOCAL_MODEL_VERSION};
use crate::training::{SkipReason, TrainingOrchestrator, TrainingOutcome};
use crate::IntelligenceError;

pub struct PredictiveEngine {
    store: Arc<dyn ArtifactStore>,
    config: RwLock<Option<Arc<AiConfig>>>,
    runtime: RwLock<Option<Arc<LocalModelRuntime>>>,
    init_lock: Mutex<()>,
    router: ProviderRouter,
    trainer: TrainingOrchestrator,
    insights: InsightGenerator,
    metrics: Arc<MetricsCollector>,
}

impl PredictiveEngine {
    pub fn new(store: Arc<dyn ArtifactStore>, transport: Arc<dyn HttpTransport>) -> Self {
        Self::with_metrics(store, transport, Arc::new(MetricsCollector::new()))
    }

    /// Engine that sends remote calls through reqwest.
    pub fn with_default_transport(store: Arc<dyn ArtifactStore>) -> Self {
        Self::new(store, Arc::new(ReqwestTransport::new()))
    }

    pub fn with_metrics(
        store: Arc<dyn ArtifactStore>,
        transport: Arc<dyn HttpTransport>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            store,
            config: RwLock::new(None),
            runtime: RwLock::new(None),
            init_lock: Mutex::new(()),
            router: ProviderRouter::new(transport, metrics.clone()),
            trainer: TrainingOrchestrator::new(metrics.clone()),
            insights: InsightGenerator::new(),
            metrics,
        }
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    pub async fn config(&self) -> Option<Arc<AiConfig>> {
        self.config.read().await.clone()
    }

    pub async fn is_initialized(&self) -> bool {
        self.config.read().await.is_some()
    }

    /// Install `config` and, on the first enabled call, load the local models.
    /// Calling it again is harmless.
    pub async fn initialize(&self, config: AiConfig) {
        self.apply_config(config, "engine initialized").await;
    }

    /// Swap the configuration. In-flight calls keep the snapshot they took.
    pub async fn update_config(&self, config: AiConfig) {
        self.apply_config(config, "configuration updated").await;
    }

    async fn apply_config(&self, config: AiConfig, message: &str) {
        let _init = self.init_lock.lock().await;
        let enabled = config.enabled;
        let provider = config.selected_provider;
        let seed = config.training.seed;
        *self.config.write().await = Some(Arc::new(config));

        if enabled && self.runtime.read().await.is_none() {
            match LocalModelRuntime::load(self.store.clone(), seed).await {
                Ok(runtime) => *self.runtime.write().await = Some(Arc::new(runtime)),
                Err(e) => tracing::warn!(error = %e, "local models unavailable"),
            }
        }
        tracing::info!(enabled, provider = %provider, "{message}");
    }

    /// The loaded local models, once an enabled configuration has been applied.
    pub async fn local_runtime(&self) -> Option<Arc<LocalModelRuntime>> {
        self.runtime.read().await.clone()
    }

    // -- Predictions ---------------------------------------------------------

    pub async fn predict_duration(&self, task: &Task) -> Outcome<DurationPrediction> {
        self.predict_duration_at(task, Local::now().naive_local()).await
    }

    /// Like [`predict_duration`](Self::predict_duration) with an explicit
    /// local time for the hour and weekday features.
    pub async fn predict_duration_at(&self, task: &Task, local_time: NaiveDateTime) -> Outcome<DurationPrediction> {
        let Some(config) = self.config().await else {
            return Outcome::NotInitialized;
        };
        let route = ProviderRouter::route(&config);
        let outcome = self.duration_outcome(&config, route, task, local_time).await;
        self.metrics
            .record_prediction(PredictionKind::Duration, route.provider_label(), outcome.label());
        outcome
    }

    async fn duration_outcome(
        &self,
        config: &AiConfig,
        route: Route,
        task: &Task,
        local_time: NaiveDateTime,
    ) -> Outcome<DurationPrediction> {
        if !config.enabled || !config.features.duration_prediction {
            return Outcome::Disabled;
        }
        let result = match route {
            Route::Local => {
                let Some(runtime) = self.local_runtime().await else {
                    return Outcome::NotInitialized;
                };
                let features = extract_duration_features_at(task, &local_time);
                runtime
                    .predict_duration(&features)
                    .await
                    .map(|local| DurationPrediction {
                        task_id: task.id,
                        estimated_minutes: local.minutes,
                        confidence: local.confidence,
                        factors: duration_factors(task),
                        created_at: Utc::now(),
                        model_version: LOCAL_MODEL_VERSION.to_string(),
                    })
                    .map_err(IntelligenceError::from)
            }
            Route::Remote(provider) => self
                .router
                .remote_duration(provider, config, task)
                .await
                .map_err(IntelligenceError::from),
        };
        resolve(result, config.performance.confidence_threshold, task, "duration")
    }

    pub async fn predict_category(&self, task: &Task) -> Outcome<CategoryPrediction> {
        let Some(config) = self.config().await else {
            return Outcome::NotInitialized;
        };
        let route = ProviderRouter::route(&config);
        let outcome = self.category_outcome(&config, route, task).await;
        self.metrics
            .record_prediction(PredictionKind::Category, route.provider_label(), outcome.label());
        outcome
    }

    async fn category_outcome(&self, config: &AiConfig, route: Route, task: &Task) -> Outcome<CategoryPrediction> {
        if !config.enabled || !config.features.categorization {
            return Outcome::Disabled;
        }
        let result = match route {
            Route::Local => {
                let Some(runtime) = self.local_runtime().await else {
                    return Outcome::NotInitialized;
                };
                let features = extract_category_features(task);
                runtime
                    .predict_category(&features)
                    .await
                    .map(|local| CategoryPrediction {
                        task_id: task.id,
                        category: local.category,
                        confidence: local.confidence,
                        suggested_tags: suggested_tags(task, local.category),
                        reasoning: category_reasoning(task, local.category),
                        created_at: Utc::now(),
                        model_version: LOCAL_MODEL_VERSION.to_string(),
                    })
                    .map_err(IntelligenceError::from)
            }
            Route::Remote(provider) => self
                .router
                .remote_category(provider, config, task)
                .await
                .map_err(IntelligenceError::from),
        };
        resolve(result, config.performance.confidence_threshold, task, "category")
    }

    // -- Insights ------------------------------------------------------------

    pub async fn generate_insights(&self, tasks: &[Task]) -> Vec<AiInsight> {
        let Some(config) = self.config().await else {
            return Vec::new();
        };
        if !config.enabled || !config.features.insight_generation {
            return Vec::new();
        }
        self.insights.generate(tasks, &config.features)
    }

    // -- Training ------------------------------------------------------------

    pub async fn train_models(&self, tasks: &[Task]) -> TrainingOutcome {
        match self.training_context().await {
            Ok((config, runtime)) => self.trainer.train(&runtime, tasks, &config).await,
            Err(reason) => TrainingOutcome::Skipped(reason),
        }
    }

    /// Train only when the retraining policy asks for it.
    pub async fn maybe_retrain(&self, tasks: &[Task]) -> TrainingOutcome {
        let (config, runtime) = match self.training_context().await {
            Ok(ctx) => ctx,
            Err(reason) => return TrainingOutcome::Skipped(reason),
        };
        if !self
            .trainer
            .needs_retraining(&runtime, tasks, &config.retraining, Utc::now())
            .await
        {
            return TrainingOutcome::Skipped(SkipReason::UpToDate);
        }
        self.trainer.train(&runtime, tasks, &config).await
    }

    async fn training_context(&self) -> Result<(Arc<AiConfig>, Arc<LocalModelRuntime>), SkipReason> {
        let config = self.config().await.ok_or(SkipReason::NotInitialized)?;
        if !config.enabled {
            return Err(SkipReason::Disabled);
        }
        let runtime = self.local_runtime().await.ok_or(SkipReason::NotInitialized)?;
        Ok((config, runtime))
    }
}

/// Map a raw prediction result onto an outcome, applying the confidence gate.
fn resolve<T: crate::prediction::Scored>(
    result: Result<T, IntelligenceError>,
    threshold: f32,
    task: &Task,
    kind: &str,
) -> Outcome<T> {
    match result {
        Ok(value) => gate(value, threshold),
        Err(IntelligenceError::Provider(ProviderError::NotConfigured(reason))) => {
            tracing::debug!(task_id = task.id, kind, %reason, "remote provider not configured");
            Outcome::NotConfigured(reason)
        }
        Err(e) => {
            tracing::warn!(task_id = task.id, kind, error = %e, "prediction unavailable");
            Outcome::Unavailable(e.to_string())
        }
    }
}
