//! Local model runtime: the duration regressor and the category classifier.
//!
//! Each model lives behind its own `RwLock<Arc<_>>`. Readers clone the `Arc`
//! and run inference on that snapshot; training works on copies and swaps new
//! snapshots in through [`LocalModelRuntime::install`], which persists first.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use kz_core::ArtifactStore;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::features::{TaskCategory, CATEGORY_COUNT, CATEGORY_FEATURES, DURATION_FEATURES};
use crate::nn::{argmax, Activation, FitOptions, LayerSpec, Loss, Metric, ModelError, Sequential};
use crate::IntelligenceError;

pub const DURATION_ARTIFACT: &str = "duration-model";
pub const CATEGORY_ARTIFACT: &str = "category-model";
pub const LOCAL_MODEL_VERSION: &str = "local-1.0.0";
pub const ARTIFACT_FORMAT_VERSION: u32 = 1;
pub const LEARNING_RATE: f32 = 1e-3;

/// Floor for locally predicted durations, in minutes.
pub const MIN_LOCAL_MINUTES: u32 = 5;

// ---------------------------------------------------------------------------
// ModelKind
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    Duration,
    Category,
}

impl ModelKind {
    pub fn artifact_name(self) -> &'static str {
        match self {
            ModelKind::Duration => DURATION_ARTIFACT,
            ModelKind::Category => CATEGORY_ARTIFACT,
        }
    }

    pub fn input_dim(self) -> usize {
        match self {
            ModelKind::Duration => DURATION_FEATURES,
            ModelKind::Category => CATEGORY_FEATURES,
        }
    }

    pub fn output_dim(self) -> usize {
        match self {
            ModelKind::Duration => 1,
            ModelKind::Category => CATEGORY_COUNT,
        }
    }

    pub fn architecture(self) -> Vec<LayerSpec> {
        match self {
            ModelKind::Duration => vec![
                LayerSpec::dense(64, Activation::Relu),
                LayerSpec::dropout(0.2),
                LayerSpec::dense(32, Activation::Relu),
                LayerSpec::dense(16, Activation::Relu),
                LayerSpec::dense(1, Activation::Linear),
            ],
            ModelKind::Category => vec![
                LayerSpec::dense(128, Activation::Relu),
                LayerSpec::dropout(0.3),
                LayerSpec::dense(64, Activation::Relu),
                LayerSpec::dense(32, Activation::Relu),
                LayerSpec::dense(CATEGORY_COUNT, Activation::Softmax),
            ],
        }
    }

    pub fn loss(self) -> Loss {
        match self {
            ModelKind::Duration => Loss::MeanSquaredError,
            ModelKind::Category => Loss::CategoricalCrossEntropy,
        }
    }

    pub fn fit_options(self) -> FitOptions {
        match self {
            ModelKind::Duration => FitOptions {
                epochs: 50,
                batch_size: 8,
                validation_split: 0.2,
                shuffle: true,
                metric: Metric::MeanAbsoluteError,
            },
            ModelKind::Category => FitOptions {
                epochs: 30,
                batch_size: 16,
                validation_split: 0.2,
                shuffle: true,
                metric: Metric::Accuracy,
            },
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ModelKind::Duration => "duration",
            ModelKind::Category => "category",
        }
    }
}

// ---------------------------------------------------------------------------
// LocalModel
// ---------------------------------------------------------------------------

/// Stored form of a model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub format_version: u32,
    pub kind: ModelKind,
    pub input_dim: usize,
    pub output_dim: usize,
    pub layout: Vec<LayerSpec>,
    pub sample_count: usize,
    pub trained_at: Option<DateTime<Utc>>,
    pub network: Sequential,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LocalModel {
    pub kind: ModelKind,
    pub network: Sequential,
    /// Samples seen by the last training run; zero for a fresh model.
    pub sample_count: usize,
    pub trained_at: Option<DateTime<Utc>>,
}

impl LocalModel {
    pub fn fresh<R: Rng + ?Sized>(kind: ModelKind, rng: &mut R) -> Result<Self, ModelError> {
        Ok(Self {
            kind,
            network: Sequential::new(kind.input_dim(), &kind.architecture(), rng)?,
            sample_count: 0,
            trained_at: None,
        })
    }

    pub fn is_trained(&self) -> bool {
        self.trained_at.is_some()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ModelError> {
        let artifact = ModelArtifact {
            format_version: ARTIFACT_FORMAT_VERSION,
            kind: self.kind,
            input_dim: self.network.input_dim(),
            output_dim: self.network.output_dim(),
            layout: self.network.specs(),
            sample_count: self.sample_count,
            trained_at: self.trained_at,
            network: self.network.clone(),
        };
        Ok(serde_json::to_vec(&artifact)?)
    }

    /// Decode an artifact and check it matches the architecture for `kind`.
    pub fn from_bytes(kind: ModelKind, bytes: &[u8]) -> Result<Self, ModelError> {
        let artifact: ModelArtifact = serde_json::from_slice(bytes)?;
        if artifact.format_version != ARTIFACT_FORMAT_VERSION {
            return Err(ModelError::IncompatibleArtifact(format!(
                "format version {} (expected {ARTIFACT_FORMAT_VERSION})",
                artifact.format_version
            )));
        }
        if artifact.kind != kind {
            return Err(ModelError::IncompatibleArtifact(format!(
                "holds a {} model, expected {}",
                artifact.kind.as_str(),
                kind.as_str()
            )));
        }
        let network = artifact.network;
        network.validate()?;
        let expected = kind.architecture();
        if network.input_dim() != kind.input_dim()
            || network.output_dim() != kind.output_dim()
            || network.specs() != expected
            || artifact.layout != expected
        {
            return Err(ModelError::IncompatibleArtifact(format!(
                "{} layout does not match the current architecture",
                kind.as_str()
            )));
        }
        Ok(Self {
            kind,
            network,
            sample_count: artifact.sample_count,
            trained_at: artifact.trained_at,
        })
    }
}

/// Confidence of a local duration estimate.
pub fn duration_confidence(features: &[f32], minutes: u32) -> f32 {
    let mean = if features.is_empty() {
        0.0
    } else {
        features.iter().sum::<f32>() / features.len() as f32
    };
    let scale = (minutes as f32 / 60.0).min(1.0);
    (0.7 * mean + 0.3 * scale).min(0.95)
}

/// Raw local estimate before the confidence gate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocalDuration {
    pub minutes: u32,
    pub confidence: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocalCategory {
    pub category: TaskCategory,
    pub confidence: f32,
}

// ---------------------------------------------------------------------------
// LocalModelRuntime
// ---------------------------------------------------------------------------

pub struct LocalModelRuntime {
    store: Arc<dyn ArtifactStore>,
    duration: RwLock<Arc<LocalModel>>,
    category: RwLock<Arc<LocalModel>>,
}

impl LocalModelRuntime {
    /// Load both models from `store`, creating fresh ones where no usable
    /// artifact exists.
    pub async fn load(store: Arc<dyn ArtifactStore>, seed: Option<u64>) -> Result<Self, ModelError> {
        let mut rng = match seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::from_entropy(),
        };
        let duration = load_or_create(store.as_ref(), ModelKind::Duration, &mut rng).await?;
        let category = load_or_create(store.as_ref(), ModelKind::Category, &mut rng).await?;
        Ok(Self {
            store,
            duration: RwLock::new(Arc::new(duration)),
            category: RwLock::new(Arc::new(category)),
        })
    }

    pub fn store(&self) -> &Arc<dyn ArtifactStore> {
        &self.store
    }

    pub async fn duration_model(&self) -> Arc<LocalModel> {
        self.duration.read().await.clone()
    }

    pub async fn category_model(&self) -> Arc<LocalModel> {
        self.category.read().await.clone()
    }

    pub async fn predict_duration(&self, features: &[f32]) -> Result<LocalDuration, ModelError> {
        let model = self.duration_model().await;
        let output = model
            .network
            .predict_one(features)?
            .first()
            .copied()
            .ok_or(ModelError::NonFinite)?;
        if !output.is_finite() {
            return Err(ModelError::NonFinite);
        }
        let minutes = output.round().max(MIN_LOCAL_MINUTES as f32) as u32;
        Ok(LocalDuration {
            minutes,
            confidence: duration_confidence(features, minutes),
        })
    }

    pub async fn predict_category(&self, features: &[f32]) -> Result<LocalCategory, ModelError> {
        let model = self.category_model().await;
        let probs = model.network.predict_one(features)?;
        if probs.iter().any(|p| !p.is_finite()) {
            return Err(ModelError::NonFinite);
        }
        let index = argmax(probs.iter().copied()).ok_or(ModelError::NonFinite)?;
        let category = TaskCategory::from_index(index).ok_or_else(|| ModelError::ShapeMismatch {
            expected: format!("{CATEGORY_COUNT} classes"),
            actual: format!("{} classes", probs.len()),
        })?;
        Ok(LocalCategory {
            category,
            confidence: probs[index],
        })
    }

    /// Persist the given models, then swap them in.
    ///
    /// Artifacts are written one after another. If a later write fails, the
    /// earlier ones are restored to their previous bytes and the in-memory
    /// models are left as they were.
    pub async fn install(
        &self,
        duration: Option<LocalModel>,
        category: Option<LocalModel>,
    ) -> Result<(), IntelligenceError> {
        let mut pending = Vec::new();
        for model in [duration, category].into_iter().flatten() {
            let bytes = model.to_bytes()?;
            pending.push((model, bytes));
        }

        let mut written: Vec<(&'static str, Option<Vec<u8>>)> = Vec::new();
        for (model, bytes) in &pending {
            let name = model.kind.artifact_name();
            let previous = match self.store.load(name).await {
                Ok(previous) => previous,
                Err(e) => {
                    self.rollback(&written).await;
                    return Err(e.into());
                }
            };
            if let Err(e) = self.store.save(name, bytes).await {
                self.rollback(&written).await;
                return Err(e.into());
            }
            written.push((name, previous));
        }

        for (model, _) in pending {
            let slot = match model.kind {
                ModelKind::Duration => &self.duration,
                ModelKind::Category => &self.category,
            };
            *slot.write().await = Arc::new(model);
        }
        Ok(())
    }

    async fn rollback(&self, written: &[(&'static str, Option<Vec<u8>>)]) {
        for (name, previous) in written.iter().rev() {
            let restored = match previous {
                Some(bytes) => self.store.save(name, bytes).await,
                None => self.store.remove(name).await.map(|_| ()),
            };
            match restored {
                Ok(()) => tracing::warn!(artifact = *name, "rolled back artifact after failed install"),
                Err(e) => tracing::warn!(artifact = *name, error = %e, "artifact rollback failed"),
            }
        }
    }
}

async fn load_or_create(
    store: &dyn ArtifactStore,
    kind: ModelKind,
    rng: &mut SmallRng,
) -> Result<LocalModel, ModelError> {
    let name = kind.artifact_name();
    match store.load(name).await {
        Ok(Some(bytes)) => match LocalModel::from_bytes(kind, &bytes) {
            Ok(model) => {
                tracing::info!(
                    artifact = name,
                    samples = model.sample_count,
                    trained_at = ?model.trained_at,
                    "loaded local model"
                );
                return Ok(model);
            }
            Err(e) => {
                tracing::warn!(artifact = name, error = %e, "unusable model artifact, starting fresh");
            }
        },
        Ok(None) => {}
        Err(e) => {
            tracing::warn!(artifact = name, error = %e, "could not read model artifact, starting fresh");
        }
    }
    let model = LocalModel::fresh(kind, rng)?;
    tracing::info!(artifact = name, "created fresh local model");
    Ok(model)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use kz_core::MemoryArtifactStore;

    fn seeded() -> SmallRng {
        SmallRng::seed_from_u64(11)
    }

    #[test]
    fn confidence_formula_is_capped() {
        assert!((duration_confidence(&[0.5; 10], 30) - 0.5).abs() < 1e-6);
        assert!((duration_confidence(&[1.0; 10], 120) - 0.95).abs() < 1e-6);
        assert!((duration_confidence(&[0.0; 10], 6) - 0.03).abs() < 1e-6);
    }

    #[test]
    fn artifact_roundtrip_keeps_metadata() {
        let mut model = LocalModel::fresh(ModelKind::Category, &mut seeded()).unwrap();
        model.sample_count = 42;
        model.trained_at = Some(Utc::now());
        let back = LocalModel::from_bytes(ModelKind::Category, &model.to_bytes().unwrap()).unwrap();
        assert_eq!(back.sample_count, 42);
        assert_eq!(back.trained_at, model.trained_at);
        assert_eq!(back.network.specs(), ModelKind::Category.architecture());
    }

    #[test]
    fn wrong_kind_is_incompatible() {
        let model = LocalModel::fresh(ModelKind::Duration, &mut seeded()).unwrap();
        let err = LocalModel::from_bytes(ModelKind::Category, &model.to_bytes().unwrap()).unwrap_err();
        assert!(matches!(err, ModelError::IncompatibleArtifact(_)));
    }

    #[tokio::test]
    async fn corrupt_artifact_falls_back_to_fresh_model() {
        let store = Arc::new(MemoryArtifactStore::new());
        store.insert(DURATION_ARTIFACT, b"{ not json".to_vec());
        let runtime = LocalModelRuntime::load(store.clone(), Some(1)).await.unwrap();

        assert!(!runtime.duration_model().await.is_trained());
        // The stored bytes are left alone until the next install.
        assert_eq!(store.get(DURATION_ARTIFACT).unwrap(), b"{ not json");
    }

    #[tokio::test]
    async fn predictions_respect_floors_and_bounds() {
        let store = Arc::new(MemoryArtifactStore::new());
        let runtime = LocalModelRuntime::load(store, Some(3)).await.unwrap();

        let d = runtime.predict_duration(&[0.1; DURATION_FEATURES]).await.unwrap();
        assert!(d.minutes >= MIN_LOCAL_MINUTES);
        assert!((0.0..=0.95).contains(&d.confidence));

        let c = runtime.predict_category(&[0.0; CATEGORY_FEATURES]).await.unwrap();
        assert!(c.confidence > 0.0 && c.confidence <= 1.0);
        assert!(runtime.predict_duration(&[0.1; 3]).await.is_err());
    }

    #[tokio::test]
    async fn same_seed_gives_identical_models() {
        let a = LocalModelRuntime::load(Arc::new(MemoryArtifactStore::new()), Some(9)).await.unwrap();
        let b = LocalModelRuntime::load(Arc::new(MemoryArtifactStore::new()), Some(9)).await.unwrap();
        assert_eq!(*a.duration_model().await, *b.duration_model().await);
        assert_eq!(*a.category_model().await, *b.category_model().await);
    }

    #[tokio::test]
    async fn install_persists_then_swaps() {
        let store = Arc::new(MemoryArtifactStore::new());
        let runtime = LocalModelRuntime::load(store.clone(), Some(5)).await.unwrap();

        let mut trained = (*runtime.duration_model().await).clone();
        trained.sample_count = 12;
        trained.trained_at = Some(Utc::now());
        runtime.install(Some(trained.clone()), None).await.unwrap();

        assert_eq!(*runtime.duration_model().await, trained);
        let stored = LocalModel::from_bytes(
            ModelKind::Duration,
            &store.get(DURATION_ARTIFACT).unwrap(),
        )
        .unwrap();
        assert_eq!(stored.sample_count, 12);
    }

    #[tokio::test]
    async fn failed_second_write_restores_first_artifact() {
        let store = Arc::new(MemoryArtifactStore::new());
        let runtime = LocalModelRuntime::load(store.clone(), Some(5)).await.unwrap();
        let mut old = (*runtime.duration_model().await).clone();
        old.trained_at = Some(Utc::now());
        runtime.install(Some(old.clone()), None).await.unwrap();
        let old_bytes = store.get(DURATION_ARTIFACT).unwrap();
        let old_category = runtime.category_model().await;

        store.fail_saves_for(CATEGORY_ARTIFACT);
        let mut dur = old.clone();
        dur.sample_count = 99;
        let mut cat = (*old_category).clone();
        cat.sample_count = 99;
        assert!(runtime.install(Some(dur), Some(cat)).await.is_err());

        assert_eq!(store.get(DURATION_ARTIFACT).unwrap(), old_bytes);
        assert!(store.get(CATEGORY_ARTIFACT).is_none());
        assert_eq!(*runtime.duration_model().await, old);
        assert_eq!(*runtime.category_model().await, *old_category);
    }
}
