//! Predictive insights for Krigzis tasks.
//!
//! - **Features**: task records to fixed-length vectors, plus the heuristic
//!   labels, factors, and tags derived from the same keyword tables.
//! - **Local models**: a duration regressor and a category classifier on
//!   the small `nn` runtime, persisted through an `ArtifactStore`.
//! - **Providers**: OpenAI, Gemini, and custom HTTP backends behind one
//!   trait, with defensive reply parsing.
//! - **Insights**: productivity, timing, and burnout heuristics.
//! - **Training**: single-flight retraining with atomic installs.
//!
//! [`PredictiveEngine`] ties these together for the host application.

pub mod engine;
pub mod features;
pub mod insights;
pub mod nn;
pub mod parsing;
pub mod prediction;
pub mod prompts;
pub mod providers;
pub mod router;
pub mod runtime;
pub mod training;

pub use engine::PredictiveEngine;
pub use features::TaskCategory;
pub use insights::{AiInsight, InsightGenerator, InsightType};
pub use prediction::{CategoryPrediction, DurationPrediction, Outcome};
pub use providers::{HttpTransport, InferenceBackend, MockTransport, ProviderError, RemoteProvider, ReqwestTransport};
pub use router::{ProviderRouter, Route};
pub use runtime::{LocalModelRuntime, ModelKind, CATEGORY_ARTIFACT, DURATION_ARTIFACT, LOCAL_MODEL_VERSION};
pub use training::{SkipReason, TrainingOrchestrator, TrainingOutcome, TrainingReport};

/// Errors raised inside the engine. The public engine API turns these into
/// outcomes; they surface directly only from the lower-level components.
#[derive(Debug, thiserror::Error)]
pub enum IntelligenceError {
    #[error("artifact store: {0}")]
    Artifact(#[from] kz_core::ArtifactError),

    #[error("model: {0}")]
    Model(#[from] nn::ModelError),

    #[error("provider: {0}")]
    Provider(#[from] ProviderError),
}
