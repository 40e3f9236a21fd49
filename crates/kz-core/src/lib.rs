//! Shared domain types, configuration, and persistence seams for the
//! Krigzis predictive insights engine.

pub mod artifact_store;
pub mod config;
pub mod types;

pub use artifact_store::{ArtifactError, ArtifactStore, FileArtifactStore, MemoryArtifactStore};
pub use config::{
    AiConfig, Config, ConfigError, FeatureFlags, PerformanceConfig, ProviderKind, RemoteConfig,
    RetrainingPolicy, TrainingConfig,
};
pub use types::{Task, TaskPriority, TaskStatus};
