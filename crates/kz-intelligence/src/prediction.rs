use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::features::TaskCategory;

/// Result of a prediction operation.
///
/// Only `Ready` carries a value; every other variant says why there is none.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum Outcome<T> {
    Ready(T),
    /// The engine or this capability is switched off.
    Disabled,
    NotInitialized,
    /// A required credential or endpoint is missing.
    NotConfigured(String),
    /// The prediction scored below the configured threshold.
    Suppressed { confidence: f32, threshold: f32 },
    /// Model, network, or parse failure.
    Unavailable(String),
}

impl<T> Outcome<T> {
    pub fn into_option(self) -> Option<T> {
        match self {
            Outcome::Ready(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Outcome::Ready(_))
    }

    pub fn as_ref(&self) -> Option<&T> {
        match self {
            Outcome::Ready(value) => Some(value),
            _ => None,
        }
    }

    /// Short label used for metrics and logs.
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Ready(_) => "ready",
            Outcome::Disabled => "disabled",
            Outcome::NotInitialized => "not_initialized",
            Outcome::NotConfigured(_) => "not_configured",
            Outcome::Suppressed { .. } => "suppressed",
            Outcome::Unavailable(_) => "unavailable",
        }
    }
}

/// Something that carries a confidence score the engine can gate on.
pub trait Scored {
    fn confidence(&self) -> f32;
}

/// Apply the confidence gate: a value below `threshold` is suppressed.
pub fn gate<T: Scored>(value: T, threshold: f32) -> Outcome<T> {
    let confidence = value.confidence();
    if confidence >= threshold {
        Outcome::Ready(value)
    } else {
        tracing::debug!(confidence, threshold, "prediction suppressed below threshold");
        Outcome::Suppressed {
            confidence,
            threshold,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DurationPrediction {
    pub task_id: i64,
    pub estimated_minutes: u32,
    pub confidence: f32,
    pub factors: Vec<String>,
    pub created_at: DateTime<Utc>,
    /// `local-1.0.0` or `<provider>-api`.
    pub model_version: String,
}

impl Scored for DurationPrediction {
    fn confidence(&self) -> f32 {
        self.confidence
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryPrediction {
    pub task_id: i64,
    pub category: TaskCategory,
    pub confidence: f32,
    pub suggested_tags: Vec<String>,
    pub reasoning: String,
    pub created_at: DateTime<Utc>,
    pub model_version: String,
}

impl Scored for CategoryPrediction {
    fn confidence(&self) -> f32 {
        self.confidence
    }
}
