use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration loaded from `~/.krigzis/config.toml`.
///
/// Every section and field has a default, so an empty file (or no file at
/// all) yields a working local-only setup.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub ai: AiConfig,
}

impl Config {
    /// Load config from `~/.krigzis/config.toml`, falling back to defaults
    /// when the file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(path)
        } else {
            let cfg = Config::default();
            cfg.validate()?;
            Ok(cfg)
        }
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let cfg: Config = toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        self.validate()?;
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.ai.validate()
    }

    pub fn default_path() -> PathBuf {
        home_dir().join("config.toml")
    }
}

fn home_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".krigzis")
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("validation: {0}")]
    Validation(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Emit JSON log lines instead of the human-readable format.
    #[serde(default)]
    pub json_logs: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logs: false,
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding the `duration-model` and `category-model` artifacts.
    #[serde(default = "default_model_dir")]
    pub model_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            model_dir: default_model_dir(),
        }
    }
}

fn default_model_dir() -> PathBuf {
    home_dir().join("models")
}

// ---------------------------------------------------------------------------
// AiConfig
// ---------------------------------------------------------------------------

/// Which backend serves prediction requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    #[default]
    Local,
    OpenAi,
    Gemini,
    Custom,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Local => "local",
            ProviderKind::OpenAi => "openai",
            ProviderKind::Gemini => "gemini",
            ProviderKind::Custom => "custom",
        }
    }

    pub fn requires_api_key(&self) -> bool {
        matches!(self, ProviderKind::OpenAi | ProviderKind::Gemini)
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Engine configuration. Supplied at initialization and hot-swappable.
///
/// `api_key` may be stored inline, but `api_key_env` is preferred: it names
/// an environment variable that is read each time a remote call is made.
#[derive(Clone, Serialize, Deserialize)]
pub struct AiConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub selected_provider: ProviderKind,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub api_url: Option<String>,
    /// Remote model id; each provider has its own default.
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub features: FeatureFlags,
    #[serde(default)]
    pub performance: PerformanceConfig,
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub retraining: RetrainingPolicy,
    #[serde(default)]
    pub training: TrainingConfig,
}

impl std::fmt::Debug for AiConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AiConfig")
            .field("enabled", &self.enabled)
            .field("selected_provider", &self.selected_provider)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("api_key_env", &self.api_key_env)
            .field("api_url", &self.api_url)
            .field("model", &self.model)
            .field("features", &self.features)
            .field("performance", &self.performance)
            .field("remote", &self.remote)
            .field("retraining", &self.retraining)
            .field("training", &self.training)
            .finish()
    }
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            selected_provider: ProviderKind::Local,
            api_key: None,
            api_key_env: None,
            api_url: None,
            model: None,
            features: FeatureFlags::default(),
            performance: PerformanceConfig::default(),
            remote: RemoteConfig::default(),
            retraining: RetrainingPolicy::default(),
            training: TrainingConfig::default(),
        }
    }
}

impl AiConfig {
    /// A config that routes everything to the local models.
    pub fn local() -> Self {
        Self::default()
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn with_provider(mut self, provider: ProviderKind) -> Self {
        self.selected_provider = provider;
        self
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_api_url(mut self, url: impl Into<String>) -> Self {
        self.api_url = Some(url.into());
        self
    }

    pub fn with_confidence_threshold(mut self, threshold: f32) -> Self {
        self.performance.confidence_threshold = threshold;
        self
    }

    pub const PRESETS: [&'static str; 4] = [
        "privacy-focused",
        "performance-optimized",
        "advanced-ai",
        "gemini-ai",
    ];

    /// A named starting configuration, or `None` for an unknown name.
    /// The remote presets still need an API key.
    pub fn preset(name: &str) -> Option<Self> {
        let mut cfg = Self::default();
        match name {
            "privacy-focused" => {
                cfg.performance = PerformanceConfig {
                    confidence_threshold: 0.7,
                    max_latency_ms: 100,
                    batch_size: 10,
                };
            }
            "performance-optimized" => {
                cfg.performance = PerformanceConfig {
                    confidence_threshold: 0.8,
                    max_latency_ms: 50,
                    batch_size: 20,
                };
            }
            "advanced-ai" => cfg.selected_provider = ProviderKind::OpenAi,
            "gemini-ai" => cfg.selected_provider = ProviderKind::Gemini,
            _ => return None,
        }
        Some(cfg)
    }

    /// Inline key first, then the configured environment variable.
    /// Empty strings count as absent.
    pub fn resolve_api_key(&self) -> Option<String> {
        if let Some(key) = self.api_key.as_ref().filter(|k| !k.trim().is_empty()) {
            return Some(key.clone());
        }
        self.api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|k| !k.trim().is_empty())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let threshold = self.performance.confidence_threshold;
        if !(0.0..=1.0).contains(&threshold) || threshold.is_nan() {
            return Err(ConfigError::Validation(format!(
                "ai.performance.confidence_threshold must be within [0, 1], got {threshold}"
            )));
        }
        if self.performance.batch_size == 0 {
            return Err(ConfigError::Validation(
                "ai.performance.batch_size must be positive".into(),
            ));
        }
        let accuracy = self.retraining.accuracy_threshold;
        if !(0.0..=1.0).contains(&accuracy) || accuracy.is_nan() {
            return Err(ConfigError::Validation(format!(
                "ai.retraining.accuracy_threshold must be within [0, 1], got {accuracy}"
            )));
        }
        if self.selected_provider == ProviderKind::Custom
            && self.api_url.as_deref().map(str::trim).unwrap_or("").is_empty()
        {
            return Err(ConfigError::Validation(
                "ai.api_url is required when selected_provider = \"custom\"".into(),
            ));
        }
        Ok(())
    }
}

/// Per-capability switches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureFlags {
    #[serde(default = "default_true")]
    pub duration_prediction: bool,
    #[serde(default = "default_true")]
    pub categorization: bool,
    #[serde(default = "default_true")]
    pub insight_generation: bool,
    #[serde(default = "default_true")]
    pub productivity_analysis: bool,
    #[serde(default = "default_true")]
    pub work_pattern_analysis: bool,
    #[serde(default = "default_true")]
    pub burnout_detection: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            duration_prediction: true,
            categorization: true,
            insight_generation: true,
            productivity_analysis: true,
            work_pattern_analysis: true,
            burnout_detection: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    /// Predictions scoring below this are suppressed.
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,
    #[serde(default = "default_max_latency_ms")]
    pub max_latency_ms: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: default_confidence_threshold(),
            max_latency_ms: default_max_latency_ms(),
            batch_size: default_batch_size(),
        }
    }
}

fn default_confidence_threshold() -> f32 {
    0.7
}
fn default_max_latency_ms() -> u64 {
    100
}
fn default_batch_size() -> usize {
    10
}

/// Knobs for calls to remote providers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout_ms(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
        }
    }
}

fn default_request_timeout_ms() -> u64 {
    30_000
}
fn default_temperature() -> f32 {
    0.3
}
fn default_max_tokens() -> u32 {
    500
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrainingPolicy {
    /// Category validation accuracy below this is flagged after training.
    #[serde(default = "default_accuracy_threshold")]
    pub accuracy_threshold: f32,
    /// New completed tasks needed since the last training.
    #[serde(default = "default_min_new_samples")]
    pub min_new_samples: usize,
    /// Models older than this are retrained regardless of sample growth.
    #[serde(default = "default_max_data_age_days")]
    pub max_data_age_days: u32,
    #[serde(default = "default_true")]
    pub auto_retrain: bool,
}

impl Default for RetrainingPolicy {
    fn default() -> Self {
        Self {
            accuracy_threshold: default_accuracy_threshold(),
            min_new_samples: default_min_new_samples(),
            max_data_age_days: default_max_data_age_days(),
            auto_retrain: true,
        }
    }
}

fn default_accuracy_threshold() -> f32 {
    0.85
}
fn default_min_new_samples() -> usize {
    100
}
fn default_max_data_age_days() -> u32 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TrainingConfig {
    /// Fixed seed for weight initialisation and shuffling.
    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
