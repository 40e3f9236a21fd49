//! Chooses between the local models and a remote provider, and runs the
//! remote leg of a prediction.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use kz_core::{AiConfig, Task};
use kz_telemetry::metrics::REMOTE_LATENCY_SECONDS;
use kz_telemetry::MetricsCollector;

use crate::parsing::{parse_category_reply, parse_duration_reply};
use crate::prediction::{CategoryPrediction, DurationPrediction};
use crate::prompts::{category_prompt, duration_prompt};
use crate::providers::{HttpTransport, InferenceBackend, PredictionTask, ProviderError, RemoteProvider};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Local,
    Remote(RemoteProvider),
}

impl Route {
    pub fn provider_label(self) -> &'static str {
        match self {
            Route::Local => "local",
            Route::Remote(p) => p.name(),
        }
    }
}

pub struct ProviderRouter {
    transport: Arc<dyn HttpTransport>,
    metrics: Arc<MetricsCollector>,
}

impl ProviderRouter {
    pub fn new(transport: Arc<dyn HttpTransport>, metrics: Arc<MetricsCollector>) -> Self {
        Self { transport, metrics }
    }

    pub fn route(config: &AiConfig) -> Route {
        match RemoteProvider::from_kind(config.selected_provider) {
            Some(provider) => Route::Remote(provider),
            None => Route::Local,
        }
    }

    pub async fn remote_duration(
        &self,
        provider: RemoteProvider,
        config: &AiConfig,
        task: &Task,
    ) -> Result<DurationPrediction, ProviderError> {
        let text = self
            .complete(provider, config, &duration_prompt(task), PredictionTask::Duration)
            .await?;
        let reply = parse_duration_reply(&text, task)?;
        Ok(DurationPrediction {
            task_id: task.id,
            estimated_minutes: reply.minutes,
            confidence: reply.confidence,
            factors: reply.factors,
            created_at: Utc::now(),
            model_version: provider.version_tag(),
        })
    }

    pub async fn remote_category(
        &self,
        provider: RemoteProvider,
        config: &AiConfig,
        task: &Task,
    ) -> Result<CategoryPrediction, ProviderError> {
        let text = self
            .complete(provider, config, &category_prompt(task), PredictionTask::Category)
            .await?;
        let reply = parse_category_reply(&text, task)?;
        Ok(CategoryPrediction {
            task_id: task.id,
            category: reply.category,
            confidence: reply.confidence,
            suggested_tags: reply.tags,
            reasoning: reply.reasoning,
            created_at: Utc::now(),
            model_version: provider.version_tag(),
        })
    }

    /// One POST, no retry. Returns the provider's generated text.
    async fn complete(
        &self,
        provider: RemoteProvider,
        config: &AiConfig,
        prompt: &str,
        task: PredictionTask,
    ) -> Result<String, ProviderError> {
        let settings = provider.settings(config)?;
        let request = provider.build_request(prompt, task, &settings)?;

        let started = Instant::now();
        let result = self.transport.post_json(&request, settings.timeout).await;
        self.metrics
            .observe_seconds(REMOTE_LATENCY_SECONDS, started.elapsed().as_secs_f64());

        let response = result?;
        if !response.is_success() {
            return Err(ProviderError::Api {
                status: response.status,
                message: truncate(&response.body, 200),
            });
        }
        provider.extract_text(&response.body)
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    let mut out: String = text.chars().take(max_chars).collect();
    if text.chars().count() > max_chars {
        out.push_str("...");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::MockTransport;
    use kz_core::ProviderKind;
    use serde_json::json;

    fn router(mock: Arc<MockTransport>) -> (ProviderRouter, Arc<MetricsCollector>) {
        let metrics = Arc::new(MetricsCollector::new());
        (ProviderRouter::new(mock, metrics.clone()), metrics)
    }

    #[test]
    fn local_provider_routes_locally() {
        assert_eq!(ProviderRouter::route(&AiConfig::local()), Route::Local);
        let cfg = AiConfig::local().with_provider(ProviderKind::Gemini);
        assert_eq!(ProviderRouter::route(&cfg), Route::Remote(RemoteProvider::Gemini));
        assert_eq!(Route::Remote(RemoteProvider::Gemini).provider_label(), "gemini");
    }

    #[tokio::test]
    async fn openai_duration_roundtrip() {
        let mock = Arc::new(MockTransport::new().with_json(json!({
            "choices": [{ "message": { "content": "Sure: {\"minutes\": 45, \"confidence\": 0.9}" } }]
        })));
        let (router, metrics) = router(mock.clone());
        let cfg = AiConfig::local()
            .with_provider(ProviderKind::OpenAi)
            .with_api_key("sk-1");
        let task = Task::new(3, "Write report");

        let p = router
            .remote_duration(RemoteProvider::OpenAi, &cfg, &task)
            .await
            .unwrap();
        assert_eq!(p.task_id, 3);
        assert_eq!(p.estimated_minutes, 45);
        assert_eq!(p.model_version, "openai-api");
        assert_eq!(metrics.histogram_count(REMOTE_LATENCY_SECONDS), 1);

        let sent = &mock.captured_requests()[0];
        assert!(sent.body["messages"][1]["content"]
            .as_str()
            .unwrap()
            .contains("Write report"));
    }

    #[tokio::test]
    async fn non_success_status_is_an_api_error() {
        let mock = Arc::new(MockTransport::new().with_status(429, "slow down"));
        let (router, _) = router(mock);
        let cfg = AiConfig::local()
            .with_provider(ProviderKind::Gemini)
            .with_api_key("g");
        let err = router
            .remote_category(RemoteProvider::Gemini, &cfg, &Task::new(1, "x"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Api { status: 429, .. }));
    }

    #[tokio::test]
    async fn missing_key_never_reaches_transport() {
        let mock = Arc::new(MockTransport::new());
        let (router, _) = router(mock.clone());
        let cfg = AiConfig::local().with_provider(ProviderKind::OpenAi);
        let err = router
            .remote_duration(RemoteProvider::OpenAi, &cfg, &Task::new(1, "x"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::NotConfigured(_)));
        assert!(mock.captured_requests().is_empty());
    }

    #[tokio::test]
    async fn custom_category_from_predictions_array() {
        let mock = Arc::new(MockTransport::new().with_json(json!({
            "predictions": [{ "category": "Estudos", "confidence": 0.88 }]
        })));
        let (router, _) = router(mock.clone());
        let cfg = AiConfig::local()
            .with_provider(ProviderKind::Custom)
            .with_api_url("http://models.local");
        let p = router
            .remote_category(RemoteProvider::Custom, &cfg, &Task::new(8, "Ler livro"))
            .await
            .unwrap();
        assert_eq!(p.category, crate::features::TaskCategory::Study);
        assert!((p.confidence - 0.88).abs() < 1e-6);
        assert_eq!(p.model_version, "custom-api");
        assert_eq!(mock.captured_requests()[0].body["type"], "category");
    }
}
