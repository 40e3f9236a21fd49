//! End-to-end tests for `PredictiveEngine`: routing, the confidence gate,
//! feature flags, and configuration swaps. Remote providers run against
//! `MockTransport`.

use std::sync::Arc;

use chrono::{NaiveDate, NaiveDateTime, TimeZone, Utc};
use kz_core::{AiConfig, MemoryArtifactStore, ProviderKind, Task, TaskPriority};
use kz_intelligence::features::{extract_duration_features_at, DURATION_FEATURES};
use kz_intelligence::runtime::duration_confidence;
use kz_intelligence::{MockTransport, Outcome, PredictiveEngine, TaskCategory};
use kz_telemetry::PredictionKind;
use serde_json::json;

fn engine_with(mock: Arc<MockTransport>) -> PredictiveEngine {
    PredictiveEngine::new(Arc::new(MemoryArtifactStore::new()), mock)
}

fn seeded(config: AiConfig) -> AiConfig {
    let mut config = config;
    config.training.seed = Some(7);
    config
}

fn monday_morning() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 5, 6)
        .unwrap()
        .and_hms_opt(9, 30, 0)
        .unwrap()
}

fn urgent_project_meeting() -> Task {
    Task::new(42, "Reunião de projeto urgente").with_priority(TaskPriority::High)
}

// ===========================================================================
// Lifecycle
// ===========================================================================

#[tokio::test]
async fn test_calls_before_initialize_are_not_initialized() {
    let engine = engine_with(Arc::new(MockTransport::new()));
    let task = Task::new(1, "anything");

    assert!(!engine.is_initialized().await);
    assert_eq!(engine.predict_duration(&task).await, Outcome::NotInitialized);
    assert_eq!(engine.predict_category(&task).await, Outcome::NotInitialized);
    assert!(engine.generate_insights(&[task]).await.is_empty());
    assert!(engine.local_runtime().await.is_none());
}

#[tokio::test]
async fn test_disabled_engine_answers_disabled() {
    let engine = engine_with(Arc::new(MockTransport::new()));
    engine.initialize(AiConfig::disabled()).await;
    let task = Task::new(1, "Comprar pão");

    assert!(engine.is_initialized().await);
    assert_eq!(engine.predict_duration(&task).await, Outcome::Disabled);
    assert_eq!(engine.predict_category(&task).await, Outcome::Disabled);
    assert!(engine.generate_insights(&[task]).await.is_empty());
    // A disabled engine never loads models.
    assert!(engine.local_runtime().await.is_none());
}

#[tokio::test]
async fn test_initialize_twice_keeps_the_loaded_models() {
    let engine = engine_with(Arc::new(MockTransport::new()));
    engine.initialize(seeded(AiConfig::local())).await;
    let first = engine.local_runtime().await.unwrap();
    engine.initialize(seeded(AiConfig::local())).await;
    let second = engine.local_runtime().await.unwrap();
    assert!(Arc::ptr_eq(&first, &second));
}

#[tokio::test]
async fn test_feature_flag_disables_one_prediction_kind() {
    let engine = engine_with(Arc::new(MockTransport::new()));
    let mut config = seeded(AiConfig::local()).with_confidence_threshold(0.0);
    config.features.categorization = false;
    engine.initialize(config).await;

    let task = Task::new(5, "Estudo de álgebra");
    assert_eq!(engine.predict_category(&task).await, Outcome::Disabled);
    assert!(engine
        .predict_duration_at(&task, monday_morning())
        .await
        .is_ready());
}

// ===========================================================================
// Local predictions
// ===========================================================================

#[tokio::test]
async fn test_local_duration_confidence_is_gated() {
    let engine = engine_with(Arc::new(MockTransport::new()));
    engine
        .initialize(seeded(AiConfig::local()).with_confidence_threshold(0.7))
        .await;

    let task = urgent_project_meeting();
    let at = monday_morning();
    let features = extract_duration_features_at(&task, &at);
    assert_eq!(features.len(), DURATION_FEATURES);
    assert_eq!(features[2], 1.0, "high priority");
    assert_eq!(features[5], 1.0, "meeting");
    assert_eq!(features[6], 1.0, "project");
    assert_eq!(features[7], 1.0, "urgent");

    let runtime = engine.local_runtime().await.unwrap();
    let raw = runtime.predict_duration(&features).await.unwrap();
    assert!(raw.minutes >= 5);
    assert!((raw.confidence - duration_confidence(&features, raw.minutes)).abs() < 1e-6);

    match engine.predict_duration_at(&task, at).await {
        Outcome::Ready(p) => {
            assert!(p.confidence >= 0.7);
            assert_eq!(p.estimated_minutes, raw.minutes);
            assert_eq!(p.task_id, 42);
            assert_eq!(p.model_version, "local-1.0.0");
            assert!(p.factors.contains(&"Meeting".to_string()));
        }
        Outcome::Suppressed {
            confidence,
            threshold,
        } => {
            assert!(confidence < 0.7);
            assert!((threshold - 0.7).abs() < 1e-6);
            assert!((confidence - raw.confidence).abs() < 1e-6);
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[tokio::test]
async fn test_zero_threshold_always_returns_local_predictions() {
    let engine = engine_with(Arc::new(MockTransport::new()));
    engine
        .initialize(seeded(AiConfig::local()).with_confidence_threshold(0.0))
        .await;

    let task = Task::new(9, "Estudo para a prova de cálculo");
    let Outcome::Ready(category) = engine.predict_category(&task).await else {
        panic!("expected a category prediction");
    };
    assert!((0.0..=1.0).contains(&category.confidence));
    assert!(category.reasoning.starts_with("Categorized as"));
    assert!(category.suggested_tags.contains(&category.category.as_str().to_string()));

    let metrics = engine.metrics();
    assert_eq!(metrics.predictions(PredictionKind::Category, "local", "ready"), 1);
}

#[tokio::test]
async fn test_full_threshold_suppresses_local_predictions() {
    let engine = engine_with(Arc::new(MockTransport::new()));
    engine
        .initialize(seeded(AiConfig::local()).with_confidence_threshold(1.0))
        .await;

    // Local duration confidence is capped at 0.95.
    let outcome = engine
        .predict_duration_at(&urgent_project_meeting(), monday_morning())
        .await;
    assert!(matches!(outcome, Outcome::Suppressed { .. }));
    assert_eq!(
        engine
            .metrics()
            .predictions(PredictionKind::Duration, "local", "suppressed"),
        1
    );
}

// ===========================================================================
// Remote predictions
// ===========================================================================

#[tokio::test]
async fn test_openai_duration_through_engine() {
    let mock = Arc::new(MockTransport::new().with_json(json!({
        "choices": [{ "message": { "content": "{\"minutes\": 45, \"confidence\": 0.9, \"factors\": [\"Research\"]}" } }]
    })));
    let engine = engine_with(mock.clone());
    engine
        .initialize(
            AiConfig::local()
                .with_provider(ProviderKind::OpenAi)
                .with_api_key("sk-test"),
        )
        .await;

    let Outcome::Ready(p) = engine.predict_duration(&Task::new(3, "Write report")).await else {
        panic!("expected a remote prediction");
    };
    assert_eq!(p.estimated_minutes, 45);
    assert!((p.confidence - 0.9).abs() < 1e-6);
    assert_eq!(p.factors, vec!["Research".to_string()]);
    assert_eq!(p.model_version, "openai-api");

    let sent = mock.captured_requests();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].url.ends_with("/chat/completions"));
    assert_eq!(sent[0].header("Authorization"), Some("Bearer sk-test"));
    assert_eq!(
        engine
            .metrics()
            .predictions(PredictionKind::Duration, "openai", "ready"),
        1
    );
}

#[tokio::test]
async fn test_gemini_category_through_engine() {
    let mock = Arc::new(MockTransport::new().with_json(json!({
        "candidates": [{ "content": { "parts": [{ "text": "{\"category\": \"Saúde\", \"confidence\": 0.85, \"tags\": [\"médico\"]}" }] } }]
    })));
    let engine = engine_with(mock.clone());
    engine
        .initialize(
            AiConfig::local()
                .with_provider(ProviderKind::Gemini)
                .with_api_key("g-key"),
        )
        .await;

    let Outcome::Ready(p) = engine
        .predict_category(&Task::new(4, "Consulta no médico"))
        .await
    else {
        panic!("expected a remote prediction");
    };
    assert_eq!(p.category, TaskCategory::Health);
    assert_eq!(p.suggested_tags, vec!["médico".to_string()]);
    assert!(mock.captured_requests()[0].url.contains(":generateContent?key=g-key"));
}

#[tokio::test]
async fn test_custom_provider_uses_configured_url() {
    let mock = Arc::new(MockTransport::new().with_json(json!({ "minutes": 20, "confidence": 0.8 })));
    let engine = engine_with(mock.clone());
    engine
        .initialize(
            AiConfig::local()
                .with_provider(ProviderKind::Custom)
                .with_api_url("http://models.internal:8080"),
        )
        .await;

    let Outcome::Ready(p) = engine.predict_duration(&Task::new(6, "Pagar conta de luz")).await else {
        panic!("expected a remote prediction");
    };
    assert_eq!(p.estimated_minutes, 20);
    assert_eq!(p.model_version, "custom-api");

    let sent = &mock.captured_requests()[0];
    assert_eq!(sent.url, "http://models.internal:8080/predict");
    assert_eq!(sent.body["type"], "duration");
}

#[tokio::test]
async fn test_missing_api_key_is_not_configured() {
    let mock = Arc::new(MockTransport::new());
    let engine = engine_with(mock.clone());
    engine
        .initialize(AiConfig::local().with_provider(ProviderKind::OpenAi))
        .await;

    let outcome = engine.predict_duration(&Task::new(1, "x")).await;
    assert!(matches!(outcome, Outcome::NotConfigured(_)));
    assert!(mock.captured_requests().is_empty());
}

#[tokio::test]
async fn test_server_error_is_unavailable_and_engine_keeps_serving() {
    let mock = Arc::new(
        MockTransport::new()
            .with_status(500, "internal error")
            .with_json(json!({ "choices": [{ "message": { "content": "{\"category\": \"Work\", \"confidence\": 0.9}" } }] })),
    );
    let engine = engine_with(mock);
    engine
        .initialize(
            AiConfig::local()
                .with_provider(ProviderKind::OpenAi)
                .with_api_key("sk"),
        )
        .await;

    let task = Task::new(2, "Relatório da empresa");
    let first = engine.predict_category(&task).await;
    let Outcome::Unavailable(reason) = first else {
        panic!("expected unavailable, got {first:?}");
    };
    assert!(reason.contains("500"));

    assert!(engine.predict_category(&task).await.is_ready());
}

#[tokio::test]
async fn test_remote_bare_number_is_suppressed_at_default_threshold() {
    let mock = Arc::new(MockTransport::new().with_json(json!({
        "choices": [{ "message": { "content": "Roughly 30 minutes." } }]
    })));
    let engine = engine_with(mock);
    engine
        .initialize(
            AiConfig::local()
                .with_provider(ProviderKind::OpenAi)
                .with_api_key("sk")
                .with_confidence_threshold(0.7),
        )
        .await;

    let outcome = engine.predict_duration(&Task::new(2, "Something")).await;
    let Outcome::Suppressed { confidence, .. } = outcome else {
        panic!("expected suppressed, got {outcome:?}");
    };
    assert!((confidence - 0.6).abs() < 1e-6);
}

#[tokio::test]
async fn test_update_config_switches_route() {
    let mock = Arc::new(MockTransport::new().with_json(json!({ "minutes": 15, "confidence": 0.95 })));
    let engine = engine_with(mock.clone());
    engine
        .initialize(seeded(AiConfig::local()).with_confidence_threshold(0.0))
        .await;

    let task = Task::new(11, "Lavar o carro");
    let local = engine.predict_duration_at(&task, monday_morning()).await;
    assert_eq!(local.into_option().unwrap().model_version, "local-1.0.0");
    assert!(mock.captured_requests().is_empty());

    engine
        .update_config(
            AiConfig::local()
                .with_provider(ProviderKind::Custom)
                .with_api_url("http://localhost:9000"),
        )
        .await;
    let remote = engine.predict_duration(&task).await;
    assert_eq!(remote.into_option().unwrap().model_version, "custom-api");
    assert_eq!(mock.captured_requests().len(), 1);

    engine.update_config(AiConfig::disabled()).await;
    assert_eq!(engine.predict_duration(&task).await, Outcome::Disabled);
}

// ===========================================================================
// Insights
// ===========================================================================

#[tokio::test]
async fn test_insights_respect_flags() {
    let engine = engine_with(Arc::new(MockTransport::new()));
    let done = Utc.with_ymd_and_hms(2024, 5, 9, 10, 0, 0).unwrap();
    let tasks: Vec<Task> = (0..6)
        .map(|i| Task::new(i, format!("task {i}")).with_created_at(done).completed(done))
        .collect();

    let mut config = seeded(AiConfig::local());
    config.features.insight_generation = false;
    engine.initialize(config.clone()).await;
    assert!(engine.generate_insights(&tasks).await.is_empty());

    config.features.insight_generation = true;
    config.features.work_pattern_analysis = false;
    engine.update_config(config).await;
    let insights = engine.generate_insights(&tasks).await;
    assert_eq!(insights.len(), 1);
    assert_eq!(insights[0].insight_type, kz_intelligence::InsightType::ProductivityHigh);
}
