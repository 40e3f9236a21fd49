//! Observability for the Krigzis insights engine.
//!
//! - **Logging**: `tracing-subscriber` setup, human-readable or JSON lines,
//!   filtered through `RUST_LOG` or the configured level.
//! - **Metrics**: an in-process collector counting prediction and training
//!   outcomes, with Prometheus text export.

pub mod logging;
pub mod metrics;

pub use logging::{init_logging, init_logging_json, LogFormat};
pub use metrics::{MetricsCollector, PredictionKind};
