use tracing_subscriber::{fmt, EnvFilter};

/// Output format for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Human,
    Json,
}

impl LogFormat {
    pub fn from_json_flag(json: bool) -> Self {
        if json {
            LogFormat::Json
        } else {
            LogFormat::Human
        }
    }
}

/// Build the filter: `RUST_LOG` when set and valid, else `default_level`
/// (e.g. "info" or "kz_intelligence=debug,warn"), else plain "info".
fn build_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Initialize the global subscriber in the requested format.
///
/// Returns `false` when a subscriber was already installed (tests, repeated
/// CLI setup); the existing one is kept.
pub fn init(service_name: &str, default_level: &str, format: LogFormat) -> bool {
    let filter = build_filter(default_level);
    let installed = match format {
        LogFormat::Human => fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(false)
            .with_level(true)
            .try_init()
            .is_ok(),
        LogFormat::Json => fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .with_level(true)
            .try_init()
            .is_ok(),
    };

    if installed {
        tracing::info!(service = service_name, format = ?format, "logging initialised");
    }
    installed
}

/// Human-readable logging. Safe to call multiple times.
pub fn init_logging(service_name: &str, default_level: &str) -> bool {
    init(service_name, default_level, LogFormat::Human)
}

/// JSON logging. Safe to call multiple times.
pub fn init_logging_json(service_name: &str, default_level: &str) -> bool {
    init(service_name, default_level, LogFormat::Json)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_init_is_a_noop() {
        let _ = init_logging("kz-test", "debug");
        assert!(!init_logging_json("kz-test", "debug"));
    }

    #[test]
    fn invalid_level_falls_back() {
        // Must not panic on garbage directives.
        let _ = build_filter("not a [valid filter");
    }

    #[test]
    fn format_from_flag() {
        assert_eq!(LogFormat::from_json_flag(true), LogFormat::Json);
        assert_eq!(LogFormat::from_json_flag(false), LogFormat::Human);
    }
}
