//! Tracing/logging initialization.

use tracing_subscriber::EnvFilter;

/// Output format of log lines.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// One JSON object per line (production default).
    #[default]
    Json,
    /// Human-readable text.
    Text,
}

/// Logging settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// `EnvFilter` directive, e.g. `info,flagkeeper_infra=debug`.
    pub filter: String,
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            format: LogFormat::Json,
        }
    }
}

impl LogConfig {
    /// `RUST_LOG` for the filter, `LOG_FORMAT` (`json` | `text`) for the format.
    pub fn from_env() -> Self {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(filter) = lookup("RUST_LOG").filter(|f| !f.trim().is_empty()) {
            config.filter = filter;
        }
        if let Some(format) = lookup("LOG_FORMAT") {
            // Unknown values keep the JSON default.
            if format.trim().eq_ignore_ascii_case("text") {
                config.format = LogFormat::Text;
            }
        }
        config
    }
}

/// Initialize tracing/logging for the process.
///
/// Safe to call multiple times (subsequent calls are no-ops). Returns whether
/// this call installed the subscriber.
pub fn init(config: &LogConfig) -> bool {
    let filter = EnvFilter::try_new(&config.filter).unwrap_or_else(|_| EnvFilter::new("info"));

    match config.format {
        LogFormat::Json => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .with_timer(tracing_subscriber::fmt::time::SystemTime)
            .with_target(false)
            .try_init()
            .is_ok(),
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .try_init()
            .is_ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_overrides_defaults() {
        let config = LogConfig::from_lookup(|var| match var {
            "RUST_LOG" => Some("debug,sqlx=warn".to_string()),
            "LOG_FORMAT" => Some("Text".to_string()),
            _ => None,
        });
        assert_eq!(config.filter, "debug,sqlx=warn");
        assert_eq!(config.format, LogFormat::Text);
    }

    #[test]
    fn unknown_format_keeps_json() {
        let config = LogConfig::from_lookup(|var| match var {
            "LOG_FORMAT" => Some("yaml".to_string()),
            _ => None,
        });
        assert_eq!(config, LogConfig::default());
    }

    #[test]
    fn second_init_is_a_no_op() {
        let config = LogConfig {
            filter: "not a == valid filter".to_string(),
            format: LogFormat::Text,
        };
        init(&config);
        assert!(!init(&LogConfig::default()));
    }
}
