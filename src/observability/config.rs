//! Logging configuration
//!
//! Loaded from environment variables at process start.

/// Output format of the fmt subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Logging configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// `EnvFilter` directives (TIERVAULT_LOG, then RUST_LOG, default: info)
    pub filter: String,
    /// TIERVAULT_LOG_FORMAT: `text` (default) or `json`
    pub format: LogFormat,
    /// Include span/target information in each line
    pub with_target: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            filter: "info".to_string(),
            format: LogFormat::Text,
            with_target: false,
        }
    }
}

impl LogConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = LogConfig::default();
        LogConfig {
            filter: lookup("TIERVAULT_LOG")
                .or_else(|| lookup("RUST_LOG"))
                .filter(|s| !s.trim().is_empty())
                .unwrap_or(defaults.filter),
            format: match lookup("TIERVAULT_LOG_FORMAT").as_deref() {
                Some(v) if v.eq_ignore_ascii_case("json") => LogFormat::Json,
                _ => LogFormat::Text,
            },
            with_target: lookup("TIERVAULT_LOG_TARGET")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(defaults.with_target),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = LogConfig::from_lookup(|_| None);
        assert_eq!(config.filter, "info");
        assert_eq!(config.format, LogFormat::Text);
    }

    #[test]
    fn test_tiervault_log_wins_over_rust_log() {
        let config = LogConfig::from_lookup(|name| match name {
            "TIERVAULT_LOG" => Some("tiervault=debug".to_string()),
            "RUST_LOG" => Some("warn".to_string()),
            "TIERVAULT_LOG_FORMAT" => Some("JSON".to_string()),
            _ => None,
        });
        assert_eq!(config.filter, "tiervault=debug");
        assert_eq!(config.format, LogFormat::Json);
    }
}
