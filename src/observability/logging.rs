//! Structured logging configuration.

use crate::config::LoggingSettings;
use std::path::PathBuf;

/// Default filter when neither config nor environment set one.
const DEFAULT_FILTER: &str = "hashwatch=info,warn";

/// Log line format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// One JSON object per event.
    Json,
    /// Human-readable multi-line output.
    #[default]
    Pretty,
}

impl LogFormat {
    /// Parses a format name; unknown names fall back to pretty.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "json" => Self::Json,
            _ => Self::Pretty,
        }
    }
}

/// Resolved logging configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    /// Output format.
    pub format: LogFormat,
    /// `EnvFilter` directive.
    pub filter: String,
    /// Log file; stderr when `None`.
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::default(),
            filter: DEFAULT_FILTER.to_string(),
            file: None,
        }
    }
}

impl LoggingConfig {
    /// Builds logging configuration from config settings with env overrides.
    ///
    /// Filter precedence: `HASHWATCH_LOG`, `RUST_LOG`, `--verbose`, the
    /// config file, then the default. `HASHWATCH_LOG_FORMAT` and
    /// `HASHWATCH_LOG_FILE` override the format and file.
    #[must_use]
    pub fn from_settings(settings: Option<&LoggingSettings>, verbose: bool) -> Self {
        Self::resolve(settings, verbose, |key| std::env::var(key).ok())
    }

    pub(crate) fn resolve<F>(settings: Option<&LoggingSettings>, verbose: bool, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let filter = non_empty("HASHWATCH_LOG")
            .or_else(|| non_empty("RUST_LOG"))
            .or_else(|| verbose.then(|| "hashwatch=debug,info".to_string()))
            .or_else(|| settings.and_then(|s| s.level.clone()))
            .unwrap_or_else(|| DEFAULT_FILTER.to_string());

        let format = non_empty("HASHWATCH_LOG_FORMAT")
            .or_else(|| settings.and_then(|s| s.format.clone()))
            .map_or_else(LogFormat::default, |f| LogFormat::parse(&f));

        let file = non_empty("HASHWATCH_LOG_FILE")
            .or_else(|| settings.and_then(|s| s.file.clone()))
            .map(PathBuf::from);

        Self {
            format,
            filter,
            file,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn resolve(
        settings: Option<&LoggingSettings>,
        verbose: bool,
        vars: &[(&str, &str)],
    ) -> LoggingConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        LoggingConfig::resolve(settings, verbose, |key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        assert_eq!(resolve(None, false, &[]), LoggingConfig::default());
    }

    #[test]
    fn test_filter_precedence() {
        let settings = LoggingSettings {
            level: Some("trace".to_string()),
            ..LoggingSettings::default()
        };
        assert_eq!(resolve(Some(&settings), false, &[]).filter, "trace");
        assert_eq!(resolve(Some(&settings), true, &[]).filter, "hashwatch=debug,info");
        assert_eq!(
            resolve(Some(&settings), true, &[("RUST_LOG", "error")]).filter,
            "error"
        );
        assert_eq!(
            resolve(
                Some(&settings),
                true,
                &[("RUST_LOG", "error"), ("HASHWATCH_LOG", "hashwatch=trace")]
            )
            .filter,
            "hashwatch=trace"
        );
    }

    #[test]
    fn test_format_and_file() {
        let settings = LoggingSettings {
            format: Some("JSON".to_string()),
            file: Some("/tmp/hw.log".to_string()),
            ..LoggingSettings::default()
        };
        let config = resolve(Some(&settings), false, &[]);
        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(config.file, Some(PathBuf::from("/tmp/hw.log")));

        let config = resolve(Some(&settings), false, &[("HASHWATCH_LOG_FORMAT", "pretty")]);
        assert_eq!(config.format, LogFormat::Pretty);
    }

    #[test]
    fn test_unknown_format_is_pretty() {
        assert_eq!(LogFormat::parse("xml"), LogFormat::Pretty);
    }
}
