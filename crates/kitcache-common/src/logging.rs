//! Logging configuration and setup.

use std::str::FromStr;

use thiserror::Error;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Errors raised while installing the global subscriber.
#[derive(Error, Debug)]
pub enum LoggingError {
    #[error("Invalid log filter: {0}")]
    InvalidFilter(String),

    #[error("Unknown log format: {0}")]
    UnknownFormat(String),

    #[error("Subscriber already installed: {0}")]
    AlreadyInstalled(String),
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable format.
    #[default]
    Pretty,
    /// Compact single-line format.
    Compact,
    /// JSON format for structured logging.
    Json,
}

impl FromStr for LogFormat {
    type Err = LoggingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            other => Err(LoggingError::UnknownFormat(other.to_string())),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level used when no filter is given.
    pub level: Level,
    /// Output format.
    pub format: LogFormat,
    /// Include source file location.
    pub include_location: bool,
    /// Include span events (enter, exit).
    pub include_span_events: bool,
    /// Custom filter string (e.g., "kitcache_sw=debug,reqwest=warn").
    pub filter: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Pretty,
            include_location: false,
            include_span_events: false,
            filter: None,
        }
    }
}

impl LogConfig {
    /// Create a debug configuration.
    pub fn debug() -> Self {
        Self {
            level: Level::DEBUG,
            include_location: true,
            include_span_events: true,
            ..Default::default()
        }
    }

    /// Set a custom filter.
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    /// Set the output format.
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    fn env_filter(&self) -> Result<EnvFilter, LoggingError> {
        match self.filter {
            Some(ref custom) => {
                EnvFilter::try_new(custom).map_err(|e| LoggingError::InvalidFilter(e.to_string()))
            }
            None => Ok(EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(self.level.to_string()))),
        }
    }
}

/// Install the global tracing subscriber described by `config`.
pub fn init_logging(config: &LogConfig) -> Result<(), LoggingError> {
    let filter = config.env_filter()?;

    let span_events = if config.include_span_events {
        FmtSpan::ENTER | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let registry = tracing_subscriber::registry().with(filter);

    let result = match config.format {
        LogFormat::Pretty => registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_file(config.include_location)
                    .with_line_number(config.include_location)
                    .with_span_events(span_events),
            )
            .try_init(),
        LogFormat::Compact => registry
            .with(
                fmt::layer()
                    .compact()
                    .with_target(true)
                    .with_span_events(span_events),
            )
            .try_init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_span_events(span_events))
            .try_init(),
    };

    result.map_err(|e| LoggingError::AlreadyInstalled(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_config_default() {
        let config = LogConfig::default();
        assert_eq!(config.level, Level::INFO);
        assert_eq!(config.format, LogFormat::Pretty);
        assert!(!config.include_location);
    }

    #[test]
    fn test_log_config_debug() {
        let config = LogConfig::debug();
        assert_eq!(config.level, Level::DEBUG);
        assert!(config.include_location);
    }

    #[test]
    fn test_log_format_parse() {
        assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("Compact".parse::<LogFormat>().unwrap(), LogFormat::Compact);
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_invalid_filter_rejected() {
        let config = LogConfig::default().with_filter("kitcache=loudest");
        assert!(matches!(
            config.env_filter(),
            Err(LoggingError::InvalidFilter(_))
        ));
    }
}
