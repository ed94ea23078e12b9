//! Tracing subscriber setup.

use std::str::FromStr;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry};

/// Filter directives, e.g. `babble=debug,babble_realtime=trace`.
pub const LOG_ENV: &str = "BABBLE_LOG";
/// `pretty` or `json`.
pub const LOG_FORMAT_ENV: &str = "BABBLE_LOG_FORMAT";
pub const DEFAULT_FILTER: &str = "babble=info";

/// Output format of the fmt layer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = TelemetryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(TelemetryError::InvalidFormat(other.to_string())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("Invalid log filter '{filter}': {reason}")]
    InvalidFilter { filter: String, reason: String },
    #[error("Unknown log format '{0}' (expected 'pretty' or 'json')")]
    InvalidFormat(String),
    #[error("Failed to init subscriber: {0}")]
    Init(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    pub filter: String,
    pub format: LogFormat,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            filter: DEFAULT_FILTER.to_string(),
            format: LogFormat::default(),
        }
    }
}

impl TelemetryConfig {
    /// Read `BABBLE_LOG` and `BABBLE_LOG_FORMAT`. An unknown format falls
    /// back to pretty.
    pub fn from_env() -> Self {
        Self {
            filter: std::env::var(LOG_ENV)
                .ok()
                .filter(|f| !f.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_FILTER.to_string()),
            format: std::env::var(LOG_FORMAT_ENV)
                .ok()
                .and_then(|f| f.parse().ok())
                .unwrap_or_default(),
        }
    }

    pub fn env_filter(&self) -> Result<EnvFilter, TelemetryError> {
        EnvFilter::try_new(&self.filter).map_err(|e| TelemetryError::InvalidFilter {
            filter: self.filter.clone(),
            reason: e.to_string(),
        })
    }
}

/// Install the global subscriber. Call once at startup; a second call
/// returns [`TelemetryError::Init`].
pub fn init_tracing(config: &TelemetryConfig) -> Result<(), TelemetryError> {
    let filter = config.env_filter()?;
    let fmt_layer: Box<dyn Layer<Registry> + Send + Sync> = match config.format {
        LogFormat::Json => tracing_subscriber::fmt::layer().json().boxed(),
        LogFormat::Pretty => tracing_subscriber::fmt::layer().pretty().boxed(),
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(filter)
        .try_init()
        .map_err(|e| TelemetryError::Init(e.to_string()))?;

    tracing::info!(filter = %config.filter, format = ?config.format, "Tracing initialised");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_parsing() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!(" pretty ".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert!(matches!(
            "xml".parse::<LogFormat>(),
            Err(TelemetryError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_default_filter_parses() {
        let config = TelemetryConfig::default();
        assert_eq!(config.filter, DEFAULT_FILTER);
        assert!(config.env_filter().is_ok());
    }

    #[test]
    fn test_invalid_filter_is_reported() {
        let config = TelemetryConfig {
            filter: "babble=loud".to_string(),
            format: LogFormat::Json,
        };
        assert!(matches!(
            config.env_filter(),
            Err(TelemetryError::InvalidFilter { .. })
        ));
    }
}
