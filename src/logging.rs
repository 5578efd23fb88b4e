//! Tracing setup for the command line application.
//!
//! `RUST_LOG` takes precedence over the configured level so a single module
//! can be turned up without touching the config file:
//!
//! ```bash
//! RUST_LOG=daq_driver_basler=trace basler-daq grab --frames 10
//! ```

use crate::config::ApplicationConfig;
use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Output format for tracing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human readable, colored when writing to a terminal
    Pretty,
    /// JSON lines for log aggregation
    Json,
}

/// Parse a log level name, case-insensitively.
pub fn parse_log_level(level: &str) -> Result<Level, String> {
    level
        .parse::<Level>()
        .map_err(|_| format!("Invalid log level '{}'", level))
}

/// Install the global subscriber described by the application config.
pub fn init_from_config(config: &ApplicationConfig) -> anyhow::Result<()> {
    let level = parse_log_level(&config.log_level).map_err(anyhow::Error::msg)?;
    let format = if config.json_logs {
        OutputFormat::Json
    } else {
        OutputFormat::Pretty
    };
    init(level, format)
}

/// Install the global subscriber.
///
/// Fails if a subscriber was already installed.
pub fn init(level: Level, format: OutputFormat) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_ascii_lowercase()));

    let layer = match format {
        OutputFormat::Pretty => fmt::layer().with_target(true).boxed(),
        OutputFormat::Json => fmt::layer().json().with_current_span(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(layer)
        .try_init()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_level() {
        assert_eq!(parse_log_level("debug").unwrap(), Level::DEBUG);
        assert_eq!(parse_log_level("WARN").unwrap(), Level::WARN);
        assert!(parse_log_level("chatty").is_err());
    }
}
